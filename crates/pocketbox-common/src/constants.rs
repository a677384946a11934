//! System-wide constants and default paths.

use std::path::PathBuf;
use std::time::Duration;

/// Fallback data directory when no home directory can be resolved.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/pocketbox";

/// Returns the default data directory, `$HOME/.pocketbox` when `HOME` is set.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(SYSTEM_DATA_DIR),
        |home| PathBuf::from(home).join(".pocketbox"),
    )
}

/// Directory holding one extracted root filesystem per container.
pub const CONTAINERS_DIR: &str = "containers";
/// Directory holding compressed layer archives.
pub const LAYERS_DIR: &str = "layers";
/// Directory holding captured process output.
pub const LOGS_DIR: &str = "logs";
/// Directory holding the JSON metadata tables.
pub const DB_DIR: &str = "db";
/// Scratch directory handed to the sandbox.
pub const TMP_DIR: &str = "tmp";
/// Name of the rootfs directory inside a container directory.
pub const ROOTFS_DIR: &str = "rootfs";
/// Name of the optional configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// File capturing standard output.
pub const STDOUT_FILE: &str = "stdout";
/// File capturing standard error.
pub const STDERR_FILE: &str = "stderr";

/// Registry host of Docker Hub as written in image references.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
/// Docker Hub API endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";
/// Default tag applied when a reference has none.
pub const DEFAULT_TAG: &str = "latest";
/// Shell used when a container has no command.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Priority of the built-in mirrors.
pub const BUILT_IN_MIRROR_PRIORITY: i32 = 100;
/// Priority of user-added mirrors unless specified.
pub const CUSTOM_MIRROR_PRIORITY: i32 = 50;

/// Timeout of a single mirror health check.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout of registry API requests.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout of a single layer download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
/// Interval between background mirror health checks.
pub const MIRROR_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Time given to processes between SIGTERM and SIGKILL.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);
/// Lifetime of a registry token whose response carries no `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Application name used in CLI output.
pub const APP_NAME: &str = "pocketbox";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "pbx";

/// User agent sent to registries.
pub const USER_AGENT: &str = concat!("pocketbox/", env!("CARGO_PKG_VERSION"));
