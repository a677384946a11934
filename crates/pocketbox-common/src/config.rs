//! Engine configuration model.
//!
//! The configuration is read from `<data_dir>/config.json` when the file
//! exists; every field is optional in the file and falls back to the values
//! in [`crate::constants`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{PocketboxError, Result};
use crate::types::ContainerId;

/// Root configuration for the Pocketbox engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base directory for all state and data.
    pub data_dir: PathBuf,
    /// Explicit sandbox binary. Looked up on `PATH` when unset.
    pub sandbox_binary: Option<PathBuf>,
    /// Loader exported as `PROOT_LOADER`.
    pub loader: Option<PathBuf>,
    /// 32-bit loader exported as `PROOT_LOADER_32`.
    pub loader_32: Option<PathBuf>,
    /// Target architecture in OCI notation (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// Target operating system in OCI notation.
    pub os: String,
    /// Timeout of a single mirror health check, in seconds.
    pub health_check_timeout_secs: u64,
    /// Timeout of registry API requests, in seconds.
    pub network_timeout_secs: u64,
    /// Timeout of a single layer download, in seconds.
    pub download_timeout_secs: u64,
    /// Interval between background mirror health checks, in seconds.
    pub mirror_check_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL, in seconds.
    pub stop_grace_period_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::default_data_dir(),
            sandbox_binary: None,
            loader: None,
            loader_32: None,
            architecture: current_arch().to_string(),
            os: "linux".to_string(),
            health_check_timeout_secs: constants::HEALTH_CHECK_TIMEOUT.as_secs(),
            network_timeout_secs: constants::NETWORK_TIMEOUT.as_secs(),
            download_timeout_secs: constants::DOWNLOAD_TIMEOUT.as_secs(),
            mirror_check_interval_secs: constants::MIRROR_CHECK_INTERVAL.as_secs(),
            stop_grace_period_secs: constants::STOP_GRACE_PERIOD.as_secs(),
        }
    }
}

impl EngineConfig {
    /// Creates a default configuration rooted at `data_dir`.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads `<data_dir>/config.json`, or returns the defaults if it is absent.
    ///
    /// The `data_dir` argument always wins over a value stored in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(constants::CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::with_data_dir(data_dir));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| PocketboxError::io(&path, e))?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Writes the configuration to `<data_dir>/config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file written.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| PocketboxError::io(&self.data_dir, e))?;
        let path = self.data_dir.join(constants::CONFIG_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| PocketboxError::io(&path, e))
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Config`] if a timeout is zero or the
    /// architecture is empty.
    pub fn validate(&self) -> Result<()> {
        if self.architecture.is_empty() || self.os.is_empty() {
            return Err(PocketboxError::Config {
                message: "architecture and os must not be empty".into(),
            });
        }
        let timeouts = [
            ("health_check_timeout_secs", self.health_check_timeout_secs),
            ("network_timeout_secs", self.network_timeout_secs),
            ("download_timeout_secs", self.download_timeout_secs),
            ("mirror_check_interval_secs", self.mirror_check_interval_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(PocketboxError::Config {
                message: format!("{name} must be greater than zero"),
            });
        }
        Ok(())
    }

    /// Health check timeout.
    #[must_use]
    pub const fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    /// Registry API timeout.
    #[must_use]
    pub const fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// Layer download timeout.
    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Interval between background mirror checks.
    #[must_use]
    pub const fn mirror_check_interval(&self) -> Duration {
        Duration::from_secs(self.mirror_check_interval_secs)
    }

    /// Grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Directory holding the per-container directories.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join(constants::CONTAINERS_DIR)
    }

    /// Directory owned by one container.
    #[must_use]
    pub fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.containers_dir().join(id.as_str())
    }

    /// Root filesystem of one container.
    #[must_use]
    pub fn rootfs_dir(&self, id: &ContainerId) -> PathBuf {
        self.container_dir(id).join(constants::ROOTFS_DIR)
    }

    /// Directory holding layer archives.
    #[must_use]
    pub fn layers_dir(&self) -> PathBuf {
        self.data_dir.join(constants::LAYERS_DIR)
    }

    /// Directory holding captured output.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join(constants::LOGS_DIR)
    }

    /// Directory holding the metadata tables.
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join(constants::DB_DIR)
    }

    /// Scratch directory for the sandbox.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join(constants::TMP_DIR)
    }
}

/// Maps the host CPU architecture to OCI notation.
#[must_use]
pub fn current_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults_rooted_at_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load_or_default(dir.path()).expect("load");
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.health_check_timeout(), Duration::from_secs(15));
        assert_eq!(config.layers_dir(), dir.path().join("layers"));
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "architecture": "riscv64", "stop_grace_period_secs": 2 }"#,
        )
        .expect("write");

        let config = EngineConfig::load_or_default(dir.path()).expect("load");
        assert_eq!(config.architecture, "riscv64");
        assert_eq!(config.stop_grace_period(), Duration::from_secs(2));
        assert_eq!(config.os, "linux");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "network_timeout_secs": 0 }"#,
        )
        .expect("write");
        assert!(EngineConfig::load_or_default(dir.path()).is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.loader = Some(PathBuf::from("/opt/proot/loader"));
        config.save().expect("save");

        let loaded = EngineConfig::load_or_default(dir.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn container_paths_are_nested_under_data_dir() {
        let config = EngineConfig::with_data_dir("/data");
        let id = ContainerId::new("abc");
        assert_eq!(config.rootfs_dir(&id), PathBuf::from("/data/containers/abc/rootfs"));
    }
}
