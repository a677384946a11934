//! The proot sandbox: command line, environment, and process spawning.
//!
//! A container process runs as
//! `proot -0 -r <rootfs> -w <dir> [-b host:guest[:ro]]... <essential binds> <command>`
//! with a cleared environment rebuilt from the container configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use pocketbox_common::config::EngineConfig;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::ContainerConfig;
use tokio::process::Command;

use crate::logs::LogPaths;
use crate::process::ContainerProcess;

const RESOLV_CONF: &str = "nameserver 8.8.8.8\nnameserver 8.8.4.4\n";
const HOSTS: &str = "127.0.0.1 localhost\n::1 localhost\n";
const GUEST_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host paths bound into every container when the host has them.
const OPTIONAL_DEVICE_BINDS: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

/// Launches container processes through proot.
#[derive(Debug, Clone)]
pub struct Sandbox {
    binary: Option<PathBuf>,
    loader: Option<PathBuf>,
    loader_32: Option<PathBuf>,
    tmp_dir: PathBuf,
}

impl Sandbox {
    /// Locates proot: the configured binary, else `proot` on `PATH`.
    ///
    /// A missing binary is not an error here; spawning reports it.
    #[must_use]
    pub fn discover(config: &EngineConfig) -> Self {
        let binary = config
            .sandbox_binary
            .clone()
            .or_else(|| which::which("proot").ok());
        match &binary {
            Some(path) => tracing::debug!(binary = %path.display(), "sandbox binary found"),
            None => tracing::warn!("proot not found; containers cannot be started"),
        }
        Self {
            binary,
            loader: config.loader.clone(),
            loader_32: config.loader_32.clone(),
            tmp_dir: config.tmp_dir(),
        }
    }

    /// Path of the proot binary, if one was found.
    #[must_use]
    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// Builds the proot arguments for `config`, checking host paths on disk.
    #[must_use]
    pub fn command_line(
        &self,
        rootfs: &Path,
        config: &ContainerConfig,
        command: Option<&[String]>,
    ) -> Vec<String> {
        command_line_with(rootfs, config, command, Path::exists)
    }

    /// Environment of a container process: proot settings and guest
    /// defaults, with the container's own variables layered on top.
    #[must_use]
    pub fn environment(&self, config: &ContainerConfig) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(loader) = &self.loader {
            if loader.exists() {
                let _ = env.insert("PROOT_LOADER".into(), loader.display().to_string());
            } else {
                tracing::warn!(loader = %loader.display(), "proot loader missing, skipping");
            }
        }
        if let Some(loader) = self.loader_32.as_ref().filter(|l| l.exists()) {
            let _ = env.insert("PROOT_LOADER_32".into(), loader.display().to_string());
        }
        let _ = env.insert("PROOT_TMP_DIR".into(), self.tmp_dir.display().to_string());

        let user = if config.user.is_empty() {
            "root"
        } else {
            config.user.as_str()
        };
        for (key, value) in [
            ("HOME", "/root"),
            ("USER", user),
            ("HOSTNAME", config.hostname.as_str()),
            ("TERM", "xterm-256color"),
            ("PATH", GUEST_PATH),
            ("LANG", "C.UTF-8"),
            ("ANDROID_ROOT", "/system"),
            ("ANDROID_DATA", "/data"),
        ] {
            let _ = env.insert(key.to_string(), value.to_string());
        }
        env.extend(config.env.clone());
        env
    }

    /// Spawns a process for `config` inside `rootfs`, capturing its output
    /// in `logs`.
    ///
    /// `command` overrides the configured entrypoint and cmd. Everything
    /// that touches the filesystem before the spawn runs on the blocking
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Spawn`] if the rootfs or the proot binary
    /// is missing or the process cannot be started, and an I/O error if the
    /// log files or rootfs defaults cannot be written.
    pub async fn spawn(
        &self,
        rootfs: &Path,
        config: &ContainerConfig,
        command: Option<&[String]>,
        logs: LogPaths,
    ) -> Result<ContainerProcess> {
        let binary = self.binary.as_deref().ok_or_else(|| PocketboxError::Spawn {
            message: "proot binary not found".into(),
        })?;
        let (args, env, stdout, stderr) = {
            let sandbox = self.clone();
            let rootfs = rootfs.to_path_buf();
            let config = config.clone();
            let command = command.map(<[String]>::to_vec);
            let logs = logs.clone();
            tokio::task::spawn_blocking(move || {
                prepare_rootfs(&rootfs)?;
                let tmp_dir = &sandbox.tmp_dir;
                std::fs::create_dir_all(tmp_dir).map_err(|e| PocketboxError::io(tmp_dir, e))?;
                let args = sandbox.command_line(&rootfs, &config, command.as_deref());
                let env = sandbox.environment(&config);
                let (stdout, stderr) = logs.open()?;
                Ok::<_, PocketboxError>((args, env, stdout, stderr))
            })
            .await
            .map_err(|e| PocketboxError::Cancelled {
                operation: format!("sandbox preparation: {e}"),
            })??
        };
        tracing::debug!(binary = %binary.display(), ?args, "spawning sandbox process");

        let child = Command::new(binary)
            .args(&args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| PocketboxError::Spawn {
                message: format!("failed to execute {}: {e}", binary.display()),
            })?;
        ContainerProcess::watch(child, logs)
    }

    /// Runs `proot --version` and extracts a human-readable version.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Spawn`] if proot is missing or cannot run.
    pub async fn probe_version(&self) -> Result<String> {
        let binary = self.binary.as_deref().ok_or_else(|| PocketboxError::Spawn {
            message: "proot binary not found".into(),
        })?;
        let mut command = Command::new(binary);
        let _ = command.arg("--version").env_clear();
        if let Some(loader) = self.loader.as_ref().filter(|l| l.exists()) {
            let _ = command.env("PROOT_LOADER", loader);
        }
        let output = command.output().await.map_err(|e| PocketboxError::Spawn {
            message: format!("failed to execute {}: {e}", binary.display()),
        })?;
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Builds the proot arguments, consulting `host_has` for optional binds.
pub fn command_line_with(
    rootfs: &Path,
    config: &ContainerConfig,
    command: Option<&[String]>,
    host_has: impl Fn(&Path) -> bool,
) -> Vec<String> {
    let working_dir = if config.working_dir.is_empty() {
        "/"
    } else {
        config.working_dir.as_str()
    };
    let mut args = vec![
        "-0".to_string(),
        "-r".to_string(),
        rootfs.display().to_string(),
        "-w".to_string(),
        working_dir.to_string(),
    ];

    let mut bind = |spec: String| {
        args.push("-b".to_string());
        args.push(spec);
    };
    for user_bind in &config.binds {
        bind(user_bind.to_arg());
    }
    for device in OPTIONAL_DEVICE_BINDS {
        if host_has(Path::new(device)) {
            bind((*device).to_string());
        }
    }
    bind("/proc".to_string());
    if host_has(Path::new("/sys")) {
        bind("/sys".to_string());
    }
    for android in ["/system", "/vendor"] {
        if host_has(Path::new(android)) {
            bind(format!("{android}:{android}"));
        }
    }

    match command {
        Some(command) if !command.is_empty() => args.extend(command.iter().cloned()),
        _ => args.extend(config.command_line()),
    }
    args
}

/// Ensures `rootfs` exists and has `/etc/resolv.conf` and `/etc/hosts`.
///
/// Existing files are left untouched.
///
/// # Errors
///
/// Returns [`PocketboxError::Spawn`] if `rootfs` does not exist, and an I/O
/// error if a file cannot be written.
pub fn prepare_rootfs(rootfs: &Path) -> Result<()> {
    if !rootfs.is_dir() {
        return Err(PocketboxError::Spawn {
            message: format!("root filesystem missing: {}", rootfs.display()),
        });
    }
    let etc = rootfs.join("etc");
    std::fs::create_dir_all(&etc).map_err(|e| PocketboxError::io(&etc, e))?;
    for (name, contents) in [("resolv.conf", RESOLV_CONF), ("hosts", HOSTS)] {
        let path = etc.join(name);
        if path.symlink_metadata().is_err() {
            std::fs::write(&path, contents).map_err(|e| PocketboxError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Extracts the version from `proot --version` output.
///
/// The version follows the last `|` on the last line of the ASCII-art
/// banner. Without it, the accelerator line is summarised instead.
#[must_use]
pub fn parse_version(output: &str) -> String {
    let banner_version = output
        .lines()
        .find(|l| l.contains("|__|"))
        .and_then(|l| l.rsplit('|').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(version) = banner_version {
        return format!("PRoot {version}");
    }
    if let Some(accelerators) = output.lines().find(|l| l.contains("built-in accelerators")) {
        let seccomp = if accelerators.contains("seccomp_filter = yes") {
            "seccomp enabled"
        } else {
            "seccomp disabled"
        };
        return format!("PRoot ({seccomp})");
    }
    "PRoot (version unknown)".to_string()
}

#[cfg(test)]
mod tests {
    use pocketbox_common::constants::DEFAULT_SHELL;
    use pocketbox_common::records::Bind;
    use pocketbox_common::types::ContainerId;

    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig {
            cmd: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            working_dir: "/srv".into(),
            ..ContainerConfig::default()
        }
    }

    #[test]
    fn command_line_with_all_host_paths() {
        let mut config = config();
        config.binds.push(Bind {
            host_path: PathBuf::from("/data"),
            container_path: "/mnt/data".into(),
            read_only: true,
        });

        let args = command_line_with(Path::new("/rootfs"), &config, None, |_| true);
        let expected: Vec<String> = [
            "-0", "-r", "/rootfs", "-w", "/srv",
            "-b", "/data:/mnt/data:ro",
            "-b", "/dev/null", "-b", "/dev/zero", "-b", "/dev/random", "-b", "/dev/urandom",
            "-b", "/proc", "-b", "/sys",
            "-b", "/system:/system", "-b", "/vendor:/vendor",
            "/bin/sh", "-c", "echo hi",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn command_line_skips_absent_host_paths() {
        let args = command_line_with(Path::new("/r"), &config(), None, |_| false);
        assert_eq!(
            args,
            ["-0", "-r", "/r", "-w", "/srv", "-b", "/proc", "/bin/sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn command_override_and_fallback() {
        let over = vec!["ls".to_string(), "-l".to_string()];
        let args = command_line_with(Path::new("/r"), &config(), Some(&over), |_| false);
        assert_eq!(&args[args.len() - 2..], ["ls", "-l"]);

        let bare = ContainerConfig {
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            ..ContainerConfig::default()
        };
        let args = command_line_with(Path::new("/r"), &bare, None, |_| false);
        assert_eq!(args.last().map(String::as_str), Some(DEFAULT_SHELL));
    }

    #[test]
    fn environment_layers_container_env_on_top() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::discover(&EngineConfig::with_data_dir(dir.path()));
        let mut config = config();
        config.hostname = "box".into();
        let _ = config.env.insert("PATH".into(), "/opt/bin".into());
        let _ = config.env.insert("APP".into(), "1".into());

        let env = sandbox.environment(&config);
        assert_eq!(env["PATH"], "/opt/bin");
        assert_eq!(env["APP"], "1");
        assert_eq!(env["HOME"], "/root");
        assert_eq!(env["USER"], "root");
        assert_eq!(env["HOSTNAME"], "box");
        assert_eq!(env["LANG"], "C.UTF-8");
        assert_eq!(env["PROOT_TMP_DIR"], dir.path().join("tmp").display().to_string());
        assert!(!env.contains_key("PROOT_LOADER"));
    }

    #[test]
    fn environment_skips_missing_loader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = dir.path().join("loader");
        let mut engine = EngineConfig::with_data_dir(dir.path());
        engine.loader = Some(dir.path().join("missing-loader"));
        engine.loader_32 = Some(loader.clone());
        std::fs::write(&loader, b"").expect("write");

        let env = Sandbox::discover(&engine).environment(&config());
        assert!(!env.contains_key("PROOT_LOADER"));
        assert_eq!(env["PROOT_LOADER_32"], loader.display().to_string());
    }

    #[test]
    fn prepare_rootfs_writes_missing_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("mkdir");
        std::fs::write(dir.path().join("etc/hosts"), "10.0.0.1 custom\n").expect("write");

        prepare_rootfs(dir.path()).expect("prepare");

        let resolv = std::fs::read_to_string(dir.path().join("etc/resolv.conf")).expect("read");
        assert_eq!(resolv, "nameserver 8.8.8.8\nnameserver 8.8.4.4\n");
        let hosts = std::fs::read_to_string(dir.path().join("etc/hosts")).expect("read");
        assert_eq!(hosts, "10.0.0.1 custom\n");
    }

    #[test]
    fn prepare_rootfs_requires_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = prepare_rootfs(&dir.path().join("absent")).expect_err("missing");
        assert!(matches!(err, PocketboxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn spawn_without_rootfs_fails_before_starting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = EngineConfig::with_data_dir(dir.path());
        engine.sandbox_binary = Some(PathBuf::from("/bin/true"));
        let logs = LogPaths::for_container(dir.path(), &ContainerId::new("x"));

        let err = Sandbox::discover(&engine)
            .spawn(&dir.path().join("rootfs"), &config(), None, logs.clone())
            .await
            .expect_err("no rootfs");
        assert!(matches!(err, PocketboxError::Spawn { .. }));
        assert!(!logs.dir.exists());
    }

    #[test]
    fn parse_version_from_banner() {
        let output = concat!(
            " _____ _____              ___\n",
            "|  __ \\  __ \\_____  _____|   |_\n",
            "|   __/     /  _  \\/  _  \\    _|\n",
            "|__|  |__|__\\_____/\\_____/\\____| 5.4.0\n",
            "\n",
            "built-in accelerators: process_vm = yes, seccomp_filter = yes\n",
        );
        assert_eq!(parse_version(output), "PRoot 5.4.0");
    }

    #[test]
    fn parse_version_fallbacks() {
        assert_eq!(
            parse_version("built-in accelerators: process_vm = no, seccomp_filter = yes"),
            "PRoot (seccomp enabled)"
        );
        assert_eq!(
            parse_version("built-in accelerators: seccomp_filter = no"),
            "PRoot (seccomp disabled)"
        );
        assert_eq!(parse_version(""), "PRoot (version unknown)");
    }
}
