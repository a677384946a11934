//! Container log files.
//!
//! The main process writes to `logs/<id>/stdout` and `logs/<id>/stderr`;
//! every exec'd process gets its own pair under `logs/<id>/exec/<seq>/`,
//! with `seq` never reused for a container.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use pocketbox_common::constants::{STDERR_FILE, STDOUT_FILE};
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::types::ContainerId;

const EXEC_DIR: &str = "exec";

/// Locations of one process's captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// Directory holding both files.
    pub dir: PathBuf,
    /// Captured standard output.
    pub stdout: PathBuf,
    /// Captured standard error.
    pub stderr: PathBuf,
}

impl LogPaths {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            stdout: dir.join(STDOUT_FILE),
            stderr: dir.join(STDERR_FILE),
            dir,
        }
    }

    /// Log files of a container's main process.
    #[must_use]
    pub fn for_container(logs_dir: &Path, id: &ContainerId) -> Self {
        Self::in_dir(container_log_dir(logs_dir, id))
    }

    /// Log files of the `seq`-th exec'd process of a container.
    #[must_use]
    pub fn for_exec(logs_dir: &Path, id: &ContainerId, seq: u64) -> Self {
        Self::in_dir(
            container_log_dir(logs_dir, id)
                .join(EXEC_DIR)
                .join(seq.to_string()),
        )
    }

    /// Allocates log files for a new exec'd process of a container.
    ///
    /// Sequence numbers continue after the directories already on disk, so
    /// an exec never shares files with one from an earlier engine session.
    ///
    /// # Errors
    ///
    /// Returns an error if the exec log directory cannot be read or created.
    pub fn next_exec(logs_dir: &Path, id: &ContainerId) -> Result<Self> {
        let exec_dir = container_log_dir(logs_dir, id).join(EXEC_DIR);
        std::fs::create_dir_all(&exec_dir).map_err(|e| PocketboxError::io(&exec_dir, e))?;
        let last = std::fs::read_dir(&exec_dir)
            .map_err(|e| PocketboxError::io(&exec_dir, e))?
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        let mut seq = last + 1;
        loop {
            let paths = Self::for_exec(logs_dir, id, seq);
            match std::fs::create_dir(&paths.dir) {
                Ok(()) => return Ok(paths),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(PocketboxError::io(&paths.dir, e)),
            }
        }
    }

    /// Opens both files for appending, creating them as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or files cannot be created.
    pub fn open(&self) -> Result<(File, File)> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PocketboxError::io(&self.dir, e))?;
        Ok((append(&self.stdout)?, append(&self.stderr)?))
    }
}

fn append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PocketboxError::io(path, e))
}

fn container_log_dir(logs_dir: &Path, id: &ContainerId) -> PathBuf {
    logs_dir.join(id.as_str())
}

/// Captured output of a container's main process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Reads a container's main-process logs.
///
/// Returns empty strings for files that do not exist yet.
///
/// # Errors
///
/// Returns an error if a file exists but cannot be read.
pub fn read_logs(logs_dir: &Path, id: &ContainerId) -> Result<ContainerLogs> {
    let paths = LogPaths::for_container(logs_dir, id);
    Ok(ContainerLogs {
        stdout: read_if_exists(&paths.stdout)?,
        stderr: read_if_exists(&paths.stderr)?,
    })
}

fn read_if_exists(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PocketboxError::io(path, e)),
    }
}

/// Deletes every log file of a container, ignoring missing directories.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be removed.
pub fn remove_logs(logs_dir: &Path, id: &ContainerId) -> Result<()> {
    let dir = container_log_dir(logs_dir, id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PocketboxError::io(&dir, e)),
    }
}
