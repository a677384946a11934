//! Domain primitive types used across the Pocketbox workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PocketboxError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a container image: the hex part of its config digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    /// Creates a new image ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the image ID from a config digest (`sha256:<hex>`).
    #[must_use]
    pub fn from_digest(digest: &str) -> Self {
        Self(digest.strip_prefix("sha256:").unwrap_or(digest).to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first twelve characters, as shown in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 hash digest used for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(String);

impl Sha256Hash {
    /// Creates a hash from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid 64-character hex string.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != crate::constants::SHA256_HEX_LENGTH
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(PocketboxError::Integrity {
                message: format!("invalid SHA-256 hex string: {hex}"),
            });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    /// Parses an OCI digest of the form `sha256:<hex>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is not `sha256` or the hex part is invalid.
    pub fn from_digest(digest: &str) -> Result<Self> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| PocketboxError::Integrity {
                message: format!("unsupported digest algorithm: {digest}"),
            })?;
        Self::from_hex(hex)
    }

    /// Returns the hex-encoded hash string.
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

/// Lifecycle state of a container.
///
/// `Removed` is terminal. `Dead` only accepts removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but never started, or rehydrated from storage.
    Created,
    /// The main process is being spawned.
    Starting,
    /// The main process is alive.
    Running,
    /// All processes are being terminated.
    Stopping,
    /// Every process has terminated.
    Exited {
        /// Exit code of the main process, if it exited normally.
        exit_code: Option<i32>,
    },
    /// Startup failed.
    Dead {
        /// Description of the startup failure.
        reason: String,
    },
    /// The container directory and record are being deleted.
    Removing,
    /// The container no longer exists.
    Removed,
}

impl ContainerState {
    /// Short lowercase name of the state, without payload.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited { .. } => "exited",
            Self::Dead { .. } => "dead",
            Self::Removing => "removing",
            Self::Removed => "removed",
        }
    }

    /// Returns `true` once the container can never run again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited {
                exit_code: Some(code),
            } => write!(f, "exited ({code})"),
            Self::Dead { reason } => write!(f, "dead: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}
