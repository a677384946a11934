//! Content-addressed storage of layer archives.
//!
//! Archives live at `layers/<hex>.tar.gz`. Downloads are written to a
//! `.partial` sibling and renamed into place once verified.

use std::path::{Path, PathBuf};

use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::types::Sha256Hash;

/// Manages the on-disk layer archive cache.
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Opens or initializes the layer store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| PocketboxError::io(&root, e))?;
        tracing::debug!(path = %root.display(), "opened layer store");
        Ok(Self { root })
    }

    /// Returns the archive path of a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if `digest` is not a valid `sha256:` digest.
    pub fn layer_path(&self, digest: &str) -> Result<PathBuf> {
        let hash = Sha256Hash::from_digest(digest)?;
        Ok(self.root.join(format!("{}.tar.gz", hash.as_hex())))
    }

    /// Returns the in-progress download path of a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if `digest` is not a valid `sha256:` digest.
    pub fn partial_path(&self, digest: &str) -> Result<PathBuf> {
        let hash = Sha256Hash::from_digest(digest)?;
        Ok(self.root.join(format!("{}.tar.gz.partial", hash.as_hex())))
    }

    /// Checks whether a layer archive exists in the cache.
    #[must_use]
    pub fn has_layer(&self, digest: &str) -> bool {
        self.layer_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Deletes a layer archive, ignoring missing files.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be deleted.
    pub fn remove_layer(&self, digest: &str) -> Result<()> {
        let path = self.layer_path(digest)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(digest, "removed layer archive");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PocketboxError::io(path, e)),
        }
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
