//! Filesystem layer extraction.
//!
//! A container rootfs is built by unpacking every image layer in manifest
//! order (bottom to top) into one directory. Whiteout entries from upper
//! layers delete content unpacked by lower ones:
//!
//! - `.wh.<name>` removes `<name>` from the same directory.
//! - `.wh..wh..opq` empties the directory it appears in.

use std::io::Read;
use std::path::{Component, Path};

use pocketbox_common::error::{PocketboxError, Result};

use crate::storage::LayerStore;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Extracts a tar archive to the target directory.
///
/// Supports both plain and gzip-compressed archives; compression is
/// detected from the gzip magic bytes. Device nodes are skipped since they
/// cannot be created without privileges. Returns the number of entries
/// unpacked.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or an entry cannot be
/// written.
pub fn extract_layer(archive_path: &Path, target: &Path) -> Result<usize> {
    tracing::debug!(
        archive = %archive_path.display(),
        target = %target.display(),
        "extracting layer"
    );

    std::fs::create_dir_all(target).map_err(|e| PocketboxError::io(target, e))?;
    let file = std::fs::File::open(archive_path).map_err(|e| PocketboxError::io(archive_path, e))?;

    let unpacked = if is_gzip_archive(archive_path)? {
        unpack(flate2::read::GzDecoder::new(file), target)?
    } else {
        unpack(file, target)?
    };

    tracing::debug!(archive = %archive_path.display(), entries = unpacked, "layer extracted");
    Ok(unpacked)
}

/// Builds a root filesystem from layers, applied in the given order.
///
/// The rootfs directory is deleted again if any layer fails, so a
/// half-assembled tree is never left behind.
///
/// # Errors
///
/// Returns an error if a layer is missing from the store or fails to unpack.
pub fn assemble_rootfs(store: &LayerStore, digests: &[String], rootfs: &Path) -> Result<()> {
    let result = digests.iter().try_for_each(|digest| {
        let archive = store.layer_path(digest)?;
        if !archive.is_file() {
            return Err(PocketboxError::NotFound {
                kind: "layer",
                id: digest.clone(),
            });
        }
        extract_layer(&archive, rootfs).map(|_| ())
    });

    if let Err(e) = result {
        tracing::warn!(rootfs = %rootfs.display(), error = %e, "rootfs assembly failed");
        if rootfs.exists() {
            let _ = std::fs::remove_dir_all(rootfs);
        }
        return Err(e);
    }

    tracing::info!(rootfs = %rootfs.display(), layers = digests.len(), "rootfs assembled");
    Ok(())
}

fn unpack<R: Read>(reader: R, target: &Path) -> Result<usize> {
    let io_err = |e: std::io::Error| PocketboxError::io(target, e);
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut unpacked = 0;
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let path = entry.path().map_err(io_err)?.into_owned();
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            tracing::warn!(path = %path.display(), "skipping entry escaping the rootfs");
            continue;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = target.join(path.parent().unwrap_or_else(|| Path::new("")));

        if file_name == WHITEOUT_OPAQUE {
            clear_directory(&parent)?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(hidden))?;
            continue;
        }
        if matches!(
            entry.header().entry_type(),
            tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo
        ) {
            tracing::trace!(path = %path.display(), "skipping device node");
            continue;
        }

        let _ = entry.unpack_in(target).map_err(io_err)?;
        unpacked += 1;
    }
    Ok(unpacked)
}

fn clear_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| PocketboxError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PocketboxError::io(dir, e))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| PocketboxError::io(path, e))
}

/// Determines whether the archive is gzip-compressed from its magic bytes.
fn is_gzip_archive(path: &Path) -> Result<bool> {
    let mut file = std::fs::File::open(path).map_err(|e| PocketboxError::io(path, e))?;
    let mut magic = [0u8; 2];
    Ok(file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b])
}
