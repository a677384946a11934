//! SHA-256 content verification.
//!
//! Validates the integrity of downloaded layer archives against the digest
//! the registry advertised for them.

use std::path::Path;

use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::types::Sha256Hash;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<Sha256Hash> {
    tracing::debug!(path = %path.display(), "computing SHA-256 hash");
    let mut file = std::fs::File::open(path).map_err(|e| PocketboxError::io(path, e))?;
    let mut hasher = Sha256::new();
    let _ = std::io::copy(&mut file, &mut hasher).map_err(|e| PocketboxError::io(path, e))?;
    Sha256Hash::from_hex(format!("{:x}", hasher.finalize()))
}

/// Validates that a file matches the expected SHA-256 hash.
///
/// # Errors
///
/// Returns `PocketboxError::HashMismatch` if the hashes do not match.
pub fn validate_hash(path: &Path, expected: &Sha256Hash) -> Result<()> {
    tracing::debug!(path = %path.display(), "validating SHA-256 hash");
    let actual = hash_file(path)?;
    if &actual != expected {
        return Err(PocketboxError::HashMismatch {
            resource: path.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
