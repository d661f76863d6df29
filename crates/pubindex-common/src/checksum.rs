//! SHA-256 helpers for staged files and extracted documents

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the SHA-256 hex digest of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 hex digest of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Stable output file name for a document subject.
///
/// The same subject always maps to the same name, so re-extracting a
/// resource overwrites its previous document instead of adding a new one.
pub fn hashed_file_name(subject: &str, extension: &str) -> String {
    let digest = Sha256::digest(subject.as_bytes());
    format!("{}.{}", hex::encode(digest), extension)
}
