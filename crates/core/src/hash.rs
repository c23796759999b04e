//! Content fingerprinting using MD5 hex digests
//!
//! MD5 is used for change detection only, never for security. Digests are
//! lowercase hex strings; a deleted entry carries the empty string instead.

use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

/// Read buffer size for streaming file digests
pub const DIGEST_CHUNK: usize = 64 * 1024;

/// Digest an in-memory buffer
#[must_use]
pub fn bytes_digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Digest a file by streaming it in 64 KiB chunks
///
/// # Errors
/// Returns an error if the file cannot be opened or read
pub fn file_digest(path: &Path) -> color_eyre::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; DIGEST_CHUNK];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
