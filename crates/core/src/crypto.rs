//! Authenticated symmetric encryption for the wire
//!
//! AES-256-GCM over a shared key. Sealed blobs are
//! `nonce(12) || ciphertext || auth_tag(16)`, URL-safe base64 encoded so they
//! travel as opaque ASCII bytes inside frames. The key file is a single line
//! of URL-safe base64 holding exactly 32 bytes of entropy.

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use rand::RngCore;

/// Raw key length in bytes, before base64 encoding
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A shared-key cipher for sealing frame fields
#[derive(Clone)]
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    /// Build a cipher from raw key bytes
    #[must_use]
    pub fn from_key_bytes(key: &[u8; KEY_LEN]) -> Self {
        Self {
            inner: Aes256Gcm::new(key.into()),
        }
    }

    /// Build a cipher from a URL-safe base64 key string
    ///
    /// # Errors
    /// Returns an error if the string is not base64 or not 32 bytes
    pub fn from_key_string(encoded: &str) -> Result<Self> {
        let raw = URL_SAFE
            .decode(encoded.trim())
            .map_err(|e| eyre!("key is not valid base64: {e}"))?;
        let key: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| eyre!("key must decode to exactly {KEY_LEN} bytes"))?;
        Ok(Self::from_key_bytes(&key))
    }

    /// Load the key file (single line, URL-safe base64)
    ///
    /// # Errors
    /// Returns an error if the file is missing, unreadable, or malformed
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| eyre!("cannot read key file {}: {e}", path.display()))?;
        Self::from_key_string(&contents)
    }

    /// Generate a fresh key as its file representation
    #[must_use]
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        URL_SAFE.encode(key)
    }

    /// Seal a plaintext into an opaque ASCII blob
    ///
    /// # Errors
    /// Returns an error if encryption fails
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext)
            .map_err(|e| eyre!("encryption failed: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(blob).into_bytes())
    }

    /// Open a sealed blob. An authentication failure here is fatal for the
    /// connection that produced it.
    ///
    /// # Errors
    /// Returns an error on malformed input or a failed authentication tag
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(sealed).map_err(|_| eyre!("sealed blob is not ASCII"))?;
        let blob = URL_SAFE
            .decode(text)
            .map_err(|e| eyre!("sealed blob is not valid base64: {e}"))?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(eyre!("sealed blob too short"));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| eyre!("authentication failed"))
    }
}

/// Write a key to disk, owner-readable only on Unix
///
/// # Errors
/// Returns an error if the file cannot be written
pub fn write_key_file(path: &Path, key: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, format!("{key}\n"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_key_string(&Cipher::generate_key()).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher();
        let sealed = c.seal(b"hello sync world").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"hello sync world");
    }

    #[test]
    fn test_sealed_blob_is_ascii() {
        let c = cipher();
        let sealed = c.seal(b"payload").unwrap();
        assert!(sealed.iter().all(u8::is_ascii));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().seal(b"secret").unwrap();
        assert!(cipher().open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_blob_fails() {
        let c = cipher();
        let mut sealed = c.seal(b"secret").unwrap();
        // Flip a character inside the base64 body
        let mid = sealed.len() / 2;
        sealed[mid] = if sealed[mid] == b'A' { b'B' } else { b'A' };
        assert!(c.open(&sealed).is_err());
    }

    #[test]
    fn test_nonces_differ_across_seals() {
        let c = cipher();
        let a = c.seal(b"same").unwrap();
        let b = c.seal(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.open(&a).unwrap(), c.open(&b).unwrap());
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.key");

        let key = Cipher::generate_key();
        write_key_file(&path, &key).unwrap();

        let c = Cipher::from_key_file(&path).unwrap();
        let sealed = c.seal(b"via file").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"via file");
    }

    #[test]
    fn test_missing_key_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Cipher::from_key_file(&dir.path().join("absent.key")).is_err());
    }

    #[test]
    fn test_short_key_rejected() {
        let short = URL_SAFE.encode([0u8; 16]);
        assert!(Cipher::from_key_string(&short).is_err());
    }
}
