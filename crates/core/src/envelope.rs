//! Compression envelope for file bodies and state documents
//!
//! Payloads travel as `{"compressed":bool,"data":<base64>}`. When compression
//! is enabled and the payload exceeds 1 KiB, `data` is zlib-deflated before
//! encoding; the receiver inspects the flag and inflates as needed.
//! Compression always happens before the frame layer's encryption.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use color_eyre::Result;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// Payloads at or below this size are never compressed
pub const COMPRESS_THRESHOLD: usize = 1024;

#[derive(Serialize, Deserialize)]
struct Envelope {
    compressed: bool,
    data: String,
}

/// Wrap a payload, compressing when worthwhile
///
/// # Errors
/// Returns an error if deflation fails
pub fn pack(payload: &[u8], compress: bool) -> Result<Vec<u8>> {
    let (compressed, body) = if compress && payload.len() > COMPRESS_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        (true, encoder.finish()?)
    } else {
        (false, payload.to_vec())
    };

    Ok(serde_json::to_vec(&Envelope {
        compressed,
        data: STANDARD.encode(body),
    })?)
}

/// Unwrap a payload produced by [`pack`]
///
/// # Errors
/// Returns an error on malformed JSON, bad base64, or corrupt zlib data
pub fn unpack(bytes: &[u8]) -> Result<Vec<u8>> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    let body = STANDARD.decode(envelope.data)?;

    if envelope.compressed {
        let mut payload = Vec::new();
        ZlibDecoder::new(body.as_slice()).read_to_end(&mut payload)?;
        Ok(payload)
    } else {
        Ok(body)
    }
}
