//! Length-prefixed wire framing
//!
//! Frame layout (integers big-endian):
//!
//! ```text
//! +----------+----------+-----------+-------------+
//! | cmd_len  | data_len |   cmd     |    data     |
//! | uint32   | uint32   | ASCII     | opaque      |
//! +----------+----------+-----------+-------------+
//! ```
//!
//! With encryption enabled, `cmd` and `data` are each independently sealed
//! and the lengths describe the sealed blobs. A failed authentication tag
//! surfaces as an error that terminates the connection.

use std::io::{Read, Write};

use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::crypto::Cipher;

/// Upper bound for a single frame's data section (64 MiB)
pub const MAX_DATA_LEN: u32 = 64 * 1024 * 1024;

/// Upper bound for the command token, sealed form included
pub const MAX_CMD_LEN: u32 = 256;

/// Encoder/decoder for one side of a connection
#[derive(Clone, Default)]
pub struct FrameCodec {
    cipher: Option<Cipher>,
}

impl FrameCodec {
    /// Codec without encryption
    #[must_use]
    pub fn plaintext() -> Self {
        Self { cipher: None }
    }

    /// Codec sealing every frame with the shared key
    #[must_use]
    pub fn encrypted(cipher: Cipher) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Write one frame and flush
    ///
    /// # Errors
    /// Returns an error on oversized payloads, sealing failures, or I/O errors
    pub fn write_frame<W: Write>(&self, writer: &mut W, cmd: &str, data: &[u8]) -> Result<()> {
        let (cmd_bytes, data_bytes) = match &self.cipher {
            Some(cipher) => (cipher.seal(cmd.as_bytes())?, cipher.seal(data)?),
            None => (cmd.as_bytes().to_vec(), data.to_vec()),
        };

        let cmd_len = u32::try_from(cmd_bytes.len()).map_err(|_| eyre!("command too long"))?;
        let data_len = u32::try_from(data_bytes.len()).map_err(|_| eyre!("frame too large"))?;
        if cmd_len > MAX_CMD_LEN {
            return Err(eyre!("command too long: {cmd_len} bytes"));
        }
        if data_len > MAX_DATA_LEN {
            return Err(eyre!("frame too large: {data_len} bytes"));
        }

        writer.write_all(&cmd_len.to_be_bytes())?;
        writer.write_all(&data_len.to_be_bytes())?;
        writer.write_all(&cmd_bytes)?;
        writer.write_all(&data_bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame, returning the command token and payload
    ///
    /// # Errors
    /// Returns an error on EOF, oversized lengths, or a failed seal
    pub fn read_frame<R: Read>(&self, reader: &mut R) -> Result<(String, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let cmd_len = u32::from_be_bytes(len_buf);
        reader.read_exact(&mut len_buf)?;
        let data_len = u32::from_be_bytes(len_buf);
        if cmd_len == 0 || cmd_len > MAX_CMD_LEN {
            return Err(eyre!("invalid command length: {cmd_len}"));
        }
        if data_len > MAX_DATA_LEN {
            return Err(eyre!("frame exceeds limit: {data_len} bytes"));
        }

        let mut cmd_bytes = vec![0u8; cmd_len as usize];
        reader.read_exact(&mut cmd_bytes)?;
        let mut data_bytes = vec![0u8; data_len as usize];
        reader.read_exact(&mut data_bytes)?;

        if let Some(cipher) = &self.cipher {
            cmd_bytes = cipher.open(&cmd_bytes)?;
            data_bytes = cipher.open(&data_bytes)?;
        }

        let cmd = String::from_utf8(cmd_bytes).map_err(|_| eyre!("command is not UTF-8"))?;
        Ok((cmd, data_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_plaintext_roundtrip() {
        let codec = FrameCodec::plaintext();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "HELLO", b"{\"x\":1}").unwrap();

        let (cmd, data) = codec.read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(cmd, "HELLO");
        assert_eq!(data, b"{\"x\":1}");
    }

    #[test]
    fn test_empty_data_roundtrip() {
        let codec = FrameCodec::plaintext();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "GET_STATE", b"").unwrap();

        let (cmd, data) = codec.read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(cmd, "GET_STATE");
        assert!(data.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_sequence() {
        let codec = FrameCodec::plaintext();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "OK", b"first").unwrap();
        codec.write_frame(&mut buf, "ERROR", b"second").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(codec.read_frame(&mut cursor).unwrap().0, "OK");
        let (cmd, data) = codec.read_frame(&mut cursor).unwrap();
        assert_eq!(cmd, "ERROR");
        assert_eq!(data, b"second");
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let cipher = Cipher::from_key_string(&Cipher::generate_key()).unwrap();
        let codec = FrameCodec::encrypted(cipher);

        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "FILE_CHUNK", b"binary \x00\x01\x02 body").unwrap();

        let (cmd, data) = codec.read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(cmd, "FILE_CHUNK");
        assert_eq!(data, b"binary \x00\x01\x02 body");
    }

    #[test]
    fn test_encrypted_frame_hides_command() {
        let cipher = Cipher::from_key_string(&Cipher::generate_key()).unwrap();
        let codec = FrameCodec::encrypted(cipher);

        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "SYNC_REQUEST", b"payload").unwrap();

        let window = buf.windows(b"SYNC_REQUEST".len());
        assert!(!window.clone().any(|w| w == b"SYNC_REQUEST"));
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let codec_a =
            FrameCodec::encrypted(Cipher::from_key_string(&Cipher::generate_key()).unwrap());
        let codec_b =
            FrameCodec::encrypted(Cipher::from_key_string(&Cipher::generate_key()).unwrap());

        let mut buf = Vec::new();
        codec_a.write_frame(&mut buf, "HELLO", b"hi").unwrap();
        assert!(codec_b.read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_plaintext_reader_rejects_encrypted_frame() {
        let encrypted =
            FrameCodec::encrypted(Cipher::from_key_string(&Cipher::generate_key()).unwrap());
        let plaintext = FrameCodec::plaintext();

        let mut buf = Vec::new();
        encrypted.write_frame(&mut buf, "HELLO", b"hi").unwrap();

        // The sealed command is not a known token; at worst it decodes as
        // garbage UTF-8, never as a valid command
        match plaintext.read_frame(&mut Cursor::new(buf)) {
            Ok((cmd, _)) => assert_ne!(cmd, "HELLO"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_DATA_LEN + 1).to_be_bytes());
        buf.extend_from_slice(b"OK");

        let codec = FrameCodec::plaintext();
        assert!(codec.read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_truncated_frame_errors() {
        let codec = FrameCodec::plaintext();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, "OK", b"payload").unwrap();
        buf.truncate(buf.len() - 3);

        assert!(codec.read_frame(&mut Cursor::new(buf)).is_err());
    }
}
