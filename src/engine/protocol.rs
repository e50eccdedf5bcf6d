//! Wire messages for the TCP engine.
//!
//! Each connection carries one session:
//!
//! ```text
//! sender                              receiver
//!   HELLO(version, transfer_id) ----->
//!   FILE_ENTRY(path, size)      ----->
//!   DATA(bytes) ...             ----->
//!   FILE_END                    ----->
//!   ...
//!   DONE(files, bytes)          ----->
//!                               <----- DONE(files, bytes) | ABORT(code)
//! ```
//!
//! Either side may send ABORT(code) instead of the next message.

use crate::error::ErrorCode;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest version a receiver still accepts
pub const PROTOCOL_VERSION_MIN: u32 = 1;

/// Newest version a receiver accepts
pub const PROTOCOL_VERSION_MAX: u32 = 3;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Longest string (in bytes) a u16 length prefix can carry
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    FileEntry = 0x02,
    Data = 0x03,
    FileEnd = 0x04,
    Done = 0x05,
    Abort = 0x06,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::FileEntry),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::FileEnd),
            0x05 => Some(Self::Done),
            0x06 => Some(Self::Abort),
            _ => None,
        }
    }
}

fn frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

fn string_len(s: &[u8], what: &str) -> Result<u16> {
    u16::try_from(s.len()).map_err(|_| {
        anyhow::anyhow!(
            "{} is {} bytes, limit is {}",
            what,
            s.len(),
            MAX_STRING_LEN
        )
    })
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub transfer_id: String,
}

impl Hello {
    pub fn new(version: u32, transfer_id: impl Into<String>) -> Self {
        Self {
            version,
            transfer_id: transfer_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let id = self.transfer_id.as_bytes();
        let id_len = string_len(id, "Hello transfer id")?;
        let mut buf = frame(MessageType::Hello, 4 + 2 + id.len());
        buf.put_u32(self.version);
        buf.put_u16(id_len);
        buf.put_slice(id);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u32();
        let transfer_id = get_string(&mut payload, "Hello transfer id")?;
        Ok(Self {
            version,
            transfer_id,
        })
    }
}

// =============================================================================
// FILE_ENTRY (0x02)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

impl FileEntry {
    pub fn encode(&self) -> Result<Bytes> {
        let path = self.path.as_bytes();
        let path_len = string_len(path, "FileEntry path")?;
        let mut buf = frame(MessageType::FileEntry, 2 + path.len() + 8);
        buf.put_u16(path_len);
        buf.put_slice(path);
        buf.put_u64(self.size);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_string(&mut payload, "FileEntry path")?;
        if payload.remaining() < 8 {
            anyhow::bail!("FileEntry size truncated");
        }
        Ok(Self {
            path,
            size: payload.get_u64(),
        })
    }
}

// =============================================================================
// DATA (0x03) / FILE_END (0x04)
// =============================================================================

/// Encode a DATA frame around a chunk of file content.
pub fn encode_data(chunk: &[u8]) -> Bytes {
    let mut buf = frame(MessageType::Data, chunk.len());
    buf.put_slice(chunk);
    buf.freeze()
}

pub fn encode_file_end() -> Bytes {
    frame(MessageType::FileEnd, 0).freeze()
}

// =============================================================================
// DONE (0x05)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub files: u64,
    pub bytes: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Done, 16);
        buf.put_u64(self.files);
        buf.put_u64(self.bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            anyhow::bail!("Done payload too short");
        }
        Ok(Self {
            files: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// ABORT (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort {
    pub code: ErrorCode,
}

impl Abort {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Abort, 1);
        buf.put_u8(self.code as u8);
        buf.freeze()
    }

    /// Unknown codes decode as a generic error rather than failing the read.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            anyhow::bail!("Abort payload too short");
        }
        let code = ErrorCode::from_u8(payload.get_u8()).unwrap_or(ErrorCode::Error);
        Ok(Self { code })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    Supported(u32),
    TooOld { client: u32, min_supported: u32 },
    TooNew { client: u32, max_supported: u32 },
}

/// Check whether a sender's protocol version can be served.
pub fn negotiate_version(client_version: u32) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(encoded: &Bytes) -> Bytes {
        Bytes::copy_from_slice(&encoded[5..])
    }

    #[test]
    fn test_hello_layout() {
        let hello = Hello::new(3, "xfer-1");
        let encoded = hello.encode().unwrap();
        assert_eq!(encoded[4], MessageType::Hello as u8);
        assert_eq!(
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            encoded.len() - 5
        );
        assert_eq!(Hello::decode(payload_of(&encoded)).unwrap(), hello);
    }

    #[test]
    fn test_file_entry_truncated() {
        let entry = FileEntry {
            path: "dir/a.bin".to_string(),
            size: 4096,
        };
        let encoded = entry.encode().unwrap();
        let short = Bytes::copy_from_slice(&encoded[5..encoded.len() - 3]);
        assert!(FileEntry::decode(short).is_err());
        assert_eq!(FileEntry::decode(payload_of(&encoded)).unwrap(), entry);
    }

    #[test]
    fn test_string_length_limit() {
        let at_limit = Hello::new(3, "i".repeat(MAX_STRING_LEN));
        let encoded = at_limit.encode().unwrap();
        assert_eq!(Hello::decode(payload_of(&encoded)).unwrap(), at_limit);

        assert!(Hello::new(3, "i".repeat(MAX_STRING_LEN + 1))
            .encode()
            .is_err());
        let long_path = FileEntry {
            path: "p".repeat(70_000),
            size: 1,
        };
        assert!(long_path.encode().is_err());
    }

    #[test]
    fn test_abort_unknown_code_is_generic_error() {
        let abort = Abort::decode(Bytes::from_static(&[0xEE])).unwrap();
        assert_eq!(abort.code, ErrorCode::Error);
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &encode_data(b"hello")).await.unwrap();
        write_frame(&mut wire, &encode_file_end()).await.unwrap();
        write_frame(&mut wire, &Done { files: 1, bytes: 5 }.encode())
            .await
            .unwrap();

        let mut r = &wire[..];
        let (t, p) = read_frame(&mut r).await.unwrap();
        assert_eq!(t, MessageType::Data);
        assert_eq!(&p[..], b"hello");
        let (t, p) = read_frame(&mut r).await.unwrap();
        assert_eq!(t, MessageType::FileEnd);
        assert!(p.is_empty());
        let (t, p) = read_frame(&mut r).await.unwrap();
        assert_eq!(t, MessageType::Done);
        assert_eq!(Done::decode(p).unwrap(), Done { files: 1, bytes: 5 });
        assert!(read_frame(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        wire.push(MessageType::Data as u8);
        let mut r = &wire[..];
        assert!(read_frame(&mut r).await.is_err());
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version(3), VersionNegotiationResult::Supported(3));
        assert!(matches!(
            negotiate_version(0),
            VersionNegotiationResult::TooOld { .. }
        ));
        assert!(matches!(
            negotiate_version(9),
            VersionNegotiationResult::TooNew { .. }
        ));
    }
}
