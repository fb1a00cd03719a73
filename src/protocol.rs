//! Wire codec for the livesync device protocol.
//!
//! Integers never travel as raw binary: every length is written as ASCII
//! decimal digits preceded by a one-byte digit count. Outbound headers are
//! followed by a 16-byte MD5 digest of the exact header bytes so the agent
//! can detect truncated or corrupted writes.
//!
//! ```text
//! create-file:  '8' | n | <n digits: path len> | path | m | <m digits: size> ++ md5(header)
//!               ++ file bytes ++ md5(file bytes)
//! delete-file:  '7' | n | <n digits: path len> | path ++ md5(header)
//! do-sync:      '9' <32 hex chars: operation id> ++ md5(message)
//! handshake:    v | <v bytes: version> | application id       (inbound)
//! report:       type | payload                                 (inbound)
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Default local port the device agent is forwarded to.
pub const DEFAULT_PORT: u16 = 18182;

/// Opcode for removing a file on the device.
pub const DELETE_FILE_OPERATION: u8 = b'7';

/// Opcode for creating (or overwriting) a file on the device.
pub const CREATE_FILE_OPERATION: u8 = b'8';

/// Opcode for asking the agent to apply pending changes.
pub const DO_SYNC_OPERATION: u8 = b'9';

/// Report type carrying a UTF-8 error message.
pub const ERROR_REPORT: u8 = 1;

/// Report type carrying the identifier of a finished operation.
pub const OPERATION_END_REPORT: u8 = 2;

/// Size of every MD5 digest on the wire.
pub const DIGEST_LEN: usize = 16;

/// Length of a hex-encoded operation identifier.
pub const OPERATION_ID_LEN: usize = 32;

/// Most digits a single length field may carry (its count is one byte).
pub const MAX_LENGTH_DIGITS: usize = u8::MAX as usize;

// =============================================================================
// Digests
// =============================================================================

/// MD5 of `bytes`, as sent after every header.
pub fn digest(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Md5::digest(bytes));
    out
}

/// Incremental MD5 over a file body streamed in chunks.
#[derive(Clone, Default)]
pub struct RunningDigest {
    hasher: Md5,
}

impl RunningDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> [u8; DIGEST_LEN] {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.hasher.finalize());
        out
    }
}

impl fmt::Debug for RunningDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningDigest").finish_non_exhaustive()
    }
}

// =============================================================================
// Operation identifiers
// =============================================================================

/// 128-bit random identifier, hex encoded, used to correlate do-sync reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(String);

impl OperationId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    /// Validates a caller-supplied identifier.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != OPERATION_ID_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidOperationId(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Length fields
// =============================================================================

/// Appends `value` as `[digit count][ASCII digits]`.
pub fn put_length_field(buf: &mut BytesMut, field: &'static str, value: u64) -> Result<()> {
    put_decimal(buf, field, value.to_string().as_bytes())
}

fn put_decimal(buf: &mut BytesMut, field: &'static str, digits: &[u8]) -> Result<()> {
    if digits.len() > MAX_LENGTH_DIGITS {
        return Err(Error::ProtocolLimit {
            field,
            digits: digits.len(),
        });
    }
    buf.put_u8(digits.len() as u8);
    buf.put_slice(digits);
    Ok(())
}

/// Cursor over an inbound header, used by the decoders below.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Malformed(format!("{what} truncated")))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn opcode(&mut self, expected: u8) -> Result<()> {
        let op = self.take(1, "opcode")?[0];
        if op != expected {
            return Err(Error::Malformed(format!(
                "expected opcode {:?}, got {:?}",
                expected as char, op as char
            )));
        }
        Ok(())
    }

    fn length(&mut self, what: &str) -> Result<u64> {
        let count = self.take(1, what)?[0] as usize;
        let digits = self.take(count, what)?;
        std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Malformed(format!("{what} is not a decimal number")))
    }

    fn path(&mut self) -> Result<String> {
        let len = self.length("path length")?;
        let len = usize::try_from(len).map_err(|_| Error::Malformed("path too long".into()))?;
        let raw = self.take(len, "path")?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed("path is not UTF-8".into()))
    }
}

// =============================================================================
// CREATE_FILE ('8')
// =============================================================================

/// Header announcing a full file body of `content_length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFileHeader {
    /// Path relative to the base directory, `/`-separated.
    pub path: String,
    pub content_length: u64,
}

impl CreateFileHeader {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.path.len() + 48);
        buf.put_u8(CREATE_FILE_OPERATION);
        put_length_field(&mut buf, "path", self.path.len() as u64)?;
        buf.put_slice(self.path.as_bytes());
        put_length_field(&mut buf, "content", self.content_length)?;
        Ok(buf.freeze())
    }

    /// Decodes a header from the front of `buf`, returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut fields = Fields::new(buf);
        fields.opcode(CREATE_FILE_OPERATION)?;
        let path = fields.path()?;
        let content_length = fields.length("content length")?;
        Ok((
            Self {
                path,
                content_length,
            },
            fields.pos,
        ))
    }
}

// =============================================================================
// DELETE_FILE ('7')
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFileHeader {
    /// Path relative to the base directory, `/`-separated.
    pub path: String,
}

impl DeleteFileHeader {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.path.len() + 24);
        buf.put_u8(DELETE_FILE_OPERATION);
        put_length_field(&mut buf, "path", self.path.len() as u64)?;
        buf.put_slice(self.path.as_bytes());
        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut fields = Fields::new(buf);
        fields.opcode(DELETE_FILE_OPERATION)?;
        let path = fields.path()?;
        Ok((Self { path }, fields.pos))
    }
}

// =============================================================================
// DO_SYNC ('9')
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoSync {
    pub id: OperationId,
}

impl DoSync {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + OPERATION_ID_LEN);
        buf.put_u8(DO_SYNC_OPERATION);
        buf.put_slice(self.id.as_str().as_bytes());
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut fields = Fields::new(buf);
        fields.opcode(DO_SYNC_OPERATION)?;
        let raw = fields.take(OPERATION_ID_LEN, "operation id")?;
        let id = std::str::from_utf8(raw)
            .map_err(|_| Error::Malformed("operation id is not ASCII".into()))
            .and_then(OperationId::parse)?;
        Ok((Self { id }, fields.pos))
    }
}

// =============================================================================
// Handshake (inbound)
// =============================================================================

/// First bytes the agent sends on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: String,
    pub application_id: String,
}

impl Handshake {
    pub fn decode(chunk: &[u8]) -> Result<Self> {
        let mut fields = Fields::new(chunk);
        let len = fields.take(1, "handshake")?[0] as usize;
        let version = fields.take(len, "handshake version")?;
        let app = &chunk[fields.pos..];

        let protocol_version = String::from_utf8(version.to_vec())
            .map_err(|_| Error::Malformed("handshake version is not UTF-8".into()))?;
        let application_id = String::from_utf8(app.to_vec())
            .map_err(|_| Error::Malformed("handshake application id is not UTF-8".into()))?;

        Ok(Self {
            protocol_version,
            application_id,
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let len = u8::try_from(self.protocol_version.len()).map_err(|_| Error::ProtocolLimit {
            field: "protocol version",
            digits: self.protocol_version.len(),
        })?;
        let mut buf =
            BytesMut::with_capacity(1 + self.protocol_version.len() + self.application_id.len());
        buf.put_u8(len);
        buf.put_slice(self.protocol_version.as_bytes());
        buf.put_slice(self.application_id.as_bytes());
        Ok(buf.freeze())
    }
}

// =============================================================================
// Reports (inbound)
// =============================================================================

/// Out-of-band message from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// The agent failed to apply something; the payload is its message.
    Error(String),
    /// A do-sync with this identifier has finished.
    OperationEnd(OperationId),
}

impl Report {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Error(message) => {
                buf.put_u8(ERROR_REPORT);
                buf.put_slice(message.as_bytes());
            }
            Self::OperationEnd(id) => {
                buf.put_u8(OPERATION_END_REPORT);
                buf.put_slice(id.as_str().as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes every report in one inbound chunk.
    ///
    /// Operation-end reports have a fixed size, so several may arrive
    /// back-to-back in one read. An error report has no length and consumes
    /// the rest of the chunk.
    pub fn decode_chunk(chunk: &[u8]) -> Result<Vec<Self>> {
        let mut reports = Vec::new();
        let mut fields = Fields::new(chunk);

        while fields.pos < chunk.len() {
            match fields.take(1, "report type")?[0] {
                ERROR_REPORT => {
                    let rest = &chunk[fields.pos..];
                    fields.pos = chunk.len();
                    reports.push(Self::Error(String::from_utf8_lossy(rest).into_owned()));
                }
                OPERATION_END_REPORT => {
                    let raw = fields.take(OPERATION_ID_LEN, "operation-end report")?;
                    let id = std::str::from_utf8(raw)
                        .map_err(|_| Error::Malformed("operation id is not ASCII".into()))
                        .and_then(OperationId::parse)?;
                    reports.push(Self::OperationEnd(id));
                }
                other => {
                    return Err(Error::Malformed(format!("unknown report type {other}")));
                }
            }
        }

        Ok(reports)
    }
}

// =============================================================================
// Tests
// =============================================================================
