//! Snapshot file format definitions
//!
//! ```text
//! "TIDEKV" <4-digit version>
//! (0xFA <key> <value>)*                      aux metadata
//! ( 0xFE <db index>
//!   0xFB <key count> <ttl count>
//!   ([0xFC <u64 LE ms>] <type> <key> <value>)* )*
//! 0xFF
//! <32-byte SHA-256 of everything above>
//! ```

use bytes::{BufMut, Bytes};
use thiserror::Error;

/// Magic bytes for snapshot files
pub const SNAPSHOT_MAGIC: &[u8; 6] = b"TIDEKV";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

pub const OPCODE_AUX: u8 = 0xFA;
pub const OPCODE_RESIZEDB: u8 = 0xFB;
pub const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
pub const OPCODE_SELECTDB: u8 = 0xFE;
pub const OPCODE_EOF: u8 = 0xFF;

pub const TYPE_STRING: u8 = 0;
pub const TYPE_LIST: u8 = 1;
pub const TYPE_SET: u8 = 2;
pub const TYPE_HASH: u8 = 4;

/// Strings at least this long are tried with zstd
pub const COMPRESS_THRESHOLD: usize = 64;

const ZSTD_LEVEL: i32 = 3;
const ENC_ZSTD: u8 = 0xC3;
const LEN_32BIT: u8 = 0x80;
const LEN_64BIT: u8 = 0x81;

pub const CHECKSUM_LEN: usize = 32;

/// Aux metadata carried in every snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Version of the server that produced the file
    pub server_version: String,
    /// Creation time, Unix seconds
    pub ctime: i64,
    /// Replication lineage the snapshot belongs to
    pub repl_id: String,
    /// Replication stream offset at capture
    pub repl_offset: u64,
    /// First WAL segment holding writes made after capture
    pub wal_segment: u64,
}

impl SnapshotMeta {
    pub fn new(repl_id: impl Into<String>, repl_offset: u64, wal_segment: u64) -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            ctime: chrono::Utc::now().timestamp(),
            repl_id: repl_id.into(),
            repl_offset,
            wal_segment,
        }
    }
}

/// Snapshot-related errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid snapshot magic bytes")]
    InvalidMagic,

    #[error("Invalid snapshot version: {0}")]
    InvalidVersion(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Unexpected end of snapshot data at byte {0}")]
    UnexpectedEof(usize),

    #[error("Unknown opcode 0x{opcode:02X} at byte {position}")]
    UnknownOpcode { opcode: u8, position: usize },

    #[error("Invalid aux field {0}")]
    InvalidAux(String),

    #[error("Database {db} declared {declared} {what} but {found} were written")]
    CountMismatch {
        db: usize,
        what: &'static str,
        declared: u64,
        found: u64,
    },

    #[error("Database index {0} out of range")]
    DbOutOfRange(usize),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("A snapshot is already in progress")]
    Busy,
}

/// Append a length in the 6/14/32/64-bit prefix encoding
pub fn encode_length(out: &mut Vec<u8>, len: u64) {
    if len < 1 << 6 {
        out.put_u8(len as u8);
    } else if len < 1 << 14 {
        out.put_u8(0x40 | (len >> 8) as u8);
        out.put_u8(len as u8);
    } else if len <= u32::MAX as u64 {
        out.put_u8(LEN_32BIT);
        out.put_u32(len as u32);
    } else {
        out.put_u8(LEN_64BIT);
        out.put_u64(len);
    }
}

/// Append a string, zstd-compressed when that is smaller
pub fn encode_string(out: &mut Vec<u8>, data: &[u8]) -> Result<(), SnapshotError> {
    if data.len() >= COMPRESS_THRESHOLD {
        let compressed = zstd::bulk::compress(data, ZSTD_LEVEL)
            .map_err(|e| SnapshotError::Compression(e.to_string()))?;
        if compressed.len() < data.len() {
            out.put_u8(ENC_ZSTD);
            encode_length(out, compressed.len() as u64);
            encode_length(out, data.len() as u64);
            out.put_slice(&compressed);
            return Ok(());
        }
    }
    encode_length(out, data.len() as u64);
    out.put_slice(data);
    Ok(())
}

/// Cursor over snapshot bytes
pub struct Decoder<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .position
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(SnapshotError::UnexpectedEof(self.position))?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    pub fn u64_le(&mut self) -> Result<u64, SnapshotError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn length(&mut self) -> Result<u64, SnapshotError> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok((first & 0x3F) as u64),
            0b01 => Ok((((first & 0x3F) as u64) << 8) | self.u8()? as u64),
            _ => match first {
                LEN_32BIT => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(self.take(4)?);
                    Ok(u32::from_be_bytes(raw) as u64)
                }
                LEN_64BIT => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(self.take(8)?);
                    Ok(u64::from_be_bytes(raw))
                }
                opcode => Err(SnapshotError::UnknownOpcode {
                    opcode,
                    position: self.position - 1,
                }),
            },
        }
    }

    pub fn string(&mut self) -> Result<Bytes, SnapshotError> {
        if self.data.get(self.position) == Some(&ENC_ZSTD) {
            self.position += 1;
            let compressed_len = self.length()? as usize;
            let original_len = self.length()? as usize;
            let compressed = self.take(compressed_len)?;
            let data = zstd::bulk::decompress(compressed, original_len)
                .map_err(|e| SnapshotError::Compression(e.to_string()))?;
            if data.len() != original_len {
                return Err(SnapshotError::Compression(format!(
                    "expected {} bytes, got {}",
                    original_len,
                    data.len()
                )));
            }
            return Ok(Bytes::from(data));
        }
        let len = self.length()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}
