//! Snapshot encoding

use super::format::*;
use crate::keyspace::{Database, Entry, Value};
use bytes::{BufMut, Bytes};
use sha2::{Digest, Sha256};

/// Per-database totals reported after encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub keys: u64,
    pub ttls: u64,
}

/// Builds a snapshot in memory.
///
/// The buffer doubles as the replication payload, so nothing here touches the
/// filesystem; see `engine::commit` for the atomic rename.
pub struct SnapshotWriter {
    buf: Vec<u8>,
    keys_written: u64,
}

impl SnapshotWriter {
    /// Start a snapshot: magic, version and aux fields
    pub fn new(meta: &SnapshotMeta) -> Result<Self, SnapshotError> {
        let mut writer = Self {
            buf: Vec::with_capacity(4096),
            keys_written: 0,
        };
        writer.buf.put_slice(SNAPSHOT_MAGIC);
        writer
            .buf
            .put_slice(format!("{:04}", SNAPSHOT_VERSION).as_bytes());

        writer.write_aux("tidekv-ver", meta.server_version.as_bytes())?;
        writer.write_aux("ctime", meta.ctime.to_string().as_bytes())?;
        writer.write_aux("repl-id", meta.repl_id.as_bytes())?;
        writer.write_aux("repl-offset", meta.repl_offset.to_string().as_bytes())?;
        writer.write_aux("wal-segment", meta.wal_segment.to_string().as_bytes())?;
        Ok(writer)
    }

    fn write_aux(&mut self, key: &str, value: &[u8]) -> Result<(), SnapshotError> {
        self.buf.put_u8(OPCODE_AUX);
        encode_string(&mut self.buf, key.as_bytes())?;
        encode_string(&mut self.buf, value)
    }

    /// Write one database section holding every key live at `now`.
    ///
    /// Empty databases produce no section. The declared counts are checked
    /// against what was actually written; a mismatch is an encoder bug and is
    /// returned as `CountMismatch`.
    pub fn write_database(
        &mut self,
        index: usize,
        database: &Database,
        now: u64,
    ) -> Result<DatabaseStats, SnapshotError> {
        let (declared_keys, declared_ttls) = database.live_counts(now);
        if declared_keys == 0 {
            return Ok(DatabaseStats::default());
        }

        self.buf.put_u8(OPCODE_SELECTDB);
        encode_length(&mut self.buf, index as u64);
        self.buf.put_u8(OPCODE_RESIZEDB);
        encode_length(&mut self.buf, declared_keys);
        encode_length(&mut self.buf, declared_ttls);

        let mut stats = DatabaseStats::default();
        for (key, entry) in database.iter_live(now) {
            self.write_entry(key, entry)?;
            stats.keys += 1;
            stats.ttls += entry.expires_at_ms.is_some() as u64;
        }

        if stats.keys != declared_keys {
            return Err(SnapshotError::CountMismatch {
                db: index,
                what: "keys",
                declared: declared_keys,
                found: stats.keys,
            });
        }
        if stats.ttls != declared_ttls {
            return Err(SnapshotError::CountMismatch {
                db: index,
                what: "ttl keys",
                declared: declared_ttls,
                found: stats.ttls,
            });
        }

        self.keys_written += stats.keys;
        Ok(stats)
    }

    fn write_entry(&mut self, key: &[u8], entry: &Entry) -> Result<(), SnapshotError> {
        if let Some(at) = entry.expires_at_ms {
            self.buf.put_u8(OPCODE_EXPIRETIME_MS);
            self.buf.put_u64_le(at);
        }

        match &entry.value {
            Value::String(data) => {
                self.buf.put_u8(TYPE_STRING);
                encode_string(&mut self.buf, key)?;
                encode_string(&mut self.buf, data)?;
            }
            Value::List(items) => {
                self.buf.put_u8(TYPE_LIST);
                encode_string(&mut self.buf, key)?;
                encode_length(&mut self.buf, items.len() as u64);
                for item in items {
                    encode_string(&mut self.buf, item)?;
                }
            }
            Value::Set(members) => {
                self.buf.put_u8(TYPE_SET);
                encode_string(&mut self.buf, key)?;
                encode_length(&mut self.buf, members.len() as u64);
                for member in members {
                    encode_string(&mut self.buf, member)?;
                }
            }
            Value::Hash(fields) => {
                self.buf.put_u8(TYPE_HASH);
                encode_string(&mut self.buf, key)?;
                encode_length(&mut self.buf, fields.len() as u64);
                for (field, value) in fields {
                    encode_string(&mut self.buf, field)?;
                    encode_string(&mut self.buf, value)?;
                }
            }
        }
        Ok(())
    }

    pub fn keys_written(&self) -> u64 {
        self.keys_written
    }

    /// End marker plus checksum
    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(OPCODE_EOF);
        let checksum = Sha256::digest(&self.buf);
        self.buf.put_slice(&checksum);
        Bytes::from(self.buf)
    }
}

/// Encode every database of a point-in-time view
pub fn encode_snapshot(
    databases: &[Database],
    meta: &SnapshotMeta,
    now: u64,
) -> Result<Bytes, SnapshotError> {
    let mut writer = SnapshotWriter::new(meta)?;
    for (index, database) in databases.iter().enumerate() {
        writer.write_database(index, database, now)?;
    }
    Ok(writer.finish())
}
