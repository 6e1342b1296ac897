//! Snapshot decoding

use super::format::*;
use crate::keyspace::{Database, Entry, Value};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// A decoded snapshot
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub meta: SnapshotMeta,
    pub databases: Vec<Database>,
    /// Keys read from the file, including ones that expired since
    pub keys: u64,
}

/// Snapshot reader that validates structure as it goes
pub struct SnapshotReader<'a> {
    decoder: Decoder<'a>,
    database_count: usize,
}

impl<'a> SnapshotReader<'a> {
    /// Verify magic, version and checksum, and position after the header
    pub fn open(data: &'a [u8], database_count: usize) -> Result<Self, SnapshotError> {
        if data.len() < SNAPSHOT_MAGIC.len() + 4 + 1 + CHECKSUM_LEN {
            return Err(SnapshotError::UnexpectedEof(data.len()));
        }
        if &data[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let body_len = data.len() - CHECKSUM_LEN;
        if Sha256::digest(&data[..body_len])[..] != data[body_len..] {
            return Err(SnapshotError::ChecksumMismatch);
        }

        let mut decoder = Decoder::new(&data[..body_len]);
        decoder.take(SNAPSHOT_MAGIC.len())?;
        let raw_version = decoder.take(4)?;
        let version = std::str::from_utf8(raw_version)
            .ok()
            .and_then(|v| v.parse::<u32>().ok());
        if version != Some(SNAPSHOT_VERSION) {
            return Err(SnapshotError::InvalidVersion(
                String::from_utf8_lossy(raw_version).into_owned(),
            ));
        }

        Ok(Self {
            decoder,
            database_count,
        })
    }

    /// Decode the rest of the snapshot, dropping keys already expired at `now`
    pub fn read_all(mut self, now: u64) -> Result<LoadedSnapshot, SnapshotError> {
        let mut aux: HashMap<String, String> = HashMap::new();
        let mut databases = vec![Database::new(); self.database_count];
        let mut keys = 0u64;

        // Section being read: (db, declared keys, declared ttls, keys, ttls)
        let mut section: Option<(usize, u64, u64, u64, u64)> = None;

        loop {
            let position = self.decoder.position();
            let opcode = self.decoder.u8()?;
            match opcode {
                OPCODE_AUX => {
                    let key = self.decoder.string()?;
                    let value = self.decoder.string()?;
                    aux.insert(
                        String::from_utf8_lossy(&key).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    );
                }
                OPCODE_SELECTDB => {
                    check_section(section.take())?;
                    let db = self.decoder.length()? as usize;
                    if db >= self.database_count {
                        return Err(SnapshotError::DbOutOfRange(db));
                    }
                    let resize = self.decoder.u8()?;
                    if resize != OPCODE_RESIZEDB {
                        return Err(SnapshotError::UnknownOpcode {
                            opcode: resize,
                            position: self.decoder.position() - 1,
                        });
                    }
                    let declared_keys = self.decoder.length()?;
                    let declared_ttls = self.decoder.length()?;
                    section = Some((db, declared_keys, declared_ttls, 0, 0));
                }
                OPCODE_EOF => {
                    check_section(section.take())?;
                    break;
                }
                OPCODE_EXPIRETIME_MS | TYPE_STRING | TYPE_LIST | TYPE_SET | TYPE_HASH => {
                    let Some(current) = section.as_mut() else {
                        return Err(SnapshotError::UnknownOpcode { opcode, position });
                    };
                    let db = current.0;

                    let (expires_at_ms, type_tag) = if opcode == OPCODE_EXPIRETIME_MS {
                        (Some(self.decoder.u64_le()?), self.decoder.u8()?)
                    } else {
                        (None, opcode)
                    };
                    let key = self.decoder.string()?;
                    let value = self.read_value(type_tag)?;

                    current.3 += 1;
                    current.4 += expires_at_ms.is_some() as u64;
                    keys += 1;

                    let entry = Entry {
                        value,
                        expires_at_ms,
                    };
                    if !entry.is_expired(now) {
                        databases[db].insert(key, entry);
                    }
                }
                _ => return Err(SnapshotError::UnknownOpcode { opcode, position }),
            }
        }

        Ok(LoadedSnapshot {
            meta: meta_from_aux(&aux)?,
            databases,
            keys,
        })
    }

    fn read_value(&mut self, type_tag: u8) -> Result<Value, SnapshotError> {
        match type_tag {
            TYPE_STRING => Ok(Value::String(self.decoder.string()?)),
            TYPE_LIST => {
                let len = self.decoder.length()?;
                let mut items = VecDeque::new();
                for _ in 0..len {
                    items.push_back(self.decoder.string()?);
                }
                Ok(Value::List(items))
            }
            TYPE_SET => {
                let len = self.decoder.length()?;
                let mut members = HashSet::new();
                for _ in 0..len {
                    members.insert(self.decoder.string()?);
                }
                Ok(Value::Set(members))
            }
            TYPE_HASH => {
                let len = self.decoder.length()?;
                let mut fields: HashMap<Bytes, Bytes> = HashMap::new();
                for _ in 0..len {
                    let field = self.decoder.string()?;
                    let value = self.decoder.string()?;
                    fields.insert(field, value);
                }
                Ok(Value::Hash(fields))
            }
            opcode => Err(SnapshotError::UnknownOpcode {
                opcode,
                position: self.decoder.position(),
            }),
        }
    }
}

fn check_section(section: Option<(usize, u64, u64, u64, u64)>) -> Result<(), SnapshotError> {
    let Some((db, declared_keys, declared_ttls, keys, ttls)) = section else {
        return Ok(());
    };
    if keys != declared_keys {
        return Err(SnapshotError::CountMismatch {
            db,
            what: "keys",
            declared: declared_keys,
            found: keys,
        });
    }
    if ttls != declared_ttls {
        return Err(SnapshotError::CountMismatch {
            db,
            what: "ttl keys",
            declared: declared_ttls,
            found: ttls,
        });
    }
    Ok(())
}

fn meta_from_aux(aux: &HashMap<String, String>) -> Result<SnapshotMeta, SnapshotError> {
    let field = |name: &str| {
        aux.get(name)
            .cloned()
            .ok_or_else(|| SnapshotError::InvalidAux(format!("{} missing", name)))
    };
    let number = |name: &str| -> Result<u64, SnapshotError> {
        field(name)?
            .parse()
            .map_err(|_| SnapshotError::InvalidAux(format!("{} is not a number", name)))
    };

    Ok(SnapshotMeta {
        server_version: field("tidekv-ver")?,
        ctime: field("ctime")?
            .parse()
            .map_err(|_| SnapshotError::InvalidAux("ctime is not a number".to_string()))?,
        repl_id: field("repl-id")?,
        repl_offset: number("repl-offset")?,
        wal_segment: number("wal-segment")?,
    })
}

/// Decode a snapshot held in memory
pub fn decode_snapshot(
    data: &[u8],
    database_count: usize,
    now: u64,
) -> Result<LoadedSnapshot, SnapshotError> {
    SnapshotReader::open(data, database_count)?.read_all(now)
}

/// Read and decode a snapshot file; `Ok(None)` when it does not exist
pub fn load_snapshot_file(
    path: &Path,
    database_count: usize,
    now: u64,
) -> Result<Option<LoadedSnapshot>, SnapshotError> {
    match std::fs::read(path) {
        Ok(data) => decode_snapshot(&data, database_count, now).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::{now_ms, Keyspace};
    use crate::snapshot::{encode_snapshot, DatabaseStats, SnapshotWriter};

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    fn sample_keyspace() -> Keyspace {
        let keyspace = Keyspace::new(4);
        keyspace.apply(0, &args(&["SET", "s", "v"])).unwrap();
        keyspace.apply(0, &args(&["SET", "t", "v", "EX", "100"])).unwrap();
        keyspace.apply(0, &args(&["RPUSH", "l", "a", "b", "c"])).unwrap();
        keyspace.apply(2, &args(&["SADD", "set", "x", "y"])).unwrap();
        keyspace.apply(2, &args(&["HSET", "h", "f", "1", "g", "2"])).unwrap();
        keyspace
            .apply(3, &args(&["SET", "big", &"z".repeat(1000)]))
            .unwrap();
        keyspace
    }

    #[test]
    fn test_round_trip_preserves_every_database() {
        let keyspace = sample_keyspace();
        let view = keyspace.clone_view();
        let meta = SnapshotMeta::new("a".repeat(40), 1234, 7);
        let now = now_ms();

        let data = encode_snapshot(&view, &meta, now).unwrap();
        let loaded = decode_snapshot(&data, 4, now).unwrap();

        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.keys, 6);
        assert_eq!(loaded.databases, view);
    }

    #[test]
    fn test_section_counts_match_header() {
        let keyspace = sample_keyspace();
        let now = now_ms();
        let mut writer = SnapshotWriter::new(&SnapshotMeta::new("r", 0, 0)).unwrap();
        let view = keyspace.clone_view();
        assert_eq!(
            writer.write_database(0, &view[0], now).unwrap(),
            DatabaseStats { keys: 3, ttls: 1 }
        );
        assert_eq!(
            writer.write_database(1, &view[1], now).unwrap(),
            DatabaseStats::default()
        );
        assert_eq!(writer.keys_written(), 3);
    }

    #[test]
    fn test_expired_keys_are_not_written() {
        let mut database = Database::new();
        database.insert(
            Bytes::from("old"),
            Entry {
                value: Value::String(Bytes::from("x")),
                expires_at_ms: Some(10),
            },
        );
        let data = encode_snapshot(&[database], &SnapshotMeta::new("r", 0, 0), now_ms()).unwrap();
        let loaded = decode_snapshot(&data, 1, now_ms()).unwrap();
        assert_eq!(loaded.keys, 0);
    }

    #[test]
    fn test_corruption_detected() {
        let keyspace = sample_keyspace();
        let now = now_ms();
        let data = encode_snapshot(&keyspace.clone_view(), &SnapshotMeta::new("r", 0, 0), now)
            .unwrap();

        let mut flipped = data.to_vec();
        flipped[20] ^= 0xFF;
        assert!(matches!(
            decode_snapshot(&flipped, 4, now),
            Err(SnapshotError::ChecksumMismatch)
        ));

        let mut bad_magic = data.to_vec();
        bad_magic[0] = b'X';
        assert!(matches!(
            decode_snapshot(&bad_magic, 4, now),
            Err(SnapshotError::InvalidMagic)
        ));

        assert!(decode_snapshot(&data[..10], 4, now).is_err());
    }

    #[test]
    fn test_database_out_of_range() {
        let keyspace = sample_keyspace();
        let now = now_ms();
        let data = encode_snapshot(&keyspace.clone_view(), &SnapshotMeta::new("r", 0, 0), now)
            .unwrap();
        assert!(matches!(
            decode_snapshot(&data, 2, now),
            Err(SnapshotError::DbOutOfRange(2))
        ));
    }

    #[test]
    fn test_missing_file_is_none() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let loaded = load_snapshot_file(&temp_dir.path().join("dump.tdb"), 16, now_ms()).unwrap();
        assert!(loaded.is_none());
    }
}
