//! Cold-start replay of WAL segments into the key space

use super::reader::{list_segments, ReadOutcome, SegmentReader};
use super::WalError;
use crate::keyspace::Keyspace;
use bytes::Bytes;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{info, warn};

/// WAL replay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments read
    pub segments: u64,
    /// Commands applied to the key space
    pub commands_applied: u64,
    /// Commands the key space rejected
    pub errors: u64,
    /// Bytes cut from a torn tail, if any
    pub truncated_bytes: u64,
    /// Last segment replayed
    pub last_segment: Option<u64>,
}

/// Replay every segment numbered `from_segment` or higher, in order.
///
/// Every segment starts in database 0; `SELECT` records switch database. A
/// torn record at the end of the last segment is cut off with a warning. A
/// malformed or torn record anywhere else fails the replay.
pub fn replay_segments(
    dir: &Path,
    from_segment: u64,
    keyspace: &Keyspace,
) -> Result<ReplayStats, WalError> {
    let segments: Vec<_> = list_segments(dir)?
        .into_iter()
        .filter(|(number, _)| *number >= from_segment)
        .collect();

    let mut stats = ReplayStats::default();
    let last = segments.last().map(|(number, _)| *number);

    for (number, path) in &segments {
        let mut reader = SegmentReader::open(*number, path)?;
        let mut db = 0usize;

        loop {
            match reader.next_record()? {
                ReadOutcome::Record(args) => {
                    if let Some(index) = select_target(&args) {
                        keyspace
                            .check_db(index)
                            .map_err(|e| WalError::ReplayFailed {
                                segment: *number,
                                reason: e.to_string(),
                            })?;
                        db = index;
                        continue;
                    }
                    match keyspace.apply(db, &args) {
                        Ok(_) => stats.commands_applied += 1,
                        Err(e) => {
                            warn!("Replay of segment {} skipped a command: {}", number, e);
                            stats.errors += 1;
                        }
                    }
                }
                ReadOutcome::End => break,
                ReadOutcome::Truncated if Some(*number) == last => {
                    let keep = reader.position() as u64;
                    let cut = reader.len() as u64 - keep;
                    warn!(
                        "WAL segment {} ends with a torn record; truncating {} byte(s) at {}",
                        path.display(),
                        cut,
                        keep
                    );
                    OpenOptions::new().write(true).open(path)?.set_len(keep)?;
                    stats.truncated_bytes = cut;
                    break;
                }
                ReadOutcome::Truncated => {
                    return Err(WalError::Corrupted {
                        segment: *number,
                        position: reader.position() as u64,
                        reason: "torn record in a sealed segment".to_string(),
                    });
                }
            }
        }

        stats.segments += 1;
        stats.last_segment = Some(*number);
    }

    if stats.segments > 0 {
        info!(
            "Replayed {} command(s) from {} WAL segment(s)",
            stats.commands_applied, stats.segments
        );
    }
    Ok(stats)
}

/// Database index of a `SELECT` record
fn select_target(args: &[Bytes]) -> Option<usize> {
    if args.len() == 2 && args[0].eq_ignore_ascii_case(b"SELECT") {
        std::str::from_utf8(&args[1]).ok()?.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::{encode_command, Frame};
    use crate::wal::segment_path;
    use tempfile::TempDir;

    fn get(keyspace: &Keyspace, db: usize, key: &str) -> Frame {
        keyspace
            .apply(db, &[Bytes::from("GET"), Bytes::copy_from_slice(key.as_bytes())])
            .unwrap()
            .reply
    }

    fn write_segment(dir: &TempDir, number: u64, commands: &[&[&str]]) -> Vec<u8> {
        let mut data = Vec::new();
        for command in commands {
            data.extend_from_slice(&encode_command(command));
        }
        std::fs::write(segment_path(dir.path(), number), &data).unwrap();
        data
    }

    #[test]
    fn test_replay_follows_select() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(
            &temp_dir,
            0,
            &[&["SET", "a", "1"], &["SELECT", "3"], &["SET", "b", "2"]],
        );
        write_segment(&temp_dir, 1, &[&["SET", "c", "3"]]);

        let keyspace = Keyspace::new(16);
        let stats = replay_segments(temp_dir.path(), 0, &keyspace).unwrap();

        assert_eq!(stats.commands_applied, 3);
        assert_eq!(stats.segments, 2);
        assert_eq!(get(&keyspace, 0, "a"), Frame::bulk("1"));
        assert_eq!(get(&keyspace, 3, "b"), Frame::bulk("2"));
        // A new segment starts back in database 0.
        assert_eq!(get(&keyspace, 0, "c"), Frame::bulk("3"));
    }

    #[test]
    fn test_replay_skips_older_segments() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(&temp_dir, 0, &[&["SET", "old", "1"]]);
        write_segment(&temp_dir, 1, &[&["SET", "new", "1"]]);

        let keyspace = Keyspace::new(1);
        let stats = replay_segments(temp_dir.path(), 1, &keyspace).unwrap();
        assert_eq!(stats.last_segment, Some(1));
        assert_eq!(get(&keyspace, 0, "old"), Frame::Null);
        assert_eq!(get(&keyspace, 0, "new"), Frame::bulk("1"));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let mut data = write_segment(&temp_dir, 0, &[&["SET", "a", "1"]]);
        let good_len = data.len() as u64;
        data.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1");
        std::fs::write(segment_path(temp_dir.path(), 0), &data).unwrap();

        let keyspace = Keyspace::new(1);
        let stats = replay_segments(temp_dir.path(), 0, &keyspace).unwrap();
        assert_eq!(stats.commands_applied, 1);
        assert_eq!(stats.truncated_bytes, data.len() as u64 - good_len);

        let on_disk = std::fs::metadata(segment_path(temp_dir.path(), 0)).unwrap();
        assert_eq!(on_disk.len(), good_len);
    }

    #[test]
    fn test_torn_record_in_sealed_segment_fails() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(segment_path(temp_dir.path(), 0), b"*2\r\n$3\r\nDEL").unwrap();
        write_segment(&temp_dir, 1, &[&["SET", "a", "1"]]);

        let keyspace = Keyspace::new(1);
        assert!(matches!(
            replay_segments(temp_dir.path(), 0, &keyspace),
            Err(WalError::Corrupted { segment: 0, .. })
        ));
    }
}
