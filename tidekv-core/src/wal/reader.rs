//! WAL segment discovery and record reading

use super::WalError;
use crate::resp::Frame;
use bytes::Bytes;
use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "appendonly-";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of segment `number` inside `dir`
pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{}{:010}{}", SEGMENT_PREFIX, number, SEGMENT_SUFFIX))
}

/// Segment number encoded in a file name, if it is a segment file
pub fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Every segment in `dir`, sorted by number
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(number) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_number)
        {
            segments.push((number, path));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

/// Outcome of reading the next record
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Record(Vec<Bytes>),
    /// Clean end of the segment
    End,
    /// Bytes remain but do not form a complete record
    Truncated,
}

/// Reads the RESP-encoded commands of one segment
pub struct SegmentReader {
    number: u64,
    path: PathBuf,
    data: Bytes,
    position: usize,
}

impl SegmentReader {
    pub fn open(number: u64, path: &Path) -> Result<Self, WalError> {
        let data = std::fs::read(path)?;
        Ok(Self {
            number,
            path: path.to_path_buf(),
            data: Bytes::from(data),
            position: 0,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the first byte not yet consumed
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn next_record(&mut self) -> Result<ReadOutcome, WalError> {
        let remaining = &self.data[self.position..];
        if remaining.is_empty() {
            return Ok(ReadOutcome::End);
        }
        if remaining[0] != b'*' {
            return Err(self.corrupted("record does not start with a multi-bulk header"));
        }

        match Frame::parse(remaining) {
            Ok(Some((frame, consumed))) => {
                let args = frame
                    .into_args()
                    .map_err(|e| self.corrupted(&e.to_string()))?;
                self.position += consumed;
                Ok(ReadOutcome::Record(args))
            }
            Ok(None) => Ok(ReadOutcome::Truncated),
            Err(e) => Err(self.corrupted(&e.to_string())),
        }
    }

    fn corrupted(&self, reason: &str) -> WalError {
        WalError::Corrupted {
            segment: self.number,
            position: self.position as u64,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::encode_command;
    use tempfile::TempDir;

    #[test]
    fn test_segment_names() {
        let path = segment_path(Path::new("/data"), 42);
        assert_eq!(path, PathBuf::from("/data/appendonly-0000000042.log"));
        assert_eq!(parse_segment_number("appendonly-0000000042.log"), Some(42));
        assert_eq!(parse_segment_number("dump.tdb"), None);
        assert_eq!(parse_segment_number("appendonly-x.log"), None);
    }

    #[test]
    fn test_list_segments_sorted() {
        let temp_dir = TempDir::new().unwrap();
        for n in [3, 1, 2] {
            std::fs::write(segment_path(temp_dir.path(), n), b"").unwrap();
        }
        std::fs::write(temp_dir.path().join("other.txt"), b"").unwrap();
        let numbers: Vec<u64> = list_segments(temp_dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_reads_records_then_detects_truncation() {
        let temp_dir = TempDir::new().unwrap();
        let path = segment_path(temp_dir.path(), 0);
        let mut data = encode_command(&["SET", "a", "1"]).to_vec();
        data.extend_from_slice(&encode_command(&["DEL", "a"])[..9]);
        std::fs::write(&path, &data).unwrap();

        let mut reader = SegmentReader::open(0, &path).unwrap();
        assert_eq!(
            reader.next_record().unwrap(),
            ReadOutcome::Record(vec![Bytes::from("SET"), Bytes::from("a"), Bytes::from("1")])
        );
        assert_eq!(reader.position(), 27);
        assert_eq!(reader.next_record().unwrap(), ReadOutcome::Truncated);
    }

    #[test]
    fn test_garbage_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = segment_path(temp_dir.path(), 7);
        std::fs::write(&path, b"hello\r\n").unwrap();
        let mut reader = SegmentReader::open(7, &path).unwrap();
        assert!(matches!(
            reader.next_record(),
            Err(WalError::Corrupted { segment: 7, position: 0, .. })
        ));
    }
}
