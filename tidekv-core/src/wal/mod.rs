//! Paged write-ahead log for crash durability
//!
//! Committed write commands are appended, already RESP-encoded, to a small
//! ring of fixed-size pages. A background task drains sealed pages into the
//! current segment file and fsyncs according to the configured policy.
//! Segments are named `appendonly-<NNNNNNNNNN>.log`; a new segment starts at
//! every snapshot capture so replay after a snapshot only reads what came
//! after it.

pub mod page;
pub mod reader;
pub mod replay;
pub mod writer;

pub use page::*;
pub use reader::*;
pub use replay::*;
pub use writer::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default page capacity (64 KB)
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Default number of pages in the ring
pub const DEFAULT_PAGE_COUNT: usize = 4;

/// When the log file is fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Flush and fsync inline after every append (safest, slowest)
    Always,
    /// Flush and fsync once per second from the background task
    Everysec,
    /// Write pages out but leave syncing to the OS, except on rotation and shutdown
    No,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Capacity of one buffer page in bytes
    pub page_size: usize,
    /// Number of pages in the ring (at least 2)
    pub page_count: usize,
    /// Fsync policy
    pub fsync: FsyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            page_size: DEFAULT_PAGE_SIZE,
            page_count: DEFAULT_PAGE_COUNT,
            fsync: FsyncPolicy::Everysec,
        }
    }
}

/// WAL-related errors
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WAL ring needs at least 2 pages, got {0}")]
    TooFewPages(usize),

    #[error("WAL page size must be greater than zero")]
    ZeroPageSize,

    #[error("Corrupted WAL segment {segment} at byte {position}: {reason}")]
    Corrupted {
        segment: u64,
        position: u64,
        reason: String,
    },

    #[error("Replay failed in segment {segment}: {reason}")]
    ReplayFailed { segment: u64, reason: String },
}
