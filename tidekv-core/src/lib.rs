//! tidekv core - durability and replication for a Redis-compatible server
//!
//! This crate provides:
//! - RESP framing and an in-memory key space
//! - A paged write-ahead log with segment replay and compaction
//! - Point-in-time snapshots, installed atomically
//! - Primary/replica replication over a backlog addressed by stream offset
//! - The TCP server tying those together

pub mod config;
pub mod keyspace;
pub mod monitoring;
pub mod replication;
pub mod resp;
pub mod server;
pub mod snapshot;
pub mod wal;

pub use config::*;
pub use keyspace::*;
pub use monitoring::*;
pub use replication::*;
pub use resp::*;
pub use server::*;
pub use snapshot::{
    decode_snapshot, encode_snapshot, load_snapshot_file, LoadedSnapshot, SnapshotEngine, SnapshotError,
    SnapshotMeta,
};
pub use wal::{list_segments, replay_segments, segment_path, FsyncPolicy, ReplayStats, Wal, WalConfig, WalError};

/// Log an unrecoverable error and terminate the process.
///
/// Reserved for conditions where carrying on would misreport durability.
pub fn fatal(context: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!("FATAL: {}: {}", context, err);
    std::process::exit(1)
}
