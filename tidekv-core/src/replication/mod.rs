//! Replication for tidekv
//!
//! A process is standalone, a primary or a replica. One coordinator task owns
//! the role, the stream offset, the backlog and every replica descriptor, and
//! routes committed writes into the WAL and the backlog. Socket I/O happens in
//! per-connection tasks that talk to the coordinator through channels:
//! - `backlog`: circular buffer of recent stream bytes, addressed by offset
//! - `message`: coordinator inbox messages and handshake wire framing
//! - `primary`: replica descriptors, pumping, eviction and PSYNC decisions
//! - `connection`: the primary-side task writing to one replica socket
//! - `handshake`: the replica-side link state machine
//! - `coordinator`: the task tying it all together

pub mod backlog;
pub mod connection;
pub mod coordinator;
pub mod handshake;
pub mod message;
pub mod primary;

pub use backlog::*;
pub use connection::*;
pub use coordinator::*;
pub use handshake::*;
pub use message::*;
pub use primary::*;

use crate::snapshot::SnapshotError;
use crate::wal::WalError;
use rand::RngCore;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Length of a run identifier in hex characters
pub const RUN_ID_LEN: usize = 40;

/// Node role in replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No replicas, no upstream
    Standalone,
    /// Serving at least one replica, or recently did
    Primary,
    /// Following an upstream primary
    Replica { host: String, port: u16 },
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Standalone | Role::Primary => "master",
            Role::Replica { .. } => "slave",
        }
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, Role::Replica { .. })
    }
}

/// Fresh 40-character hex run identifier
pub fn generate_run_id() -> String {
    let mut raw = [0u8; RUN_ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Whether `value` has the run identifier shape
pub fn is_valid_run_id(value: &str) -> bool {
    value.len() == RUN_ID_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Reconnect delays for the replica link
pub struct ExponentialBackoff {
    current: Duration,
    config: BackoffConfig,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempts: 0,
        }
    }

    /// Get the next backoff duration
    pub fn next_delay(&mut self) -> Duration {
        let backoff = self.current;

        self.attempts += 1;
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier).min(self.config.max.as_secs_f64()),
        );

        debug!("Backoff attempt {}: waiting {:?}", self.attempts, backoff);
        backoff
    }

    /// Reset the backoff to initial value
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Primary rejected the handshake: {0}")]
    Rejected(String),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Invalid PSYNC offset '{0}'")]
    InvalidOffset(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Replication link superseded")]
    Superseded,

    #[error("Coordinator has shut down")]
    CoordinatorGone,
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;
