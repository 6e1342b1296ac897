//! Primary-side replication state

use super::backlog::{Backlog, BacklogError};
use super::message::{Outbound, PsyncRequest, ReplicaRegistration};
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Chunks a replica may have queued but not yet written before pumping pauses
pub const PUMP_WINDOW_CHUNKS: u64 = 8;

/// Lifecycle of a registered replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Waiting for its snapshot; stream bytes are held in `pending`
    Initializing,
    /// Receiving the live stream
    Online,
    /// Fell behind the backlog or went silent; about to be dropped
    Offline,
}

impl ReplicaStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaStatus::Initializing => "wait_bgsave",
            ReplicaStatus::Online => "online",
            ReplicaStatus::Offline => "offline",
        }
    }
}

/// One connected replica, owned by the coordinator
#[derive(Debug)]
pub struct ReplicaDescriptor {
    pub id: u64,
    pub addr: SocketAddr,
    pub listening_port: Option<u16>,
    pub status: ReplicaStatus,
    /// Connected with `SYNC` rather than `PSYNC`
    pub legacy: bool,
    pub acked_offset: u64,
    /// Acknowledged anything since its snapshot was delivered. Until then
    /// `acked_offset` is the snapshot offset and says nothing about progress.
    pub has_acked: bool,
    /// Stream bytes accounted to this replica: queued, or held in `pending`
    pub sent_offset: u64,
    pub last_seen: Instant,
    pub last_probe: Instant,
    /// Stream bytes produced after its snapshot was captured, kept until the
    /// snapshot is ready
    pub pending: BytesMut,
    outbound: mpsc::UnboundedSender<Outbound>,
    written: Arc<AtomicU64>,
}

impl ReplicaDescriptor {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        listening_port: Option<u16>,
        legacy: bool,
        offset: u64,
        now: Instant,
    ) -> (Self, ReplicaRegistration) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(AtomicU64::new(offset));
        let descriptor = Self {
            id,
            addr,
            listening_port,
            status: ReplicaStatus::Initializing,
            legacy,
            acked_offset: offset,
            has_acked: false,
            sent_offset: offset,
            last_seen: now,
            last_probe: now,
            pending: BytesMut::new(),
            outbound: tx,
            written: Arc::clone(&written),
        };
        let registration = ReplicaRegistration {
            id,
            outbound: rx,
            written,
        };
        (descriptor, registration)
    }

    /// Queue an item; `false` once the sender task is gone
    pub fn send(&self, item: Outbound) -> bool {
        self.outbound.send(item).is_ok()
    }

    /// Record an acknowledgement. Lower or impossible offsets are ignored.
    pub fn ack(&mut self, offset: u64, now: Instant) -> bool {
        self.last_seen = now;
        if offset <= self.acked_offset || offset > self.sent_offset {
            return false;
        }
        self.acked_offset = offset;
        self.has_acked = true;
        true
    }

    /// Bytes queued to the sender and not yet written to the socket
    pub fn in_flight(&self) -> u64 {
        self.sent_offset
            .saturating_sub(self.written.load(Ordering::Acquire))
    }

    /// Seconds since the replica was last heard from
    pub fn lag_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_seen).as_secs()
    }
}

/// Outcome of a `PSYNC` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsyncDecision {
    /// Stream from this offset, no snapshot
    Continue { offset: u64 },
    FullResync,
}

/// Decide between `CONTINUE` and `FULLRESYNC`.
///
/// Partial resync needs the same lineage and an offset the backlog can still
/// serve; `offset == high_water` is a caught-up replica.
pub fn decide_psync(request: &PsyncRequest, run_id: &str, backlog: Option<&Backlog>) -> PsyncDecision {
    let (Some(requested_id), Some(offset), Some(backlog)) = (&request.run_id, request.offset, backlog) else {
        return PsyncDecision::FullResync;
    };
    if requested_id != run_id {
        debug!("PSYNC run id {} does not match {}", requested_id, run_id);
        return PsyncDecision::FullResync;
    }
    if !backlog.can_serve(offset) {
        debug!(
            "PSYNC offset {} outside backlog [{}, {}]",
            offset,
            backlog.low_water(),
            backlog.high_water()
        );
        return PsyncDecision::FullResync;
    }
    PsyncDecision::Continue { offset }
}

/// Backlog plus replicas; exists only while the process is a primary
#[derive(Debug)]
pub struct PrimaryState {
    pub backlog: Backlog,
    pub replicas: BTreeMap<u64, ReplicaDescriptor>,
    /// When the last replica went away
    pub idle_since: Option<Instant>,
}

impl PrimaryState {
    pub fn new(capacity: usize, start_offset: u64, now: Instant) -> Result<Self, BacklogError> {
        Ok(Self {
            backlog: Backlog::new(capacity, start_offset)?,
            replicas: BTreeMap::new(),
            idle_since: Some(now),
        })
    }

    pub fn register(&mut self, replica: ReplicaDescriptor) {
        self.idle_since = None;
        self.replicas.insert(replica.id, replica);
    }

    pub fn remove(&mut self, id: u64, now: Instant) -> Option<ReplicaDescriptor> {
        let removed = self.replicas.remove(&id);
        if self.replicas.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
        removed
    }

    /// Append one record to the stream, holding a copy for every replica
    /// still waiting on its snapshot
    pub fn append(&mut self, record: &[u8]) -> Result<u64, BacklogError> {
        let offset = self.backlog.append(record)?;
        for replica in self.replicas.values_mut() {
            if replica.status == ReplicaStatus::Initializing {
                replica.pending.extend_from_slice(record);
                replica.sent_offset += record.len() as u64;
            }
        }
        Ok(offset)
    }

    /// Queue unread backlog bytes to online replicas, `chunk_size` at a time,
    /// until each is caught up or has a full window in flight
    pub fn pump(&mut self, chunk_size: usize) {
        let window = chunk_size as u64 * PUMP_WINDOW_CHUNKS;
        let high = self.backlog.high_water();
        let mut gone = Vec::new();

        for replica in self.replicas.values_mut() {
            if replica.status != ReplicaStatus::Online {
                continue;
            }
            while replica.sent_offset < high && replica.in_flight() < window {
                let data = self.backlog.read(replica.sent_offset, chunk_size);
                if data.is_empty() {
                    break;
                }
                let end_offset = replica.sent_offset + data.len() as u64;
                if !replica.send(Outbound::Stream { data, end_offset }) {
                    gone.push(replica.id);
                    break;
                }
                replica.sent_offset = end_offset;
            }
        }

        for id in gone {
            replica_gone(&mut self.replicas, id);
        }
    }

    /// Mark online replicas that the backlog has overrun as offline and drop
    /// them. A replica that has not acked since its snapshot is judged by what
    /// was sent to it alone. Returns the dropped ids.
    pub fn evict_lagging(&mut self, now: Instant) -> Vec<u64> {
        let low = self.backlog.low_water();
        let lagging: Vec<u64> = self
            .replicas
            .values_mut()
            .filter(|r| {
                r.status == ReplicaStatus::Online && (r.sent_offset < low || (r.has_acked && r.acked_offset < low))
            })
            .map(|r| {
                r.status = ReplicaStatus::Offline;
                warn!(
                    "Replica {} ({}) fell behind the backlog (acked {}, low-water {}), dropping",
                    r.id, r.addr, r.acked_offset, low
                );
                r.id
            })
            .collect();
        for id in &lagging {
            self.remove(*id, now);
        }
        lagging
    }

    /// Drop online replicas not heard from within `timeout`
    pub fn expire_silent(&mut self, now: Instant, timeout: Duration) -> Vec<u64> {
        let silent: Vec<u64> = self
            .replicas
            .values()
            .filter(|r| r.status == ReplicaStatus::Online && now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.id)
            .collect();
        for id in &silent {
            warn!("Replica {} timed out, dropping", id);
            self.remove(*id, now);
        }
        silent
    }

    /// Probe caught-up replicas that have not been probed for `period`.
    ///
    /// A replica counts as caught up when every backlog byte has been queued,
    /// which also puts the probe on a command boundary.
    pub fn probe_idle(&mut self, now: Instant, period: Duration) {
        let high = self.backlog.high_water();
        for replica in self.replicas.values_mut() {
            if replica.status == ReplicaStatus::Online
                && replica.sent_offset == high
                && now.saturating_duration_since(replica.last_probe) >= period
            {
                replica.last_probe = now;
                replica.send(Outbound::Probe);
            }
        }
    }

    /// Drop replicas whose sender task has gone away
    pub fn purge_offline(&mut self, now: Instant) -> Vec<u64> {
        let offline: Vec<u64> = self
            .replicas
            .values()
            .filter(|r| r.status == ReplicaStatus::Offline)
            .map(|r| r.id)
            .collect();
        for id in &offline {
            self.remove(*id, now);
        }
        offline
    }
}

fn replica_gone(replicas: &mut BTreeMap<u64, ReplicaDescriptor>, id: u64) {
    if let Some(replica) = replicas.get_mut(&id) {
        debug!("Replica {} sender is gone", id);
        replica.status = ReplicaStatus::Offline;
    }
}
