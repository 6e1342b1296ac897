//! Replication coordinator
//!
//! One task owns the role, the stream offset, the backlog, the replica
//! descriptors and the routing of committed writes into the WAL and the
//! backlog. Everything else talks to it through [`CoordinatorHandle`].
//!
//! Stream offsets count every byte of the replication stream this node has
//! produced (as a primary or standalone) or applied (as a replica), whether or
//! not a backlog was retaining them. A snapshot captured at offset `C` can
//! therefore only seed a replica while the backlog still holds `C`.

use super::handshake::{run_replica_link, LinkConfig};
use super::message::{encode_select, CoordinatorMsg, Outbound, ReplicaRegistration, SyncRequest};
use super::primary::{decide_psync, PrimaryState, PsyncDecision, ReplicaDescriptor, ReplicaStatus};
use super::{generate_run_id, ReplicationError, ReplicationResult, Role};
use crate::config::ReplicationSettings;
use crate::keyspace::{now_ms, Keyspace};
use crate::monitoring::{BacklogInfo, MasterInfo, PersistenceInfo, ReplicaInfo, ServerInfo};
use crate::resp::{encode_command, Frame};
use crate::snapshot::{decode_snapshot, SnapshotEngine, SnapshotJob, SnapshotMeta, SnapshotOutcome, SnapshotPermit};
use crate::wal::Wal;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Coordinator inbox depth
pub const INBOX_CAPACITY: usize = 1024;

/// Reply to writes received by a replica
pub const READONLY_ERROR: &str = "READONLY You can't write against a read only replica.";

const SAVE_BUSY_ERROR: &str = "ERR Background save already in progress";

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub replication: ReplicationSettings,
    /// Periodic snapshot interval, `None` to disable
    pub snapshot_interval: Option<Duration>,
    /// Port this server accepts connections on, announced to primaries
    pub listening_port: u16,
}

/// Upstream link of a replica
struct UpstreamLink {
    id: u64,
    task: JoinHandle<()>,
    up: bool,
    last_io: Instant,
}

/// A snapshot being encoded on the blocking pool
struct InflightSnapshot {
    meta: SnapshotMeta,
    save_waiters: Vec<oneshot::Sender<Frame>>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    keyspace: Arc<Keyspace>,
    wal: Option<Arc<Wal>>,
    engine: Arc<SnapshotEngine>,

    role: Role,
    run_id: String,
    offset: u64,
    /// Present exactly while the role is `Primary`
    primary: Option<PrimaryState>,
    next_replica_id: u64,
    /// Database the last WAL record targeted, `None` forces a `SELECT`
    wal_db: Option<usize>,
    /// Database the last stream record targeted, `None` forces a `SELECT`
    stream_db: Option<usize>,

    link: Option<UpstreamLink>,
    next_link_id: u64,
    master_run_id: Option<String>,
    upstream_db: usize,

    inflight: Option<InflightSnapshot>,
    snapshot_requested: bool,
    /// Writes since the last completed snapshot
    dirty: u64,
    last_snapshot_at: Instant,

    inbox: mpsc::Receiver<CoordinatorMsg>,
    handle: CoordinatorHandle,
    offset_tx: watch::Sender<u64>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        keyspace: Arc<Keyspace>,
        wal: Option<Arc<Wal>>,
        engine: Arc<SnapshotEngine>,
    ) -> (Self, CoordinatorHandle) {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (offset_tx, offset_rx) = watch::channel(0);
        let handle = CoordinatorHandle {
            tx,
            offset: offset_rx,
        };

        let coordinator = Self {
            config,
            keyspace,
            wal,
            engine,
            role: Role::Standalone,
            run_id: generate_run_id(),
            offset: 0,
            primary: None,
            next_replica_id: 1,
            wal_db: None,
            stream_db: None,
            link: None,
            next_link_id: 0,
            master_run_id: None,
            upstream_db: 0,
            inflight: None,
            snapshot_requested: false,
            dirty: 0,
            last_snapshot_at: Instant::now(),
            inbox,
            handle: handle.clone(),
            offset_tx,
        };
        (coordinator, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut cron = tokio::time::interval(self.config.replication.cron_interval());
        cron.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Coordinator started with run id {}", self.run_id);

        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(CoordinatorMsg::Shutdown { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(msg) => self.handle_message(msg),
                        None => break,
                    }
                }
                _ = cron.tick() => self.cron(),
            }
        }

        info!("Coordinator stopped at offset {}", self.offset);
    }

    fn handle_message(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::Write { db, args, reply } => {
                let _ = reply.send(self.write(db, &args));
            }
            CoordinatorMsg::Sync {
                request,
                peer,
                listening_port,
                reply,
            } => {
                let result = self.sync(request, peer, listening_port);
                if let Err(Ok(registration)) = reply.send(result) {
                    debug!("Replica {} left before its registration", registration.id);
                    self.drop_replica(registration.id);
                }
            }
            CoordinatorMsg::ReplicaAck { id, offset } => {
                let now = Instant::now();
                if let Some(replica) = self.primary.as_mut().and_then(|p| p.replicas.get_mut(&id)) {
                    if !replica.ack(offset, now) {
                        debug!("Replica {} stale ack {} ignored", id, offset);
                    }
                }
            }
            CoordinatorMsg::ReplicaDelivered { id } => {
                let chunk_size = self.config.replication.chunk_size;
                if let Some(primary) = self.primary.as_mut() {
                    if let Some(replica) = primary.replicas.get_mut(&id) {
                        replica.last_seen = Instant::now();
                    }
                    primary.pump(chunk_size);
                }
            }
            CoordinatorMsg::ReplicaClosed { id } => self.drop_replica(id),
            CoordinatorMsg::ReplicaOf { target, reply } => {
                let _ = reply.send(self.replica_of(target));
            }
            CoordinatorMsg::Save { background, reply } => self.save(background, reply),
            CoordinatorMsg::SnapshotDone {
                result,
                dirty_at_capture,
            } => self.snapshot_done(result, dirty_at_capture),
            CoordinatorMsg::Info { reply } => {
                let _ = reply.send(self.info());
            }
            CoordinatorMsg::LinkParams { link, reply } => {
                let params = self
                    .is_current_link(link)
                    .then(|| (self.master_run_id.clone(), self.offset));
                let _ = reply.send(params);
            }
            CoordinatorMsg::LinkUp { link, run_id } => {
                if let Some(upstream) = self.link.as_mut().filter(|l| l.id == link) {
                    upstream.up = true;
                    upstream.last_io = Instant::now();
                    if run_id.is_some() {
                        self.master_run_id = run_id;
                    }
                }
            }
            CoordinatorMsg::LinkDown { link } => {
                if let Some(upstream) = self.link.as_mut().filter(|l| l.id == link) {
                    upstream.up = false;
                }
            }
            CoordinatorMsg::LoadSnapshot {
                link,
                run_id,
                offset,
                payload,
                reply,
            } => {
                let _ = reply.send(self.load_snapshot(link, run_id, offset, payload));
            }
            CoordinatorMsg::Stream {
                link,
                args,
                wire_len,
            } => self.stream(link, args, wire_len),
            CoordinatorMsg::Shutdown { reply } => {
                // handled in `run`
                let _ = reply.send(());
            }
        }
    }

    // --- writes ---------------------------------------------------------

    fn write(&mut self, db: usize, args: &[Bytes]) -> Frame {
        if self.role.is_replica() {
            return Frame::error(READONLY_ERROR);
        }
        match self.keyspace.apply(db, args) {
            Ok(applied) => {
                if let Some(propagate) = applied.propagate {
                    self.commit(db, &propagate, true);
                }
                applied.reply
            }
            Err(e) => Frame::error(e.to_string()),
        }
    }

    /// Log a committed write and, with `stream`, append it to the stream
    fn commit(&mut self, db: usize, args: &[Bytes], stream: bool) {
        self.dirty += 1;
        let record = encode_command(args);

        if let Some(wal) = &self.wal {
            if self.wal_db != Some(db) {
                wal_append(wal, &encode_select(db));
                self.wal_db = Some(db);
            }
            wal_append(wal, &record);
        }

        if stream {
            let mut framed = BytesMut::with_capacity(record.len() + 32);
            if self.stream_db != Some(db) {
                framed.extend_from_slice(&encode_select(db));
                self.stream_db = Some(db);
            }
            framed.extend_from_slice(&record);
            self.emit(&framed);
        }
    }

    fn emit(&mut self, record: &[u8]) {
        self.offset += record.len() as u64;
        self.offset_tx.send_replace(self.offset);

        let chunk_size = self.config.replication.chunk_size;
        let appended = match self.primary.as_mut() {
            None => return,
            Some(primary) => primary.append(record).map(|_| primary.pump(chunk_size)),
        };
        if let Err(e) = appended {
            error!("{}; releasing the backlog and every replica", e);
            self.release_backlog();
        }
    }

    // --- primary side ---------------------------------------------------

    fn promote(&mut self, now: Instant) -> Result<(), String> {
        if self.primary.is_some() {
            return Ok(());
        }
        let state = PrimaryState::new(self.config.replication.backlog_size, self.offset, now)
            .map_err(|e| format!("ERR {}", e))?;
        self.primary = Some(state);
        self.role = Role::Primary;
        self.stream_db = None;
        info!(
            "Acting as primary with run id {}, backlog of {} bytes from offset {}",
            self.run_id, self.config.replication.backlog_size, self.offset
        );
        Ok(())
    }

    /// Back to standalone; dropping the descriptors closes every replica
    fn release_backlog(&mut self) {
        if let Some(primary) = self.primary.take() {
            info!(
                "Releasing replication backlog ({} replicas disconnected)",
                primary.replicas.len()
            );
        }
        if self.role == Role::Primary {
            self.role = Role::Standalone;
        }
    }

    fn drop_replica(&mut self, id: u64) {
        if let Some(primary) = self.primary.as_mut() {
            if let Some(replica) = primary.remove(id, Instant::now()) {
                info!("Replica {} ({}) disconnected", id, replica.addr);
            }
        }
    }

    fn register(&mut self, replica: ReplicaDescriptor) {
        let chunk_size = self.config.replication.chunk_size;
        if let Some(primary) = self.primary.as_mut() {
            primary.register(replica);
            primary.pump(chunk_size);
        }
    }

    fn sync(
        &mut self,
        request: SyncRequest,
        peer: SocketAddr,
        listening_port: Option<u16>,
    ) -> Result<ReplicaRegistration, String> {
        if self.role.is_replica() {
            return Err("ERR replica cannot serve replicas".to_string());
        }

        let now = Instant::now();
        self.promote(now)?;
        let id = self.next_replica_id;
        self.next_replica_id += 1;

        let decision = match &request {
            SyncRequest::Legacy => PsyncDecision::FullResync,
            SyncRequest::Psync(psync) => {
                decide_psync(psync, &self.run_id, self.primary.as_ref().map(|p| &p.backlog))
            }
        };

        match decision {
            PsyncDecision::Continue { offset } => {
                let (mut replica, registration) =
                    ReplicaDescriptor::new(id, peer, listening_port, false, offset, now);
                replica.status = ReplicaStatus::Online;
                replica.send(Outbound::Continue {
                    run_id: self.run_id.clone(),
                });
                info!("Replica {} ({}) continues from offset {}", id, peer, offset);
                self.register(replica);
                Ok(registration)
            }
            PsyncDecision::FullResync => {
                let legacy = request == SyncRequest::Legacy;
                self.full_resync(id, peer, listening_port, legacy, now)
            }
        }
    }

    /// Whether a snapshot taken at `meta` can seed a replica of this lineage
    fn seeds_replica(&self, meta: &SnapshotMeta) -> bool {
        meta.repl_id == self.run_id
            && self
                .primary
                .as_ref()
                .is_some_and(|p| p.backlog.can_serve(meta.repl_offset))
    }

    fn full_resync(
        &mut self,
        id: u64,
        peer: SocketAddr,
        listening_port: Option<u16>,
        legacy: bool,
        now: Instant,
    ) -> Result<ReplicaRegistration, String> {
        if let Some(cached) = self.engine.cached().filter(|c| self.seeds_replica(&c.meta)) {
            let (mut replica, registration) =
                ReplicaDescriptor::new(id, peer, listening_port, legacy, cached.meta.repl_offset, now);
            if !deliver_snapshot(&mut replica, &cached.meta, cached.payload, now) {
                return Err("ERR replica went away".to_string());
            }
            info!(
                "Replica {} ({}) full resync from cached snapshot at offset {}",
                id, peer, cached.meta.repl_offset
            );
            self.register(replica);
            return Ok(registration);
        }

        if let Some(inflight) = &self.inflight {
            if !self.seeds_replica(&inflight.meta) {
                return Err("ERR snapshot in progress, retry later".to_string());
            }
            let capture = inflight.meta.repl_offset;
            let Some(primary) = self.primary.as_mut() else {
                return Err("ERR not a primary".to_string());
            };
            let high = primary.backlog.high_water();
            let (mut replica, registration) =
                ReplicaDescriptor::new(id, peer, listening_port, legacy, capture, now);
            let missed = primary.backlog.read(capture, (high - capture) as usize);
            replica.pending.extend_from_slice(&missed);
            replica.sent_offset = high;
            primary.register(replica);
            info!(
                "Replica {} ({}) waits for the snapshot in progress at offset {}",
                id, peer, capture
            );
            return Ok(registration);
        }

        let permit = self.engine.try_begin().map_err(|e| format!("ERR {}", e))?;
        let (replica, registration) =
            ReplicaDescriptor::new(id, peer, listening_port, legacy, self.offset, now);
        if let Some(primary) = self.primary.as_mut() {
            primary.register(replica);
        }
        info!(
            "Replica {} ({}) needs a full resync, snapshotting at offset {}",
            id, peer, self.offset
        );
        self.start_snapshot(permit);
        Ok(registration)
    }

    // --- snapshots ------------------------------------------------------

    fn lineage(&self) -> String {
        match &self.role {
            Role::Replica { .. } => self
                .master_run_id
                .clone()
                .unwrap_or_else(|| self.run_id.clone()),
            _ => self.run_id.clone(),
        }
    }

    /// Capture the key space and rotate the WAL at the current offset
    fn capture(&mut self) -> SnapshotJob {
        let wal_segment = match &self.wal {
            Some(wal) => match wal.rotate() {
                Ok(segment) => segment,
                Err(e) => crate::fatal("WAL rotation failed", &e),
            },
            None => 0,
        };
        self.wal_db = None;
        self.stream_db = None;

        SnapshotJob {
            meta: SnapshotMeta::new(self.lineage(), self.offset, wal_segment),
            databases: self.keyspace.clone_view(),
            now: now_ms(),
        }
    }

    fn start_snapshot(&mut self, permit: SnapshotPermit) {
        let job = self.capture();
        let dirty_at_capture = self.dirty;
        debug!(
            "Snapshot captured at offset {} (WAL segment {})",
            job.meta.repl_offset, job.meta.wal_segment
        );
        self.inflight = Some(InflightSnapshot {
            meta: job.meta.clone(),
            save_waiters: Vec::new(),
        });
        self.snapshot_requested = false;

        let engine = Arc::clone(&self.engine);
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || engine.run(job, &permit)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("snapshot task failed: {}", e)),
            };
            let _ = tx
                .send(CoordinatorMsg::SnapshotDone {
                    result,
                    dirty_at_capture,
                })
                .await;
        });
    }

    /// Start a snapshot now, or as soon as the running one finishes
    fn request_snapshot(&mut self) {
        if self.inflight.is_some() {
            self.snapshot_requested = true;
            return;
        }
        match self.engine.try_begin() {
            Ok(permit) => self.start_snapshot(permit),
            Err(_) => self.snapshot_requested = true,
        }
    }

    fn save(&mut self, background: bool, reply: oneshot::Sender<Frame>) {
        if self.inflight.is_some() {
            let _ = reply.send(Frame::error(SAVE_BUSY_ERROR));
            return;
        }
        let Ok(permit) = self.engine.try_begin() else {
            let _ = reply.send(Frame::error(SAVE_BUSY_ERROR));
            return;
        };

        self.start_snapshot(permit);
        if background {
            let _ = reply.send(Frame::Simple("Background saving started".to_string()));
        } else if let Some(inflight) = self.inflight.as_mut() {
            inflight.save_waiters.push(reply);
        }
    }

    fn snapshot_done(&mut self, result: Result<SnapshotOutcome, String>, dirty_at_capture: u64) {
        let waiters = self
            .inflight
            .take()
            .map(|inflight| inflight.save_waiters)
            .unwrap_or_default();
        let now = Instant::now();

        match result {
            Ok(outcome) => {
                self.dirty = self.dirty.saturating_sub(dirty_at_capture);
                self.last_snapshot_at = now;
                if let Some(wal) = &self.wal {
                    match wal.compact(outcome.meta.wal_segment) {
                        Ok(0) => {}
                        Ok(removed) => debug!("Compacted {} WAL segments", removed),
                        Err(e) => warn!("WAL compaction failed: {}", e),
                    }
                }
                for waiter in waiters {
                    let _ = waiter.send(Frame::ok());
                }
                self.serve_waiting_replicas(&outcome, now);
            }
            Err(e) => {
                error!("Snapshot failed: {}", e);
                for waiter in waiters {
                    let _ = waiter.send(Frame::error(format!("ERR snapshot failed: {}", e)));
                }
                if let Some(primary) = self.primary.as_mut() {
                    for id in waiting_ids(primary) {
                        warn!("Dropping replica {}: no snapshot to send", id);
                        primary.remove(id, now);
                    }
                }
            }
        }

        if self.snapshot_requested {
            self.request_snapshot();
        }
    }

    fn serve_waiting_replicas(&mut self, outcome: &SnapshotOutcome, now: Instant) {
        let chunk_size = self.config.replication.chunk_size;
        let same_lineage = outcome.meta.repl_id == self.run_id;
        let Some(primary) = self.primary.as_mut() else {
            return;
        };

        for id in waiting_ids(primary) {
            let delivered = same_lineage
                && primary
                    .replicas
                    .get_mut(&id)
                    .is_some_and(|r| deliver_snapshot(r, &outcome.meta, outcome.payload.clone(), now));
            if delivered {
                info!(
                    "Replica {} full resync at offset {} ({} bytes)",
                    id,
                    outcome.meta.repl_offset,
                    outcome.payload.len()
                );
            } else {
                warn!("Dropping replica {}: snapshot could not be delivered", id);
                primary.remove(id, now);
            }
        }
        primary.pump(chunk_size);
    }

    // --- replica side ---------------------------------------------------

    fn replica_of(&mut self, target: Option<(String, u16)>) -> Frame {
        let Some((host, port)) = target else {
            if self.role.is_replica() {
                self.stop_link();
                self.role = Role::Standalone;
                self.run_id = generate_run_id();
                self.master_run_id = None;
                self.stream_db = None;
                info!(
                    "Replication stopped, new lineage {} continues at offset {}",
                    self.run_id, self.offset
                );
            }
            return Frame::ok();
        };

        if matches!(&self.role, Role::Replica { host: h, port: p } if *h == host && *p == port) {
            return Frame::Simple("OK Already connected to specified master".to_string());
        }

        self.release_backlog();
        self.stop_link();
        self.role = Role::Replica {
            host: host.clone(),
            port,
        };
        self.master_run_id = None;
        info!("Replicating from {}:{}", host, port);
        self.start_link(host, port);
        Frame::ok()
    }

    fn start_link(&mut self, host: String, port: u16) {
        self.next_link_id += 1;
        let id = self.next_link_id;
        let settings = &self.config.replication;
        let config = LinkConfig {
            link: id,
            host,
            port,
            listening_port: self.config.listening_port,
            backoff: settings.backoff(),
            ack_interval: settings.ack_interval(),
            io_timeout: settings.replica_timeout(),
        };
        let task = tokio::spawn(run_replica_link(config, self.handle.clone()));
        self.link = Some(UpstreamLink {
            id,
            task,
            up: false,
            last_io: Instant::now(),
        });
    }

    fn stop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
        }
    }

    fn is_current_link(&self, link: u64) -> bool {
        self.role.is_replica() && self.link.as_ref().is_some_and(|l| l.id == link)
    }

    fn load_snapshot(
        &mut self,
        link: u64,
        run_id: Option<String>,
        offset: u64,
        payload: Bytes,
    ) -> Result<(), String> {
        if !self.is_current_link(link) {
            return Err(ReplicationError::Superseded.to_string());
        }
        let loaded = decode_snapshot(&payload, self.keyspace.database_count(), now_ms())
            .map_err(|e| e.to_string())?;

        self.keyspace.replace(loaded.databases);
        self.engine.invalidate_cache();
        self.master_run_id = run_id;
        self.offset = offset;
        self.offset_tx.send_replace(offset);
        self.upstream_db = 0;
        if let Some(upstream) = self.link.as_mut() {
            upstream.last_io = Instant::now();
        }
        info!(
            "Loaded {} keys from the primary, streaming from offset {}",
            loaded.keys, offset
        );

        self.dirty += 1;
        self.request_snapshot();
        Ok(())
    }

    fn stream(&mut self, link: u64, args: Vec<Bytes>, wire_len: u64) {
        if !self.is_current_link(link) {
            return;
        }
        if let Some(upstream) = self.link.as_mut() {
            upstream.last_io = Instant::now();
        }

        let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
        match name.as_slice() {
            b"SELECT" => match parse_db(&args).filter(|db| self.keyspace.check_db(*db).is_ok()) {
                Some(db) => self.upstream_db = db,
                None => warn!("Ignoring invalid SELECT from the primary"),
            },
            b"PING" => {}
            _ => {
                let db = self.upstream_db;
                match self.keyspace.apply(db, &args) {
                    Ok(applied) => {
                        if let Some(propagate) = applied.propagate {
                            self.commit(db, &propagate, false);
                        }
                    }
                    Err(e) => warn!("Replicated command failed: {}", e),
                }
            }
        }

        self.offset += wire_len;
        self.offset_tx.send_replace(self.offset);
    }

    // --- periodic work --------------------------------------------------

    fn cron(&mut self) {
        let now = Instant::now();
        let settings = &self.config.replication;

        let mut expired = false;
        if let Some(primary) = self.primary.as_mut() {
            primary.purge_offline(now);
            primary.evict_lagging(now);
            primary.expire_silent(now, settings.replica_timeout());
            primary.pump(settings.chunk_size);
            primary.probe_idle(now, settings.ping_period());

            expired = settings.backlog_ttl_secs > 0
                && primary.replicas.is_empty()
                && primary.idle_since.is_some_and(|since| {
                    now.saturating_duration_since(since) >= Duration::from_secs(settings.backlog_ttl_secs)
                });
        }
        if expired {
            info!("No replicas for {}s", settings.backlog_ttl_secs);
            self.release_backlog();
        }

        if let Some(interval) = self.config.snapshot_interval {
            if self.dirty > 0
                && self.inflight.is_none()
                && now.saturating_duration_since(self.last_snapshot_at) >= interval
            {
                debug!("{} changes since the last snapshot", self.dirty);
                self.snapshot_requested = true;
            }
        }
        if self.snapshot_requested && self.inflight.is_none() {
            self.request_snapshot();
        }
    }

    fn info(&self) -> ServerInfo {
        let now = Instant::now();
        let replicas = self
            .primary
            .iter()
            .flat_map(|p| p.replicas.values())
            .map(|r| ReplicaInfo {
                ip: r.addr.ip().to_string(),
                port: r.listening_port.unwrap_or(r.addr.port()),
                state: r.status.name(),
                offset: r.acked_offset,
                lag: r.lag_secs(now),
            })
            .collect();
        let backlog = self.primary.as_ref().map(|p| BacklogInfo {
            size: p.backlog.capacity(),
            first_byte_offset: p.backlog.low_water(),
            histlen: p.backlog.histlen(),
        });
        let master = match &self.role {
            Role::Replica { host, port } => Some(MasterInfo {
                host: host.clone(),
                port: *port,
                link_up: self.link.as_ref().is_some_and(|l| l.up),
                last_io_secs: self
                    .link
                    .as_ref()
                    .map(|l| now.saturating_duration_since(l.last_io).as_secs())
                    .unwrap_or(0),
            }),
            _ => None,
        };
        let status = self.engine.status();

        ServerInfo {
            role: self.role.name(),
            run_id: self.lineage(),
            offset: self.offset,
            replicas,
            backlog,
            master,
            persistence: PersistenceInfo {
                bgsave_in_progress: self.inflight.is_some(),
                changes_since_last_save: self.dirty,
                last_save_time: status.last_save_time,
                last_bgsave_ok: status.last_save_ok,
                aof_enabled: self.wal.is_some(),
                aof_current_segment: self.wal.as_ref().map(|w| w.current_segment()),
            },
        }
    }

    async fn shutdown(&mut self) {
        info!("Coordinator shutting down at offset {}", self.offset);
        self.stop_link();
        self.release_backlog();

        match self.wal.clone() {
            Some(wal) => {
                if let Err(e) = wal.quit() {
                    crate::fatal("WAL final flush failed", &e);
                }
            }
            None => {
                // Without a WAL the snapshot is the only durable copy
                let permit = self.engine.begin().await;
                let job = self.capture();
                let engine = Arc::clone(&self.engine);
                match tokio::task::spawn_blocking(move || engine.run(job, &permit)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Snapshot on shutdown failed: {}", e),
                    Err(e) => error!("Snapshot on shutdown failed: {}", e),
                }
            }
        }

        if let Some(inflight) = self.inflight.take() {
            for waiter in inflight.save_waiters {
                let _ = waiter.send(Frame::error("ERR server is shutting down"));
            }
        }
    }
}

fn wal_append(wal: &Wal, record: &[u8]) {
    if let Err(e) = wal.append(record) {
        crate::fatal("WAL append failed", &e);
    }
}

fn waiting_ids(primary: &PrimaryState) -> Vec<u64> {
    primary
        .replicas
        .values()
        .filter(|r| r.status == ReplicaStatus::Initializing)
        .map(|r| r.id)
        .collect()
}

/// Queue the snapshot and any stream bytes held for the replica, then mark it
/// online. `false` when the sender is gone.
fn deliver_snapshot(replica: &mut ReplicaDescriptor, meta: &SnapshotMeta, payload: Bytes, now: Instant) -> bool {
    let item = if replica.legacy {
        Outbound::LegacySync { payload }
    } else {
        Outbound::FullResync {
            run_id: meta.repl_id.clone(),
            offset: meta.repl_offset,
            payload,
        }
    };
    if !replica.send(item) {
        return false;
    }
    if !replica.pending.is_empty() {
        let data = replica.pending.split().freeze();
        let end_offset = replica.sent_offset;
        if !replica.send(Outbound::Stream { data, end_offset }) {
            return false;
        }
    }
    replica.status = ReplicaStatus::Online;
    replica.has_acked = false;
    replica.last_seen = now;
    true
}

fn parse_db(args: &[Bytes]) -> Option<usize> {
    std::str::from_utf8(args.get(1)?).ok()?.parse().ok()
}

/// Cloneable front end of the coordinator task
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMsg>,
    offset: watch::Receiver<u64>,
}

impl CoordinatorHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CoordinatorMsg,
    ) -> ReplicationResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ReplicationError::CoordinatorGone)?;
        rx.await.map_err(|_| ReplicationError::CoordinatorGone)
    }

    async fn notify(&self, msg: CoordinatorMsg) {
        if self.tx.send(msg).await.is_err() {
            debug!("Coordinator is gone, message dropped");
        }
    }

    /// Execute a write command
    pub async fn write(&self, db: usize, args: Vec<Bytes>) -> Frame {
        self.call(move |reply| CoordinatorMsg::Write { db, args, reply })
            .await
            .unwrap_or_else(|_| Frame::error("ERR server is shutting down"))
    }

    /// Register a replica. The inner error is the reply for the peer.
    pub async fn sync(
        &self,
        request: SyncRequest,
        peer: SocketAddr,
        listening_port: Option<u16>,
    ) -> ReplicationResult<Result<ReplicaRegistration, String>> {
        self.call(move |reply| CoordinatorMsg::Sync {
            request,
            peer,
            listening_port,
            reply,
        })
        .await
    }

    pub async fn replica_ack(&self, id: u64, offset: u64) {
        self.notify(CoordinatorMsg::ReplicaAck { id, offset }).await
    }

    pub async fn replica_delivered(&self, id: u64) {
        self.notify(CoordinatorMsg::ReplicaDelivered { id }).await
    }

    pub async fn replica_closed(&self, id: u64) {
        self.notify(CoordinatorMsg::ReplicaClosed { id }).await
    }

    /// `SLAVEOF host port`, or `SLAVEOF NO ONE` with `None`
    pub async fn replica_of(&self, target: Option<(String, u16)>) -> Frame {
        self.call(move |reply| CoordinatorMsg::ReplicaOf { target, reply })
            .await
            .unwrap_or_else(|_| Frame::error("ERR server is shutting down"))
    }

    pub async fn save(&self, background: bool) -> Frame {
        self.call(move |reply| CoordinatorMsg::Save { background, reply })
            .await
            .unwrap_or_else(|_| Frame::error("ERR server is shutting down"))
    }

    pub async fn info(&self) -> ReplicationResult<ServerInfo> {
        self.call(|reply| CoordinatorMsg::Info { reply }).await
    }

    /// `(master run id, offset)` to present in `PSYNC`, `None` once the link
    /// has been superseded
    pub async fn link_params(&self, link: u64) -> Option<(Option<String>, u64)> {
        self.call(move |reply| CoordinatorMsg::LinkParams { link, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn link_up(&self, link: u64, run_id: Option<String>) {
        self.notify(CoordinatorMsg::LinkUp { link, run_id }).await
    }

    pub async fn link_down(&self, link: u64) {
        self.notify(CoordinatorMsg::LinkDown { link }).await
    }

    pub async fn load_snapshot(
        &self,
        link: u64,
        run_id: Option<String>,
        offset: u64,
        payload: Bytes,
    ) -> ReplicationResult<Result<(), String>> {
        self.call(move |reply| CoordinatorMsg::LoadSnapshot {
            link,
            run_id,
            offset,
            payload,
            reply,
        })
        .await
    }

    pub async fn stream(&self, link: u64, args: Vec<Bytes>, wire_len: u64) {
        self.notify(CoordinatorMsg::Stream {
            link,
            args,
            wire_len,
        })
        .await
    }

    /// Stop the coordinator after draining the WAL
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| CoordinatorMsg::Shutdown { reply }).await;
    }

    /// Current stream offset
    pub fn offset(&self) -> u64 {
        *self.offset.borrow()
    }
}
