//! TCP server
//!
//! Restores persisted state, then serves RESP clients. Writes go through the
//! coordinator; reads hit the key space directly. A connection that issues
//! `SYNC`/`PSYNC` is handed over to the replica sender.

use crate::config::ServerConfig;
use crate::keyspace::{command_kind, command_name, now_ms, CommandKind, Keyspace};
use crate::monitoring::render_info;
use crate::replication::{
    serve_replica, Coordinator, CoordinatorConfig, CoordinatorHandle, PsyncRequest, SyncRequest,
    DEFAULT_SEND_TIMEOUT,
};
use crate::resp::Frame;
use crate::snapshot::{load_snapshot_file, SnapshotEngine};
use crate::wal::{replay_segments, Wal};
use anyhow::{Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State shared by every connection task
struct Shared {
    keyspace: Arc<Keyspace>,
    engine: Arc<SnapshotEngine>,
    handle: CoordinatorHandle,
    shutdown: watch::Sender<bool>,
}

/// A running tidekv server
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    coordinator_task: JoinHandle<()>,
    flush_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Restore persisted state, bind the listener and start the coordinator
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let persistence = &config.persistence;
        std::fs::create_dir_all(&persistence.dir)
            .with_context(|| format!("Failed to create data directory {}", persistence.dir.display()))?;

        let keyspace = Arc::new(Keyspace::new(config.server.databases));
        let snapshot_path = config.snapshot_path();
        let mut wal_from = 0;
        if let Some(loaded) = load_snapshot_file(&snapshot_path, keyspace.database_count(), now_ms())
            .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?
        {
            info!(
                "Loaded {} keys from {} (offset {}, WAL segment {})",
                loaded.keys,
                snapshot_path.display(),
                loaded.meta.repl_offset,
                loaded.meta.wal_segment
            );
            wal_from = loaded.meta.wal_segment;
            keyspace.replace(loaded.databases);
        }

        let (wal, flush_task) = if persistence.wal_enabled {
            let stats = replay_segments(&persistence.dir, wal_from, &keyspace).context("WAL replay failed")?;
            if stats.errors > 0 {
                warn!("WAL replay rejected {} command(s)", stats.errors);
            }
            let wal = Arc::new(Wal::open(config.wal_config(), wal_from).context("Failed to open WAL")?);
            let flush_task = wal.spawn_flush_task();
            (Some(wal), Some(flush_task))
        } else {
            info!("WAL disabled, relying on snapshots");
            (None, None)
        };

        let listener = TcpListener::bind(config.bind_address())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
        let local_addr = listener.local_addr()?;

        let engine = Arc::new(SnapshotEngine::new(snapshot_path));
        let snapshot_interval = (persistence.snapshot_interval_secs > 0)
            .then(|| Duration::from_secs(persistence.snapshot_interval_secs));
        let coordinator_config = CoordinatorConfig {
            replication: config.replication.clone(),
            snapshot_interval,
            listening_port: local_addr.port(),
        };
        let (coordinator, handle) =
            Coordinator::new(coordinator_config, Arc::clone(&keyspace), wal, Arc::clone(&engine));
        let coordinator_task = coordinator.spawn();

        if let Some(target) = config.replication.replicaof_target()? {
            handle.replica_of(Some(target)).await;
        }

        let (shutdown, _) = watch::channel(false);
        info!("tidekv listening on {}", local_addr);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                keyspace,
                engine,
                handle,
                shutdown,
            }),
            coordinator_task,
            flush_task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.shared.handle.clone()
    }

    pub fn keyspace(&self) -> Arc<Keyspace> {
        Arc::clone(&self.shared.keyspace)
    }

    /// Accept connections until `SHUTDOWN` is received
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Client connected from {}", peer);
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(shared, stream, peer).await {
                                warn!("Client {} error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the coordinator, draining and syncing the WAL
    pub async fn shutdown(self) {
        self.shared.shutdown.send_replace(true);
        self.shared.handle.shutdown().await;
        if let Err(e) = self.coordinator_task.await {
            error!("Coordinator task failed: {}", e);
        }
        if let Some(flush_task) = self.flush_task {
            if let Err(e) = flush_task.await {
                error!("WAL flush task failed: {}", e);
            }
        }
        info!("tidekv stopped");
    }
}

/// Per-connection state
struct Session {
    peer: SocketAddr,
    db: usize,
    listening_port: Option<u16>,
}

/// What a command asks the connection loop to do
enum Action {
    Reply(Frame),
    /// `REPLCONF ACK` and friends
    NoReply,
    Close(Frame),
    Sync(SyncRequest),
    Shutdown,
}

async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut session = Session {
        peer,
        db: 0,
        listening_port: None,
    };
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = BytesMut::new();

    loop {
        loop {
            let parsed = match Frame::parse(&buf) {
                Ok(parsed) => parsed,
                Err(e) => {
                    Frame::error(format!("ERR {}", e)).encode_into(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            };
            let Some((frame, consumed)) = parsed else {
                break;
            };
            buf.advance(consumed);
            let Ok(args) = frame.into_args() else {
                continue;
            };

            match execute(&shared, &mut session, args).await {
                Action::Reply(reply) => reply.encode_into(&mut out),
                Action::NoReply => {}
                Action::Close(reply) => {
                    reply.encode_into(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
                Action::Sync(request) => {
                    match shared.handle.sync(request, peer, session.listening_port).await? {
                        Ok(registration) => {
                            stream.write_all(&out).await?;
                            info!("Client {} became replica {}", peer, registration.id);
                            serve_replica(
                                stream,
                                buf.split(),
                                registration,
                                shared.handle.clone(),
                                DEFAULT_SEND_TIMEOUT,
                            )
                            .await;
                            return Ok(());
                        }
                        Err(message) => Frame::error(message).encode_into(&mut out),
                    }
                }
                Action::Shutdown => {
                    stream.write_all(&out).await?;
                    shared.shutdown.send_replace(true);
                    return Ok(());
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
        if stream.read_buf(&mut buf).await? == 0 {
            debug!("Client {} disconnected", peer);
            return Ok(());
        }
    }
}

fn wrong_arity(name: &str) -> Action {
    Action::Reply(Frame::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    )))
}

fn parse_number<T: std::str::FromStr>(arg: &Bytes) -> Option<T> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

async fn execute(shared: &Shared, session: &mut Session, args: Vec<Bytes>) -> Action {
    let name = match command_name(&args) {
        Ok(name) => name,
        Err(e) => return Action::Reply(Frame::error(e.to_string())),
    };

    match name.as_str() {
        "PING" => match args.len() {
            1 => Action::Reply(Frame::Simple("PONG".to_string())),
            2 => Action::Reply(Frame::Bulk(args[1].clone())),
            _ => wrong_arity(&name),
        },
        "ECHO" if args.len() == 2 => Action::Reply(Frame::Bulk(args[1].clone())),
        "ECHO" => wrong_arity(&name),
        "SELECT" if args.len() == 2 => match parse_number::<usize>(&args[1]) {
            Some(db) if shared.keyspace.check_db(db).is_ok() => {
                session.db = db;
                Action::Reply(Frame::ok())
            }
            Some(_) => Action::Reply(Frame::error("ERR DB index is out of range")),
            None => Action::Reply(Frame::error("ERR value is not an integer or out of range")),
        },
        "SELECT" => wrong_arity(&name),
        "QUIT" => Action::Close(Frame::ok()),
        "SHUTDOWN" => {
            info!("SHUTDOWN requested by {}", session.peer);
            Action::Shutdown
        }
        "REPLCONF" => replconf(session, &args),
        "SYNC" => Action::Sync(SyncRequest::Legacy),
        "PSYNC" if args.len() == 3 => match PsyncRequest::parse(&args[1], &args[2]) {
            Ok(request) => Action::Sync(SyncRequest::Psync(request)),
            Err(e) => Action::Reply(Frame::error(format!("ERR {}", e))),
        },
        "PSYNC" => wrong_arity(&name),
        "SLAVEOF" | "REPLICAOF" if args.len() == 3 => {
            if args[1].eq_ignore_ascii_case(b"NO") && args[2].eq_ignore_ascii_case(b"ONE") {
                return Action::Reply(shared.handle.replica_of(None).await);
            }
            match parse_number::<u16>(&args[2]).filter(|port| *port > 0) {
                Some(port) => {
                    let host = String::from_utf8_lossy(&args[1]).into_owned();
                    Action::Reply(shared.handle.replica_of(Some((host, port))).await)
                }
                None => Action::Reply(Frame::error("ERR Invalid master port")),
            }
        }
        "SLAVEOF" | "REPLICAOF" => wrong_arity(&name),
        "SAVE" => Action::Reply(shared.handle.save(false).await),
        "BGSAVE" => Action::Reply(shared.handle.save(true).await),
        "LASTSAVE" => Action::Reply(Frame::Integer(shared.engine.status().last_save_time)),
        "INFO" => match shared.handle.info().await {
            Ok(info) => {
                let section = args.get(1).map(|s| String::from_utf8_lossy(s).into_owned());
                Action::Reply(Frame::bulk(render_info(&info, section.as_deref())))
            }
            Err(e) => Action::Reply(Frame::error(format!("ERR {}", e))),
        },
        _ => match command_kind(&name) {
            CommandKind::Write => Action::Reply(shared.handle.write(session.db, args).await),
            _ => match shared.keyspace.apply(session.db, &args) {
                Ok(applied) => Action::Reply(applied.reply),
                Err(e) => Action::Reply(Frame::error(e.to_string())),
            },
        },
    }
}

fn replconf(session: &mut Session, args: &[Bytes]) -> Action {
    let Some(option) = args.get(1) else {
        return wrong_arity("REPLCONF");
    };
    let option = String::from_utf8_lossy(option).to_ascii_lowercase();
    match option.as_str() {
        "listening-port" => match args.get(2).and_then(parse_number::<u16>) {
            Some(port) => {
                session.listening_port = Some(port);
                Action::Reply(Frame::ok())
            }
            None => Action::Reply(Frame::error("ERR invalid listening port")),
        },
        // acknowledgements only mean something on a registered replica link
        "ack" | "getack" => Action::NoReply,
        _ => Action::Reply(Frame::ok()),
    }
}
