//! Primary/replica pairs over real TCP connections

use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tidekv_core::replication::{encode_ack, is_getack, FrameReader, HandshakeReply};
use tidekv_core::resp::{encode_command, Frame};
use tidekv_core::snapshot::decode_snapshot;
use tidekv_core::{now_ms, Keyspace, Server, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

async fn start_server(dir: &TempDir, replicaof: Option<SocketAddr>) -> (Server, SocketAddr) {
    let mut config = ServerConfig::default();
    config.server.port = 0;
    config.persistence.dir = dir.path().to_path_buf();
    config.replication.ack_interval_ms = 100;
    config.replication.replicaof = replicaof.map(|addr| addr.to_string());
    let server = Server::start(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    async fn call(&mut self, parts: &[&str]) -> Frame {
        self.stream.write_all(&encode_command(parts)).await.unwrap();
        loop {
            if let Some((frame, consumed)) = Frame::parse(&self.buf).unwrap() {
                self.buf.advance(consumed);
                return frame;
            }
            assert!(self.stream.read_buf(&mut self.buf).await.unwrap() > 0);
        }
    }
}

/// A replica driven by hand, applying the stream to its own key space
struct RawReplica {
    frames: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    keyspace: Keyspace,
    db: usize,
    offset: u64,
}

impl RawReplica {
    async fn psync(addr: SocketAddr, run_id: &str, offset: &str, keyspace: Keyspace) -> (Self, HandshakeReply) {
        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        writer
            .write_all(&encode_command(&["PSYNC", run_id, offset]))
            .await
            .unwrap();
        let mut frames = FrameReader::new(reader, Duration::from_secs(5));
        let line = frames.read_status().await.unwrap().unwrap();
        let reply = HandshakeReply::parse(&line).unwrap();

        let mut replica = Self {
            frames,
            writer,
            keyspace,
            db: 0,
            offset: offset.parse().unwrap_or(0),
        };
        if let HandshakeReply::FullResync { offset, .. } = &reply {
            let len = replica.frames.read_bulk_header().await.unwrap();
            let payload = replica.frames.read_payload(len).await.unwrap();
            let loaded = decode_snapshot(&payload, 16, now_ms()).unwrap();
            replica.keyspace.replace(loaded.databases);
            replica.offset = *offset;
        }
        (replica, reply)
    }

    async fn apply_until(&mut self, target: u64) {
        while self.offset < target {
            let (args, wire_len) = self.frames.read_frame().await.unwrap();
            if is_getack(&args) {
                self.writer.write_all(&encode_ack(self.offset)).await.unwrap();
                continue;
            }
            if args[0].eq_ignore_ascii_case(b"SELECT") {
                self.db = std::str::from_utf8(&args[1]).unwrap().parse().unwrap();
            } else {
                self.keyspace.apply(self.db, &args).unwrap();
            }
            self.offset += wire_len;
        }
        assert_eq!(self.offset, target);
    }
}

fn run_id_of(info: &Frame) -> String {
    let Frame::Bulk(text) = info else {
        panic!("unexpected INFO reply {:?}", info);
    };
    String::from_utf8_lossy(text)
        .lines()
        .find_map(|line| line.strip_prefix("master_replid:").map(str::to_string))
        .unwrap()
}

#[tokio::test]
async fn test_replica_converges_after_full_resync() {
    let primary_dir = TempDir::new().unwrap();
    let (primary, primary_addr) = start_server(&primary_dir, None).await;
    let primary_handle = primary.handle();
    let primary_keys = primary.keyspace();
    tokio::spawn(async move { primary.run().await });

    let mut client = Client::connect(primary_addr).await;
    assert_eq!(client.call(&["SET", "a", "1"]).await, Frame::ok());
    assert_eq!(client.call(&["SELECT", "3"]).await, Frame::ok());
    client.call(&["RPUSH", "list", "x", "y"]).await;
    client.call(&["SET", "ttl", "v", "EX", "1000"]).await;

    let replica_dir = TempDir::new().unwrap();
    let (replica, replica_addr) = start_server(&replica_dir, Some(primary_addr)).await;
    let replica_handle = replica.handle();
    let replica_keys = replica.keyspace();
    tokio::spawn(async move { replica.run().await });

    wait_until("the initial sync", || {
        replica_handle.offset() == primary_handle.offset() && primary_keys.clone_view() == replica_keys.clone_view()
    })
    .await;

    // live stream, crossing databases
    client.call(&["SELECT", "5"]).await;
    client.call(&["HSET", "h", "f", "v"]).await;
    client.call(&["SELECT", "0"]).await;
    client.call(&["INCR", "a"]).await;
    client.call(&["DEL", "missing"]).await;

    wait_until("the live stream", || replica_handle.offset() == primary_handle.offset()).await;
    assert_eq!(primary_keys.clone_view(), replica_keys.clone_view());

    let mut replica_client = Client::connect(replica_addr).await;
    assert_eq!(
        replica_client.call(&["SET", "b", "2"]).await,
        Frame::error("READONLY You can't write against a read only replica.")
    );
    assert_eq!(replica_client.call(&["GET", "a"]).await, Frame::bulk("2"));

    let Frame::Bulk(info) = client.call(&["INFO", "replication"]).await else {
        panic!("INFO must return a bulk string");
    };
    let info = String::from_utf8_lossy(&info).into_owned();
    assert!(info.contains("connected_slaves:1"));
    assert!(info.contains(&format!("port={}", replica_addr.port())));
}

#[tokio::test]
async fn test_partial_resync_matches_full_resync() {
    let dir = TempDir::new().unwrap();
    let (primary, addr) = start_server(&dir, None).await;
    let handle = primary.handle();
    let primary_keys = primary.keyspace();
    tokio::spawn(async move { primary.run().await });

    let mut client = Client::connect(addr).await;
    client.call(&["SET", "k1", "v1"]).await;

    let (mut first, reply) = RawReplica::psync(addr, "?", "-1", Keyspace::new(16)).await;
    let HandshakeReply::FullResync { run_id, .. } = reply else {
        panic!("expected a full resync, got {:?}", reply);
    };
    assert_eq!(run_id, run_id_of(&client.call(&["INFO"]).await));

    client.call(&["SET", "k2", "v2"]).await;
    first.apply_until(handle.offset()).await;
    let resume_at = first.offset;
    let keyspace = Keyspace::new(16);
    keyspace.replace(first.keyspace.clone_view());
    drop(first);

    // writes made while the replica is away stay in the backlog
    client.call(&["SELECT", "1"]).await;
    client.call(&["SADD", "s", "a", "b"]).await;
    client.call(&["LPUSH", "l", "z"]).await;

    let (mut resumed, reply) = RawReplica::psync(addr, &run_id, &resume_at.to_string(), keyspace).await;
    assert_eq!(reply, HandshakeReply::Continue { run_id: Some(run_id.clone()) });
    resumed.db = 0;
    resumed.apply_until(handle.offset()).await;

    // a newcomer may be seeded from the cached snapshot and catch up from the backlog
    let (mut fresh, reply) = RawReplica::psync(addr, "?", "-1", Keyspace::new(16)).await;
    assert!(matches!(reply, HandshakeReply::FullResync { offset, .. } if offset <= handle.offset()));
    fresh.apply_until(handle.offset()).await;

    assert_eq!(resumed.keyspace.clone_view(), primary_keys.clone_view());
    assert_eq!(fresh.keyspace.clone_view(), primary_keys.clone_view());

    // another lineage cannot continue even with a valid offset
    let (_, reply) = RawReplica::psync(addr, &"0".repeat(40), &resume_at.to_string(), Keyspace::new(16)).await;
    assert!(matches!(reply, HandshakeReply::FullResync { .. }));
}

#[tokio::test]
async fn test_slaveof_no_one_starts_new_lineage() {
    let primary_dir = TempDir::new().unwrap();
    let (primary, primary_addr) = start_server(&primary_dir, None).await;
    let primary_handle = primary.handle();
    tokio::spawn(async move { primary.run().await });
    Client::connect(primary_addr).await.call(&["SET", "a", "1"]).await;

    let replica_dir = TempDir::new().unwrap();
    let (replica, replica_addr) = start_server(&replica_dir, None).await;
    let replica_handle = replica.handle();
    tokio::spawn(async move { replica.run().await });

    let mut client = Client::connect(replica_addr).await;
    let port = primary_addr.port().to_string();
    assert_eq!(client.call(&["SLAVEOF", "127.0.0.1", &port]).await, Frame::ok());
    wait_until("the sync", || replica_handle.offset() == primary_handle.offset()).await;

    let following = run_id_of(&client.call(&["INFO", "replication"]).await);
    assert_eq!(following, run_id_of(&Client::connect(primary_addr).await.call(&["INFO"]).await));

    assert_eq!(client.call(&["SLAVEOF", "NO", "ONE"]).await, Frame::ok());
    let own = run_id_of(&client.call(&["INFO", "replication"]).await);
    assert_ne!(own, following);
    assert_eq!(client.call(&["SET", "b", "2"]).await, Frame::ok());
    assert_eq!(client.call(&["GET", "a"]).await, Frame::bulk("1"));
}
