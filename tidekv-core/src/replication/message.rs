//! Coordinator messages and replication wire framing

use super::{is_valid_run_id, ReplicationError};
use crate::monitoring::ServerInfo;
use crate::resp::{encode_command, Frame};
use crate::snapshot::SnapshotOutcome;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// How a replica asked to synchronize
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// `SYNC`: always a full transfer, no handshake header
    Legacy,
    /// `PSYNC <run-id> <offset>`
    Psync(PsyncRequest),
}

/// Parsed `PSYNC` arguments. `None` stands for `?` and `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsyncRequest {
    pub run_id: Option<String>,
    pub offset: Option<u64>,
}

impl PsyncRequest {
    pub fn parse(run_id: &[u8], offset: &[u8]) -> Result<Self, ReplicationError> {
        let run_id = match run_id {
            b"?" => None,
            other => Some(String::from_utf8_lossy(other).into_owned()),
        };
        let raw = String::from_utf8_lossy(offset);
        let offset = match raw.as_ref() {
            "-1" => None,
            other => Some(
                other
                    .parse::<u64>()
                    .map_err(|_| ReplicationError::InvalidOffset(other.to_string()))?,
            ),
        };
        Ok(Self { run_id, offset })
    }

    /// `PSYNC ? -1`
    pub fn full() -> Self {
        Self {
            run_id: None,
            offset: None,
        }
    }
}

/// Items a replica sender task writes to its socket, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// `+FULLRESYNC <run-id> <offset>` then the snapshot as `$<len>` + bytes
    FullResync {
        run_id: String,
        offset: u64,
        payload: Bytes,
    },
    /// `$<len>` + snapshot bytes
    LegacySync { payload: Bytes },
    /// `+CONTINUE <run-id>`
    Continue { run_id: String },
    /// Stream bytes ending at stream offset `end_offset`
    Stream { data: Bytes, end_offset: u64 },
    /// `REPLCONF GETACK *`, only ever queued at a frame boundary
    Probe,
}

/// Handed to the connection that turns into a replica sender
#[derive(Debug)]
pub struct ReplicaRegistration {
    pub id: u64,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Stream offset the sender has written up to
    pub written: Arc<AtomicU64>,
}

/// What the primary answered to `PSYNC`/`SYNC`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    FullResync { run_id: String, offset: u64 },
    Continue { run_id: Option<String> },
}

impl HandshakeReply {
    /// Parse a simple-string reply line (without the leading `+` and CRLF)
    pub fn parse(line: &str) -> Result<Self, ReplicationError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(word) if word.eq_ignore_ascii_case("FULLRESYNC") => {
                let (Some(run_id), Some(offset), None) = (parts.next(), parts.next(), parts.next()) else {
                    return Err(ReplicationError::ProtocolError(format!(
                        "malformed FULLRESYNC reply '{}'",
                        line
                    )));
                };
                if !is_valid_run_id(run_id) {
                    return Err(ReplicationError::ProtocolError(format!(
                        "invalid run id '{}'",
                        run_id
                    )));
                }
                let offset = offset
                    .parse::<u64>()
                    .map_err(|_| ReplicationError::InvalidOffset(offset.to_string()))?;
                Ok(HandshakeReply::FullResync {
                    run_id: run_id.to_string(),
                    offset,
                })
            }
            Some(word) if word.eq_ignore_ascii_case("CONTINUE") => {
                let run_id = parts.next();
                if parts.next().is_some() || run_id.is_some_and(|id| !is_valid_run_id(id)) {
                    return Err(ReplicationError::ProtocolError(format!(
                        "malformed CONTINUE reply '{}'",
                        line
                    )));
                }
                Ok(HandshakeReply::Continue {
                    run_id: run_id.map(str::to_string),
                })
            }
            _ => Err(ReplicationError::ProtocolError(format!(
                "unexpected PSYNC reply '{}'",
                line
            ))),
        }
    }
}

/// `+FULLRESYNC <run-id> <offset>\r\n$<len>\r\n`
pub fn encode_fullresync_header(run_id: &str, offset: u64, payload_len: usize) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(format!("+FULLRESYNC {} {}\r\n", run_id, offset).as_bytes());
    out.put_slice(&encode_bulk_header(payload_len));
    out.freeze()
}

/// `+CONTINUE <run-id>\r\n`
pub fn encode_continue(run_id: &str) -> Bytes {
    Bytes::from(format!("+CONTINUE {}\r\n", run_id))
}

/// `$<len>\r\n`, the prefix of a snapshot payload (no trailing CRLF follows)
pub fn encode_bulk_header(len: usize) -> Bytes {
    Bytes::from(format!("${}\r\n", len))
}

/// The keepalive probe
pub fn encode_getack() -> Bytes {
    encode_command(&["REPLCONF", "GETACK", "*"])
}

/// A replica's acknowledgement
pub fn encode_ack(offset: u64) -> Bytes {
    encode_command(&[b"REPLCONF".as_slice(), b"ACK", offset.to_string().as_bytes()])
}

/// `SELECT <db>` as stream bytes
pub fn encode_select(db: usize) -> Bytes {
    encode_command(&[b"SELECT".as_slice(), db.to_string().as_bytes()])
}

/// Whether a command is `REPLCONF GETACK`
pub fn is_getack(args: &[Bytes]) -> bool {
    args.len() >= 2
        && args[0].eq_ignore_ascii_case(b"REPLCONF")
        && args[1].eq_ignore_ascii_case(b"GETACK")
}

/// Offset carried by `REPLCONF ACK <offset>`
pub fn parse_ack(args: &[Bytes]) -> Option<u64> {
    if args.len() >= 3 && args[0].eq_ignore_ascii_case(b"REPLCONF") && args[1].eq_ignore_ascii_case(b"ACK") {
        std::str::from_utf8(&args[2]).ok()?.parse().ok()
    } else {
        None
    }
}

/// Coordinator inbox
pub enum CoordinatorMsg {
    /// A client write to execute, log and propagate
    Write {
        db: usize,
        args: Vec<Bytes>,
        reply: oneshot::Sender<Frame>,
    },
    /// A connection asked to become a replica
    Sync {
        request: SyncRequest,
        peer: SocketAddr,
        listening_port: Option<u16>,
        reply: oneshot::Sender<Result<ReplicaRegistration, String>>,
    },
    ReplicaAck {
        id: u64,
        offset: u64,
    },
    /// The sender finished writing the snapshot payload
    ReplicaDelivered {
        id: u64,
    },
    ReplicaClosed {
        id: u64,
    },
    /// `SLAVEOF host port` or, with `None`, `SLAVEOF NO ONE`
    ReplicaOf {
        target: Option<(String, u16)>,
        reply: oneshot::Sender<Frame>,
    },
    /// `SAVE` (reply when done) or `BGSAVE` (reply when started)
    Save {
        background: bool,
        reply: oneshot::Sender<Frame>,
    },
    SnapshotDone {
        result: Result<SnapshotOutcome, String>,
        dirty_at_capture: u64,
    },
    Info {
        reply: oneshot::Sender<ServerInfo>,
    },
    /// Replica link asking what to present in `PSYNC`; `None` if superseded
    LinkParams {
        link: u64,
        reply: oneshot::Sender<Option<(Option<String>, u64)>>,
    },
    LinkUp {
        link: u64,
        run_id: Option<String>,
    },
    LinkDown {
        link: u64,
    },
    /// Snapshot received from the primary during a full resync
    LoadSnapshot {
        link: u64,
        run_id: Option<String>,
        offset: u64,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// One command received from the primary
    Stream {
        link: u64,
        args: Vec<Bytes>,
        wire_len: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psync_parse() {
        assert_eq!(PsyncRequest::parse(b"?", b"-1").unwrap(), PsyncRequest::full());
        let id = "a".repeat(40);
        assert_eq!(
            PsyncRequest::parse(id.as_bytes(), b"120").unwrap(),
            PsyncRequest {
                run_id: Some(id),
                offset: Some(120)
            }
        );
        assert!(matches!(
            PsyncRequest::parse(b"?", b"twelve"),
            Err(ReplicationError::InvalidOffset(_))
        ));
        assert!(PsyncRequest::parse(b"?", b"-5").is_err());
    }

    #[test]
    fn test_handshake_framing_is_exact() {
        let id = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(
            &encode_fullresync_header(id, 42, 7)[..],
            format!("+FULLRESYNC {} 42\r\n$7\r\n", id).as_bytes()
        );
        assert_eq!(&encode_continue(id)[..], format!("+CONTINUE {}\r\n", id).as_bytes());
        assert_eq!(&encode_bulk_header(0)[..], b"$0\r\n");
    }

    #[test]
    fn test_handshake_reply_parse() {
        let id = "f".repeat(40);
        assert_eq!(
            HandshakeReply::parse(&format!("FULLRESYNC  {}   99", id)).unwrap(),
            HandshakeReply::FullResync {
                run_id: id.clone(),
                offset: 99
            }
        );
        assert_eq!(
            HandshakeReply::parse(&format!("CONTINUE {}", id)).unwrap(),
            HandshakeReply::Continue { run_id: Some(id) }
        );
        assert_eq!(
            HandshakeReply::parse("CONTINUE").unwrap(),
            HandshakeReply::Continue { run_id: None }
        );
        assert!(HandshakeReply::parse("FULLRESYNC short 1").is_err());
        assert!(HandshakeReply::parse("FULLRESYNC").is_err());
        assert!(HandshakeReply::parse("OK").is_err());
    }

    #[test]
    fn test_ack_round_trip() {
        let ack = encode_ack(1234);
        let (frame, _) = Frame::parse(&ack).unwrap().unwrap();
        assert_eq!(parse_ack(&frame.into_args().unwrap()), Some(1234));

        let (probe, _) = Frame::parse(&encode_getack()).unwrap().unwrap();
        assert!(is_getack(&probe.into_args().unwrap()));
    }
}
