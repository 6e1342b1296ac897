//! Replica-side link to a primary
//!
//! Each connection attempt walks a strict sequence of states, consuming
//! exactly one framed reply per transition:
//!
//! ```text
//! Ping -> ReplconfPort -> Psync --FULLRESYNC--> AwaitSnapshot -> Streaming
//!                           |  \--CONTINUE------------------------^
//!                           \--unknown command--> Sync -> AwaitSnapshot
//! ```
//!
//! Any unexpected byte, truncated header or timeout aborts the attempt and the
//! link reconnects after an exponential backoff.

use super::coordinator::CoordinatorHandle;
use super::message::{encode_ack, is_getack, HandshakeReply};
use super::{BackoffConfig, ExponentialBackoff, ReplicationError, ReplicationResult};
use crate::resp::{encode_command, find_crlf, Frame, MAX_INLINE_LEN};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Parameters of one replica link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Link generation; the coordinator ignores messages from older links
    pub link: u64,
    pub host: String,
    pub port: u16,
    /// Announced to the primary with `REPLCONF listening-port`
    pub listening_port: u16,
    pub backoff: BackoffConfig,
    pub ack_interval: Duration,
    /// Bound on each handshake read and on stream silence
    pub io_timeout: Duration,
}

/// Where a connection attempt stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Ping,
    ReplconfPort,
    Psync {
        run_id: Option<String>,
        offset: Option<u64>,
    },
    /// Fallback for primaries without `PSYNC`
    Sync,
    AwaitSnapshot {
        run_id: Option<String>,
        offset: u64,
    },
    Streaming,
}

/// Buffered reader yielding one framed message at a time
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, timeout: Duration) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(16 * 1024),
            timeout,
        }
    }

    /// Read more bytes, failing on EOF. Cancel safe.
    pub async fn fill(&mut self) -> ReplicationResult<()> {
        let read = self.reader.read_buf(&mut self.buf).await?;
        if read == 0 {
            return Err(ReplicationError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "primary closed the connection",
            )));
        }
        Ok(())
    }

    async fn fill_timed(&mut self, what: &'static str) -> ReplicationResult<()> {
        let limit = self.timeout;
        timeout(limit, self.fill())
            .await
            .map_err(|_| ReplicationError::Timeout(what))?
    }

    /// Read a `+status` or `-error` line: `Ok(Ok(status))` or `Ok(Err(error))`
    pub async fn read_status(&mut self) -> ReplicationResult<Result<String, String>> {
        loop {
            if let Some(first) = self.buf.first() {
                if *first != b'+' && *first != b'-' {
                    return Err(unexpected("a status reply", &self.buf));
                }
                if let Some((frame, consumed)) = Frame::parse(&self.buf).map_err(protocol)? {
                    self.buf.advance(consumed);
                    return match frame {
                        Frame::Simple(line) => Ok(Ok(line)),
                        Frame::Error(line) => Ok(Err(line)),
                        other => Err(ReplicationError::ProtocolError(format!(
                            "expected a status reply, got {:?}",
                            other
                        ))),
                    };
                }
                if self.buf.len() > MAX_INLINE_LEN {
                    return Err(ReplicationError::ProtocolError("status line too long".to_string()));
                }
            }
            self.fill_timed("a status reply").await?;
        }
    }

    /// Read `$<len>\r\n`, the header in front of a snapshot payload
    pub async fn read_bulk_header(&mut self) -> ReplicationResult<usize> {
        loop {
            if let Some(first) = self.buf.first() {
                if *first != b'$' {
                    return Err(unexpected("a snapshot length header", &self.buf));
                }
                if let Some(end) = find_crlf(&self.buf, 1) {
                    let len = std::str::from_utf8(&self.buf[1..end])
                        .ok()
                        .and_then(|s| s.parse::<usize>().ok())
                        .ok_or_else(|| {
                            ReplicationError::ProtocolError(format!(
                                "malformed snapshot length '{}'",
                                String::from_utf8_lossy(&self.buf[1..end])
                            ))
                        })?;
                    self.buf.advance(end + 2);
                    return Ok(len);
                }
                if self.buf.len() > MAX_INLINE_LEN {
                    return Err(ReplicationError::ProtocolError(
                        "snapshot length header too long".to_string(),
                    ));
                }
            }
            self.fill_timed("the snapshot header").await?;
        }
    }

    /// Read exactly `len` raw bytes
    pub async fn read_payload(&mut self, len: usize) -> ReplicationResult<Bytes> {
        self.buf.reserve(len.saturating_sub(self.buf.len()).min(64 * 1024 * 1024));
        while self.buf.len() < len {
            self.fill_timed("the snapshot payload").await?;
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Take one buffered command and its wire length, if complete
    pub fn try_frame(&mut self) -> ReplicationResult<Option<(Vec<Bytes>, u64)>> {
        let Some(first) = self.buf.first() else {
            return Ok(None);
        };
        if *first != b'*' {
            return Err(unexpected("a command", &self.buf));
        }
        let Some((frame, consumed)) = Frame::parse(&self.buf).map_err(protocol)? else {
            return Ok(None);
        };
        self.buf.advance(consumed);
        let args = frame.into_args().map_err(protocol)?;
        Ok(Some((args, consumed as u64)))
    }

    /// Wait for one complete command
    pub async fn read_frame(&mut self) -> ReplicationResult<(Vec<Bytes>, u64)> {
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(frame);
            }
            self.fill_timed("a command").await?;
        }
    }
}

fn protocol(e: impl std::fmt::Display) -> ReplicationError {
    ReplicationError::ProtocolError(e.to_string())
}

fn unexpected(expected: &str, buf: &[u8]) -> ReplicationError {
    let shown = &buf[..buf.len().min(32)];
    ReplicationError::ProtocolError(format!(
        "expected {}, got {:?}",
        expected,
        String::from_utf8_lossy(shown)
    ))
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8], limit: Duration) -> ReplicationResult<()> {
    timeout(limit, writer.write_all(data))
        .await
        .map_err(|_| ReplicationError::Timeout("primary socket write"))??;
    Ok(())
}

/// Keep a replica attached to its primary until the link is superseded
pub async fn run_replica_link(config: LinkConfig, handle: CoordinatorHandle) {
    let mut backoff = ExponentialBackoff::new(config.backoff.clone());
    info!(
        "Replica link {} to {}:{} starting",
        config.link, config.host, config.port
    );

    loop {
        let result = connect_once(&config, &handle, &mut backoff).await;
        handle.link_down(config.link).await;
        match result {
            Err(ReplicationError::Superseded) | Err(ReplicationError::CoordinatorGone) => {
                debug!("Replica link {} finished", config.link);
                return;
            }
            Err(e) => warn!(
                "Link to primary {}:{} failed: {}",
                config.host, config.port, e
            ),
            Ok(()) => info!("Primary {}:{} closed the link", config.host, config.port),
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn connect_once(
    config: &LinkConfig,
    handle: &CoordinatorHandle,
    backoff: &mut ExponentialBackoff,
) -> ReplicationResult<()> {
    let address = format!("{}:{}", config.host, config.port);
    let stream = timeout(config.io_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| ReplicationError::Timeout("connect"))??;
    stream.set_nodelay(true)?;
    debug!("Connected to primary {}", address);

    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader, config.io_timeout);
    let limit = config.io_timeout;
    let mut state = HandshakeState::Ping;

    loop {
        debug!("Handshake state {:?}", state);
        state = match state {
            HandshakeState::Ping => {
                send(&mut writer, &encode_command(&["PING"]), limit).await?;
                match frames.read_status().await? {
                    Ok(_) => HandshakeState::ReplconfPort,
                    Err(e) => return Err(ReplicationError::Rejected(e)),
                }
            }
            HandshakeState::ReplconfPort => {
                let port = config.listening_port.to_string();
                send(
                    &mut writer,
                    &encode_command(&["REPLCONF", "listening-port", port.as_str()]),
                    limit,
                )
                .await?;
                if let Err(e) = frames.read_status().await? {
                    warn!("Primary refused REPLCONF listening-port: {}", e);
                }
                let (run_id, offset) = handle
                    .link_params(config.link)
                    .await
                    .ok_or(ReplicationError::Superseded)?;
                let offset = run_id.as_ref().map(|_| offset);
                HandshakeState::Psync { run_id, offset }
            }
            HandshakeState::Psync { run_id, offset } => {
                let id_arg = run_id.clone().unwrap_or_else(|| "?".to_string());
                let offset_arg = offset.map_or_else(|| "-1".to_string(), |o| o.to_string());
                send(
                    &mut writer,
                    &encode_command(&["PSYNC", id_arg.as_str(), offset_arg.as_str()]),
                    limit,
                )
                .await?;

                match frames.read_status().await? {
                    Ok(line) => match HandshakeReply::parse(&line)? {
                        HandshakeReply::FullResync { run_id, offset } => {
                            info!("Full resync from primary {} at offset {}", run_id, offset);
                            HandshakeState::AwaitSnapshot {
                                run_id: Some(run_id),
                                offset,
                            }
                        }
                        HandshakeReply::Continue { run_id: new_id } => {
                            info!("Partial resync accepted at offset {}", offset.unwrap_or(0));
                            handle.link_up(config.link, new_id.or(run_id)).await;
                            HandshakeState::Streaming
                        }
                    },
                    Err(e) if e.to_ascii_lowercase().contains("unknown command") => {
                        info!("Primary does not support PSYNC, falling back to SYNC");
                        HandshakeState::Sync
                    }
                    Err(e) => return Err(ReplicationError::Rejected(e)),
                }
            }
            HandshakeState::Sync => {
                send(&mut writer, &encode_command(&["SYNC"]), limit).await?;
                HandshakeState::AwaitSnapshot {
                    run_id: None,
                    offset: 0,
                }
            }
            HandshakeState::AwaitSnapshot { run_id, offset } => {
                let len = frames.read_bulk_header().await?;
                let payload = frames.read_payload(len).await?;
                debug!("Received {} byte snapshot", len);
                handle
                    .load_snapshot(config.link, run_id.clone(), offset, payload)
                    .await?
                    .map_err(|e| ReplicationError::ProtocolError(format!("snapshot rejected: {}", e)))?;
                handle.link_up(config.link, run_id).await;
                HandshakeState::Streaming
            }
            HandshakeState::Streaming => {
                backoff.reset();
                return stream_commands(config, handle, &mut frames, &mut writer).await;
            }
        };
    }
}

/// Apply the live stream and acknowledge the applied offset
async fn stream_commands<R, W>(
    config: &LinkConfig,
    handle: &CoordinatorHandle,
    frames: &mut FrameReader<R>,
    writer: &mut W,
) -> ReplicationResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ack = tokio::time::interval(config.ack_interval);
    ack.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + config.io_timeout;

    loop {
        while let Some((args, wire_len)) = frames.try_frame()? {
            if is_getack(&args) {
                send(writer, &encode_ack(handle.offset()), config.io_timeout).await?;
                continue;
            }
            handle.stream(config.link, args, wire_len).await;
        }

        tokio::select! {
            filled = frames.fill() => {
                filled?;
                deadline = Instant::now() + config.io_timeout;
            }
            _ = ack.tick() => {
                send(writer, &encode_ack(handle.offset()), config.io_timeout).await?;
            }
            _ = sleep_until(deadline) => {
                return Err(ReplicationError::Timeout("the primary stream"));
            }
        }
    }
}
