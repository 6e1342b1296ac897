//! Primary-side replica connection
//!
//! After `SYNC`/`PSYNC` a client connection stops being a command connection
//! and becomes the sender for one replica. It writes whatever the coordinator
//! queues for it and reads the replica's `REPLCONF ACK` frames.

use super::coordinator::CoordinatorHandle;
use super::message::{
    encode_bulk_header, encode_continue, encode_fullresync_header, encode_getack, parse_ack, Outbound,
    ReplicaRegistration,
};
use super::{ReplicationError, ReplicationResult};
use crate::resp::Frame;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on a single socket write to a replica
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Write side of a replica connection
pub struct ReplicaConnection {
    id: u64,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    send_timeout: Duration,
    written: Arc<AtomicU64>,
}

impl ReplicaConnection {
    async fn send(&mut self, data: &[u8]) -> ReplicationResult<()> {
        timeout(self.send_timeout, self.writer.write_all(data))
            .await
            .map_err(|_| ReplicationError::Timeout("replica socket write"))??;
        Ok(())
    }

    /// Write one queued item. Returns `true` when a snapshot payload went out.
    async fn write_item(&mut self, item: Outbound) -> ReplicationResult<bool> {
        match item {
            Outbound::FullResync {
                run_id,
                offset,
                payload,
            } => {
                self.send(&encode_fullresync_header(&run_id, offset, payload.len()))
                    .await?;
                self.send(&payload).await?;
                self.written.store(offset, Ordering::Release);
                info!(
                    "Sent {} byte snapshot to replica {} ({})",
                    payload.len(),
                    self.id,
                    self.peer_addr
                );
                Ok(true)
            }
            Outbound::LegacySync { payload } => {
                self.send(&encode_bulk_header(payload.len())).await?;
                self.send(&payload).await?;
                Ok(true)
            }
            Outbound::Continue { run_id } => {
                self.send(&encode_continue(&run_id)).await?;
                Ok(false)
            }
            Outbound::Stream { data, end_offset } => {
                self.send(&data).await?;
                self.written.store(end_offset, Ordering::Release);
                Ok(false)
            }
            Outbound::Probe => {
                self.send(&encode_getack()).await?;
                Ok(false)
            }
        }
    }
}

/// Drive one replica until either side goes away.
///
/// `leftover` holds bytes already read from the socket past the `PSYNC`
/// command.
pub async fn serve_replica(
    stream: TcpStream,
    leftover: BytesMut,
    registration: ReplicaRegistration,
    handle: CoordinatorHandle,
    send_timeout: Duration,
) {
    let ReplicaRegistration {
        id,
        mut outbound,
        written,
    } = registration;
    let peer_addr = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (mut reader, writer) = stream.into_split();
    let mut connection = ReplicaConnection {
        id,
        writer,
        peer_addr,
        send_timeout,
        written,
    };
    let mut inbound = leftover;

    let result: ReplicationResult<()> = async {
        loop {
            read_acks(&mut inbound, id, &handle).await?;
            tokio::select! {
                item = outbound.recv() => {
                    // the coordinator dropped this replica
                    let Some(item) = item else { return Ok(()) };
                    if connection.write_item(item).await? {
                        handle.replica_delivered(id).await;
                    }
                }
                read = reader.read_buf(&mut inbound) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    match result {
        Ok(()) => info!("Replica {} ({}) connection closed", id, peer_addr),
        Err(e) => warn!("Replica {} ({}) connection failed: {}", id, peer_addr, e),
    }
    handle.replica_closed(id).await;
}

/// Consume every complete frame in `inbound`, forwarding acknowledgements
async fn read_acks(inbound: &mut BytesMut, id: u64, handle: &CoordinatorHandle) -> ReplicationResult<()> {
    while let Some((frame, consumed)) =
        Frame::parse(inbound).map_err(|e| ReplicationError::ProtocolError(e.to_string()))?
    {
        inbound.advance(consumed);
        let Ok(args) = frame.into_args() else {
            continue;
        };
        match parse_ack(&args) {
            Some(offset) => handle.replica_ack(id, offset).await,
            None => debug!(
                "Replica {} sent unexpected {}",
                id,
                String::from_utf8_lossy(&args[0])
            ),
        }
    }
    Ok(())
}
