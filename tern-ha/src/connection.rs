//! Master-side endpoint: one task per accepted slave connection.
//!
//! The slave drives the conversation: its handshake request gets the full
//! epoch list back, and its first offset report fixes where streaming
//! starts. After that the task pumps commit-log frames (never crossing an
//! epoch boundary), falls back to empty heartbeats when the log is idle,
//! and folds every report into the service's ack table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tern_core::{Epoch, HaConnectionState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec::{
    decode_slave_request, encode_data_frame, encode_epoch_entries, CodecError, SlaveRequest,
};
use crate::error::{HaError, HaResult};
use crate::service::HaShared;

/// Read buffer capacity per connection.
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// How often the write side looks for work.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on frames pushed per pump tick, so reads are never starved.
const MAX_FRAMES_PER_TICK: usize = 16;

/// Sentinel: streaming start not yet fixed by a slave report.
const OFFSET_UNSET: i64 = -1;

struct ConnState {
    id: u64,
    slave_address: Option<String>,
    /// Next offset to stream, [`OFFSET_UNSET`] until the slave reports.
    next_offset: i64,
    last_read_ms: i64,
    last_write_ms: i64,
}

/// Runs one slave connection to completion.
pub(crate) async fn run_connection(
    shared: Arc<HaShared>,
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut shutdown = shared.shutdown.subscribe();
    let mut tick = tokio::time::interval(PUMP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let now = shared.store.now_ms();
    let mut conn = ConnState {
        id,
        slave_address: None,
        next_offset: OFFSET_UNSET,
        last_read_ms: now,
        last_write_ms: now,
    };

    loop {
        // A role switch orphans this connection.
        if !shared.connection_registered(id) {
            debug!(%peer, id, "Connection orphaned by role change");
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    debug!(%peer, id, "Slave closed connection");
                    break;
                }
                Ok(_) => {
                    conn.last_read_ms = shared.store.now_ms();
                    if let Err(e) =
                        drain_requests(&shared, &mut conn, &mut buffer, &mut writer).await
                    {
                        warn!(%peer, id, error = %e, "Closing slave connection");
                        break;
                    }
                }
                Err(e) => {
                    warn!(%peer, id, error = %e, "Read failed");
                    break;
                }
            },
            _ = tick.tick() => {
                let now = shared.store.now_ms();
                let housekeeping =
                    i64::try_from(shared.config.housekeeping_interval.as_millis())
                        .unwrap_or(i64::MAX);
                if now - conn.last_read_ms > housekeeping {
                    warn!(%peer, id, "Housekeeping: slave silent too long");
                    break;
                }
                if let Err(e) = transfer_step(&shared, &mut conn, &mut writer).await {
                    warn!(%peer, id, error = %e, "Transfer failed");
                    break;
                }
            }
        }
    }

    shared.remove_connection(id);
    if let Some(address) = &conn.slave_address {
        info!(%peer, id, slave = %address, "Slave connection closed");
    }
}

/// Decodes and handles every complete request in the buffer.
async fn drain_requests(
    shared: &HaShared,
    conn: &mut ConnState,
    buffer: &mut BytesMut,
    writer: &mut OwnedWriteHalf,
) -> HaResult<()> {
    loop {
        match decode_slave_request(buffer) {
            Ok((request, consumed)) => {
                let _ = buffer.split_to(consumed);
                handle_request(shared, conn, writer, request).await?;
            }
            Err(CodecError::InsufficientData { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handle_request(
    shared: &HaShared,
    conn: &mut ConnState,
    writer: &mut OwnedWriteHalf,
    request: SlaveRequest,
) -> HaResult<()> {
    match request {
        SlaveRequest::Handshake { slave_address } => {
            info!(slave = %slave_address, "Slave handshake");
            conn.slave_address = Some(slave_address.clone());
            conn.next_offset = OFFSET_UNSET;
            shared.set_connection_address(conn.id, &slave_address);
            send_handshake_frame(shared, conn, writer).await
        }
        SlaveRequest::OffsetReport(header) => {
            if header.state != HaConnectionState::Transfer {
                debug!(state = %header.state, "Ignoring report in non-transfer state");
                return Ok(());
            }
            let reported = header.max_offset;
            let max = shared.store.max_phy_offset();
            if reported > max {
                return Err(HaError::OffsetMismatch {
                    slave_offset: reported,
                    master_offset: max,
                });
            }

            shared.update_slave_ack(conn.id, reported);
            if conn.next_offset == OFFSET_UNSET {
                let start = resolve_transfer_start(shared, conn, writer, reported).await?;
                conn.next_offset = start;
            }
            Ok(())
        }
    }
}

/// Fixes where streaming starts for a freshly handshaken slave.
///
/// A slave below the retained range cannot be served from its own offset:
/// an empty one (report 0) starts at the oldest retained byte, or at the
/// newest file under `sync_from_last_file`; a non-empty one is pushed back
/// through the handshake (the reset signal) to reconcile again.
async fn resolve_transfer_start(
    shared: &HaShared,
    conn: &mut ConnState,
    writer: &mut OwnedWriteHalf,
    reported: i64,
) -> HaResult<i64> {
    let min = shared.store.min_phy_offset();
    if reported >= min {
        return Ok(reported);
    }
    if reported == 0 {
        let start = if shared.config.sync_from_last_file {
            shared.store.last_file_start_offset()
        } else {
            min
        };
        info!(start, "Serving fresh slave from retained range");
        return Ok(start);
    }

    warn!(reported, min, "Slave below retained range, resetting handshake");
    send_handshake_frame(shared, conn, writer).await?;
    Ok(OFFSET_UNSET)
}

/// Sends the epoch list with the current max offset and watermark.
async fn send_handshake_frame(
    shared: &HaShared,
    conn: &mut ConnState,
    writer: &mut OwnedWriteHalf,
) -> HaResult<()> {
    let max_offset = shared.store.max_phy_offset();
    shared.epoch_cache.set_last_end_offset(max_offset);
    let body = encode_epoch_entries(&shared.epoch_cache.all_entries());

    let frame = encode_data_frame(
        HaConnectionState::Handshake,
        max_offset,
        shared.current_epoch(),
        shared.master_confirm_offset(),
        &body,
    )?;
    writer.write_all(&frame).await?;
    conn.last_write_ms = shared.store.now_ms();
    Ok(())
}

/// Streams pending log ranges, or heartbeats when idle.
async fn transfer_step(
    shared: &HaShared,
    conn: &mut ConnState,
    writer: &mut OwnedWriteHalf,
) -> HaResult<()> {
    if conn.next_offset == OFFSET_UNSET {
        return Ok(());
    }

    let confirm = shared.master_confirm_offset();
    let mut sent = 0;
    while sent < MAX_FRAMES_PER_TICK {
        let max = shared.store.max_phy_offset();
        if conn.next_offset >= max {
            break;
        }
        shared.epoch_cache.set_last_end_offset(max);

        let Some(entry) = shared.epoch_cache.entry_containing(conn.next_offset) else {
            warn!(offset = conn.next_offset, "No epoch covers transfer offset");
            break;
        };
        let chunk_end = entry
            .end_offset
            .min(conn.next_offset + conn_batch(shared))
            .min(max);
        let len = usize::try_from(chunk_end - conn.next_offset).unwrap_or(0);
        let Some(body) = shared.store.read_commit_log(conn.next_offset, len) else {
            break;
        };
        if body.is_empty() {
            break;
        }

        send_transfer_frame(shared, conn, writer, entry.epoch, confirm, &body).await?;
        sent += 1;
    }

    if sent == 0 {
        // Idle: heartbeat keeps the slave's housekeeping quiet and pushes
        // the latest watermark.
        let heartbeat = i64::try_from(shared.config.send_heartbeat_interval.as_millis())
            .unwrap_or(i64::MAX);
        let now = shared.store.now_ms();
        if now - conn.last_write_ms >= heartbeat {
            let epoch = shared
                .epoch_cache
                .last_epoch()
                .unwrap_or_else(|| shared.current_epoch());
            send_transfer_frame(shared, conn, writer, epoch, confirm, &[]).await?;
        }
    }
    Ok(())
}

async fn send_transfer_frame(
    shared: &HaShared,
    conn: &mut ConnState,
    writer: &mut OwnedWriteHalf,
    epoch: Epoch,
    confirm: i64,
    body: &[u8],
) -> HaResult<()> {
    let frame = encode_data_frame(
        HaConnectionState::Transfer,
        conn.next_offset,
        epoch,
        confirm,
        body,
    )?;
    writer.write_all(&frame).await?;
    conn.next_offset += body.len() as i64;
    conn.last_write_ms = shared.store.now_ms();
    Ok(())
}

fn conn_batch(shared: &HaShared) -> i64 {
    i64::try_from(shared.config.transfer_batch_size).unwrap_or(i64::MAX)
}
