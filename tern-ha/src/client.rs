//! Slave-side endpoint: the task that pulls the log from the master.
//!
//! One long-lived task walks READY → HANDSHAKE → TRANSFER per connection
//! attempt. Before dialing it runs the store's self check, in handshake it
//! reconciles epoch histories and truncates the divergent suffix, and in
//! transfer it appends pushed ranges in strict offset order while
//! reporting its max offset back. Any failure closes the socket and falls
//! back to READY after a short wait.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tern_core::{Epoch, HaConnectionState};
use tern_epoch::EpochCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec::{
    decode_data_frame, decode_epoch_entries, encode_handshake_request, encode_offset_report,
    CodecError, DataFrame,
};
use crate::error::{HaError, HaResult};
use crate::service::HaShared;

/// Read buffer capacity.
const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Dial timeout for the master's listener.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the transfer loop checks timers.
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Commands from the service to the client task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientCommand {
    /// Point the client at a new master (or none, while acting as master).
    UpdateMaster(Option<String>),
    /// Drop the current connection and start over from READY.
    Reopen,
}

enum SessionEnd {
    Shutdown,
    Command(ClientCommand),
}

/// Runs the replication client until shutdown.
pub(crate) async fn run_client(
    shared: Arc<HaShared>,
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut master_addr: Option<String> = None;
    info!(local = %shared.local_address, "Replication client started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Ok(command) = rx.try_recv() {
            apply_command(&mut master_addr, command);
        }

        // READY with no master: idle until the service points us somewhere.
        let Some(addr) = master_addr.clone() else {
            tokio::select! {
                _ = shutdown.changed() => {}
                command = rx.recv() => match command {
                    Some(command) => apply_command(&mut master_addr, command),
                    None => break,
                }
            }
            continue;
        };

        // READY: drop any torn tail write before reconciling with a master.
        if let Some(tail) = shared.store.truncate_dirty_tail() {
            warn!(tail, "Dropped torn tail before reconnecting");
            if let Err(e) = shared.epoch_cache.truncate_suffix_from_offset(tail) {
                error!(error = %e, "Failed to mirror tail truncation into epoch cache");
                wait_before_retry(&shared, &mut rx, &mut shutdown, &mut master_addr).await;
                continue;
            }
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => {
                info!(master = %addr, "Connected to master");
                match session(&shared, &mut rx, &mut shutdown, stream).await {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::Command(command)) => {
                        apply_command(&mut master_addr, command);
                    }
                    Err(e @ HaError::StoreRejected {
                        operation: "truncate",
                        ..
                    }) => {
                        // The store refused to truncate: retrying cannot
                        // help. Park until an operator (or a role change)
                        // resumes the endpoint.
                        error!(master = %addr, error = %e, "Truncation failed, suspending");
                        suspend(&mut rx, &mut shutdown, &mut master_addr).await;
                    }
                    Err(e) => {
                        warn!(master = %addr, error = %e, "Replication session ended");
                        wait_before_retry(&shared, &mut rx, &mut shutdown, &mut master_addr)
                            .await;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(master = %addr, error = %e, "Failed to connect to master");
                wait_before_retry(&shared, &mut rx, &mut shutdown, &mut master_addr).await;
            }
            Err(_) => {
                warn!(master = %addr, "Connect to master timed out");
                wait_before_retry(&shared, &mut rx, &mut shutdown, &mut master_addr).await;
            }
        }
    }

    info!(local = %shared.local_address, "Replication client stopped");
}

fn apply_command(master_addr: &mut Option<String>, command: ClientCommand) {
    match command {
        ClientCommand::UpdateMaster(addr) => {
            info!(master = ?addr, "Master replication address updated");
            *master_addr = addr;
        }
        ClientCommand::Reopen => {
            // The session has already ended by the time this is handled;
            // the next loop iteration reconnects.
        }
    }
}

/// Parks the endpoint until a command or shutdown arrives.
async fn suspend(
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: &mut watch::Receiver<bool>,
    master_addr: &mut Option<String>,
) {
    tokio::select! {
        _ = shutdown.changed() => {}
        command = rx.recv() => {
            if let Some(command) = command {
                apply_command(master_addr, command);
            }
        }
    }
}

/// Sleeps out the retry delay, still reacting to commands and shutdown.
async fn wait_before_retry(
    shared: &HaShared,
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: &mut watch::Receiver<bool>,
    master_addr: &mut Option<String>,
) {
    tokio::select! {
        () = tokio::time::sleep(shared.config.connect_retry_delay) => {}
        _ = shutdown.changed() => {}
        command = rx.recv() => {
            if let Some(command) = command {
                apply_command(master_addr, command);
            }
        }
    }
}

/// One connection's handshake and transfer, ending on error, command or
/// shutdown.
async fn session(
    shared: &Arc<HaShared>,
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: &mut watch::Receiver<bool>,
    stream: TcpStream,
) -> HaResult<SessionEnd> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    shared.confirm_from_master.store(-1, Ordering::Release);

    // HANDSHAKE: ask for the master's epoch history.
    let request = encode_handshake_request(&shared.local_address)?;
    writer.write_all(&request).await?;

    let deadline = tokio::time::Instant::now() + shared.config.handshake_timeout;
    let mut reported;
    loop {
        match decode_data_frame(&buffer) {
            Ok((frame, consumed)) => {
                let _ = buffer.split_to(consumed);
                if frame.header.state == HaConnectionState::Handshake {
                    reported = do_truncate(shared, &mut writer, &frame).await?;
                    break;
                }
                debug!(state = %frame.header.state, "Skipping pre-handshake frame");
            }
            Err(CodecError::InsufficientData { .. }) => {
                match tokio::time::timeout_at(deadline, reader.read_buf(&mut buffer)).await {
                    Ok(Ok(0)) => return Err(HaError::ConnectionClosed),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(HaError::HandshakeTimeout),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    // TRANSFER: append pushed ranges, report progress, keep the timers.
    let mut received_epoch: Option<Epoch> = None;
    let mut last_read_ms = shared.store.now_ms();
    let mut last_write_ms = last_read_ms;
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let heartbeat = i64::try_from(shared.config.send_heartbeat_interval.as_millis())
        .unwrap_or(i64::MAX);
    let housekeeping = i64::try_from(shared.config.housekeeping_interval.as_millis())
        .unwrap_or(i64::MAX);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(SessionEnd::Shutdown),
            command = rx.recv() => {
                return match command {
                    Some(command) => Ok(SessionEnd::Command(command)),
                    None => Ok(SessionEnd::Shutdown),
                };
            }
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => return Err(HaError::ConnectionClosed),
                Ok(_) => {
                    last_read_ms = shared.store.now_ms();
                    process_frames(
                        shared,
                        &mut writer,
                        &mut buffer,
                        &mut reported,
                        &mut received_epoch,
                        &mut last_write_ms,
                    )
                    .await?;
                }
                Err(e) => return Err(e.into()),
            },
            _ = tick.tick() => {
                let now = shared.store.now_ms();
                let idle_ms = now - last_read_ms;
                if idle_ms > housekeeping {
                    return Err(HaError::Expired { idle_ms });
                }
                if now - last_write_ms >= heartbeat {
                    // Periodic report doubles as the slave's heartbeat.
                    writer
                        .write_all(&encode_offset_report(
                            HaConnectionState::Transfer,
                            reported,
                        ))
                        .await?;
                    last_write_ms = now;
                }
            }
        }
    }
}

/// Reconciles the local log against the master's epoch history.
///
/// Truncates everything beyond the consistent point (the whole log when no
/// common history exists), then enters transfer by reporting the point.
async fn do_truncate(
    shared: &HaShared,
    writer: &mut OwnedWriteHalf,
    frame: &DataFrame,
) -> HaResult<i64> {
    let master_entries = decode_epoch_entries(&frame.body)?;
    let remote = EpochCache::from_entries(master_entries, frame.header.master_offset);

    let local_max = shared.store.max_phy_offset();
    let local = EpochCache::from_entries(
        shared
            .epoch_cache
            .all_entries()
            .iter()
            .map(|entry| (entry.epoch, entry.start_offset))
            .collect(),
        local_max,
    );

    let point = local.find_consistent_point(&remote);
    let truncate_offset = point.unwrap_or(0);
    if point.is_none() {
        warn!(local_max, "No consistent point with master, discarding log");
    }

    if truncate_offset < local_max && !shared.store.truncate_files(truncate_offset) {
        return Err(HaError::StoreRejected {
            operation: "truncate",
            offset: truncate_offset,
        });
    }
    shared
        .epoch_cache
        .truncate_suffix_from_offset(truncate_offset)?;

    info!(
        truncate_offset,
        master_max = frame.header.master_offset,
        "Log reconciled, entering transfer"
    );

    writer
        .write_all(&encode_offset_report(
            HaConnectionState::Transfer,
            truncate_offset,
        ))
        .await?;
    Ok(truncate_offset)
}

/// Decodes and handles every complete frame in the buffer.
async fn process_frames(
    shared: &HaShared,
    writer: &mut OwnedWriteHalf,
    buffer: &mut BytesMut,
    reported: &mut i64,
    received_epoch: &mut Option<Epoch>,
    last_write_ms: &mut i64,
) -> HaResult<()> {
    loop {
        match decode_data_frame(buffer) {
            Ok((frame, consumed)) => {
                let _ = buffer.split_to(consumed);
                handle_frame(shared, writer, &frame, reported, received_epoch, last_write_ms)
                    .await?;
            }
            Err(CodecError::InsufficientData { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handle_frame(
    shared: &HaShared,
    writer: &mut OwnedWriteHalf,
    frame: &DataFrame,
    reported: &mut i64,
    received_epoch: &mut Option<Epoch>,
    last_write_ms: &mut i64,
) -> HaResult<()> {
    match frame.header.state {
        HaConnectionState::Handshake => {
            // The master's reset: reconcile again against its fresh list.
            info!("Master restarted handshake");
            *reported = do_truncate(shared, writer, frame).await?;
            *received_epoch = None;
            *last_write_ms = shared.store.now_ms();
            Ok(())
        }
        HaConnectionState::Transfer => {
            let slave_max = shared.store.max_phy_offset();
            if slave_max != 0 && frame.header.master_offset != slave_max {
                return Err(HaError::OffsetMismatch {
                    slave_offset: slave_max,
                    master_offset: frame.header.master_offset,
                });
            }

            if *received_epoch != Some(frame.header.epoch) {
                // New term begins exactly where this frame starts.
                shared
                    .epoch_cache
                    .append_entry(frame.header.epoch, frame.header.master_offset)?;
                *received_epoch = Some(frame.header.epoch);
            }

            let confirm = frame
                .header
                .confirm_offset
                .min(shared.store.max_phy_offset());
            shared.confirm_from_master.store(confirm, Ordering::Release);

            if !frame.body.is_empty() {
                if !shared
                    .store
                    .append_to_commit_log(frame.header.master_offset, &frame.body)
                {
                    return Err(HaError::StoreRejected {
                        operation: "append",
                        offset: frame.header.master_offset,
                    });
                }
                debug!(
                    offset = frame.header.master_offset,
                    len = frame.body.len(),
                    epoch = %frame.header.epoch,
                    "Appended replicated bytes"
                );
            }

            let max = shared.store.max_phy_offset();
            shared.epoch_cache.set_last_end_offset(max);
            if max > *reported {
                *reported = max;
                writer
                    .write_all(&encode_offset_report(HaConnectionState::Transfer, max))
                    .await?;
                *last_write_ms = shared.store.now_ms();
            }
            Ok(())
        }
        other => {
            warn!(state = %other, "Skipping frame in unexpected state");
            Ok(())
        }
    }
}
