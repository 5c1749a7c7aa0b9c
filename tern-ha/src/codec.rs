//! Wire format of the replication channel.
//!
//! Two frame shapes, all integers big-endian:
//!
//! - **Transfer header** (slave to master, 12 bytes):
//!   `[state: u32][max_offset: i64]`. Used for offset reports. A handshake
//!   request is the same header (`state = HANDSHAKE`, offset 0) followed by
//!   the slave's broker address: `[len: u32][utf8 bytes]` — the master keys
//!   its in-sync tracking by that address.
//! - **Data header** (master to slave, 28 bytes):
//!   `[state: u32][body_size: u32][master_offset: i64][epoch: u32]`
//!   `[confirm_offset: i64]`, followed by `body_size` bytes. A handshake
//!   reply carries the master's epoch list as the body (12 bytes per
//!   entry); a transfer frame carries raw commit-log bytes; a heartbeat is
//!   an empty body.
//!
//! Decoders work on a partially-filled read buffer and return the consumed
//! length, signalling [`CodecError::InsufficientData`] until a whole frame
//! is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tern_core::{Epoch, HaConnectionState, Limits};
use tern_epoch::{EpochEntry, EPOCH_ENTRY_SIZE};
use thiserror::Error;

/// Size of the slave-side transfer header.
pub const TRANSFER_HEADER_SIZE: usize = 4 + 8;

/// Size of the master-side data header.
pub const DATA_HEADER_SIZE: usize = 4 + 4 + 8 + 4 + 8;

const LIMITS: Limits = Limits::new();

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Insufficient data to decode a frame.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Frame body exceeds the maximum allowed size.
    #[error("frame body too large: {size} bytes (max {max})")]
    BodyTooLarge {
        /// Actual size.
        size: u64,
        /// Maximum allowed.
        max: u64,
    },

    /// Unknown connection-state ordinal.
    #[error("unknown connection state: {value}")]
    UnknownState {
        /// The unknown ordinal.
        value: u32,
    },

    /// Broker address exceeds the maximum allowed length.
    #[error("address too long: {len} bytes (max {max})")]
    AddressTooLong {
        /// Actual length.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Broker address is not valid UTF-8.
    #[error("address is not valid UTF-8")]
    InvalidAddress(#[from] std::str::Utf8Error),

    /// Epoch payload length is not a whole number of entries.
    #[error("epoch payload of {len} bytes is not a multiple of {entry_size}")]
    InvalidEpochPayload {
        /// Payload length.
        len: usize,
        /// Entry record size.
        entry_size: usize,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// The fixed 12-byte header the slave sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// The sender's connection state.
    pub state: HaConnectionState,
    /// The sender's max physical offset (0 in handshake requests).
    pub max_offset: i64,
}

/// A decoded slave-side frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveRequest {
    /// A handshake request carrying the slave's broker address.
    Handshake {
        /// The slave's broker (client-facing) address.
        slave_address: String,
    },
    /// An offset report.
    OffsetReport(TransferHeader),
}

/// The fixed 28-byte header the master sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// The master's connection state for this slave.
    pub state: HaConnectionState,
    /// Length of the body that follows.
    pub body_size: u32,
    /// Offset of the first body byte in the master's log.
    pub master_offset: i64,
    /// Epoch containing `master_offset`.
    pub epoch: Epoch,
    /// The master's commit watermark.
    pub confirm_offset: i64,
}

/// A decoded master-side frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Frame header.
    pub header: DataHeader,
    /// Frame body (may be empty for heartbeats).
    pub body: Bytes,
}

/// Encodes an offset report.
#[must_use]
pub fn encode_offset_report(state: HaConnectionState, max_offset: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(TRANSFER_HEADER_SIZE);
    buf.put_u32(state.as_wire());
    buf.put_i64(max_offset);
    buf.freeze()
}

/// Encodes a handshake request carrying the slave's broker address.
///
/// # Errors
/// Returns an error if the address is longer than the wire limit.
pub fn encode_handshake_request(slave_address: &str) -> CodecResult<Bytes> {
    let addr = slave_address.as_bytes();
    if addr.len() > LIMITS.max_address_bytes as usize {
        return Err(CodecError::AddressTooLong {
            len: addr.len(),
            max: LIMITS.max_address_bytes as usize,
        });
    }

    let mut buf = BytesMut::with_capacity(TRANSFER_HEADER_SIZE + 4 + addr.len());
    buf.put_u32(HaConnectionState::Handshake.as_wire());
    buf.put_i64(0);
    // Safe cast: bounded by max_address_bytes which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(addr.len() as u32);
    buf.put_slice(addr);
    Ok(buf.freeze())
}

/// Decodes one slave-side frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed.
///
/// # Errors
/// Returns [`CodecError::InsufficientData`] until a whole frame is
/// buffered, or a fatal error for malformed frames.
pub fn decode_slave_request(data: &[u8]) -> CodecResult<(SlaveRequest, usize)> {
    if data.len() < TRANSFER_HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            need: TRANSFER_HEADER_SIZE,
            have: data.len(),
        });
    }

    let mut buf = data;
    let state_raw = buf.get_u32();
    let state = HaConnectionState::from_wire(state_raw)
        .ok_or(CodecError::UnknownState { value: state_raw })?;
    let max_offset = buf.get_i64();

    if state != HaConnectionState::Handshake {
        return Ok((
            SlaveRequest::OffsetReport(TransferHeader { state, max_offset }),
            TRANSFER_HEADER_SIZE,
        ));
    }

    // Handshake requests carry the slave's address.
    if buf.remaining() < 4 {
        return Err(CodecError::InsufficientData {
            need: TRANSFER_HEADER_SIZE + 4,
            have: data.len(),
        });
    }
    let addr_len = buf.get_u32() as usize;
    if addr_len > LIMITS.max_address_bytes as usize {
        return Err(CodecError::AddressTooLong {
            len: addr_len,
            max: LIMITS.max_address_bytes as usize,
        });
    }
    let total = TRANSFER_HEADER_SIZE + 4 + addr_len;
    if buf.remaining() < addr_len {
        return Err(CodecError::InsufficientData {
            need: total,
            have: data.len(),
        });
    }

    let slave_address = std::str::from_utf8(&buf[..addr_len])?.to_string();
    Ok((SlaveRequest::Handshake { slave_address }, total))
}

/// Encodes a master-side frame.
///
/// # Errors
/// Returns an error if the body exceeds the maximum frame size.
pub fn encode_data_frame(
    state: HaConnectionState,
    master_offset: i64,
    epoch: Epoch,
    confirm_offset: i64,
    body: &[u8],
) -> CodecResult<Bytes> {
    if body.len() > LIMITS.max_transfer_body_bytes as usize {
        return Err(CodecError::BodyTooLarge {
            size: body.len() as u64,
            max: u64::from(LIMITS.max_transfer_body_bytes),
        });
    }

    let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE + body.len());
    buf.put_u32(state.as_wire());
    // Safe cast: bounded by max_transfer_body_bytes which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(body.len() as u32);
    buf.put_i64(master_offset);
    buf.put_u32(epoch.get());
    buf.put_i64(confirm_offset);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decodes one master-side frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed.
///
/// # Errors
/// Returns [`CodecError::InsufficientData`] until a whole frame is
/// buffered, or a fatal error for malformed frames.
pub fn decode_data_frame(data: &[u8]) -> CodecResult<(DataFrame, usize)> {
    if data.len() < DATA_HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            need: DATA_HEADER_SIZE,
            have: data.len(),
        });
    }

    let mut buf = data;
    let state_raw = buf.get_u32();
    let state = HaConnectionState::from_wire(state_raw)
        .ok_or(CodecError::UnknownState { value: state_raw })?;
    let body_size = buf.get_u32();
    if body_size > LIMITS.max_transfer_body_bytes {
        return Err(CodecError::BodyTooLarge {
            size: u64::from(body_size),
            max: u64::from(LIMITS.max_transfer_body_bytes),
        });
    }
    let master_offset = buf.get_i64();
    let epoch = Epoch::new(buf.get_u32());
    let confirm_offset = buf.get_i64();

    let total = DATA_HEADER_SIZE + body_size as usize;
    if buf.remaining() < body_size as usize {
        return Err(CodecError::InsufficientData {
            need: total,
            have: data.len(),
        });
    }

    let body = Bytes::copy_from_slice(&buf[..body_size as usize]);
    Ok((
        DataFrame {
            header: DataHeader {
                state,
                body_size,
                master_offset,
                epoch,
                confirm_offset,
            },
            body,
        },
        total,
    ))
}

/// Encodes an epoch list as a handshake body.
#[must_use]
pub fn encode_epoch_entries(entries: &[EpochEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * EPOCH_ENTRY_SIZE);
    for entry in entries {
        buf.put_u32(entry.epoch.get());
        buf.put_i64(entry.start_offset);
    }
    buf.freeze()
}

/// Decodes an epoch list from a handshake body.
///
/// # Errors
/// Returns an error if the payload is not a whole number of entries.
pub fn decode_epoch_entries(body: &[u8]) -> CodecResult<Vec<(Epoch, i64)>> {
    if body.len() % EPOCH_ENTRY_SIZE != 0 {
        return Err(CodecError::InvalidEpochPayload {
            len: body.len(),
            entry_size: EPOCH_ENTRY_SIZE,
        });
    }

    let mut buf = body;
    let mut entries = Vec::with_capacity(body.len() / EPOCH_ENTRY_SIZE);
    while buf.has_remaining() {
        let epoch = Epoch::new(buf.get_u32());
        let start_offset = buf.get_i64();
        entries.push((epoch, start_offset));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_report_round_trip() {
        let encoded = encode_offset_report(HaConnectionState::Transfer, 1570);
        assert_eq!(encoded.len(), TRANSFER_HEADER_SIZE);

        let (request, consumed) = decode_slave_request(&encoded).unwrap();
        assert_eq!(consumed, TRANSFER_HEADER_SIZE);
        assert_eq!(
            request,
            SlaveRequest::OffsetReport(TransferHeader {
                state: HaConnectionState::Transfer,
                max_offset: 1570,
            })
        );
    }

    #[test]
    fn test_handshake_request_round_trip() {
        let encoded = encode_handshake_request("127.0.0.1:9001").unwrap();
        let (request, consumed) = decode_slave_request(&encoded).unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(
            request,
            SlaveRequest::Handshake {
                slave_address: "127.0.0.1:9001".to_string(),
            }
        );
    }

    #[test]
    fn test_slave_request_insufficient_data() {
        let encoded = encode_handshake_request("127.0.0.1:9001").unwrap();
        for cut in [0, TRANSFER_HEADER_SIZE - 1, TRANSFER_HEADER_SIZE + 2, encoded.len() - 1] {
            assert!(matches!(
                decode_slave_request(&encoded[..cut]),
                Err(CodecError::InsufficientData { .. })
            ));
        }
    }

    #[test]
    fn test_data_frame_round_trip() {
        let body = b"0123456789";
        let encoded = encode_data_frame(
            HaConnectionState::Transfer,
            1570,
            Epoch::new(2),
            800,
            body,
        )
        .unwrap();
        assert_eq!(encoded.len(), DATA_HEADER_SIZE + body.len());

        let (frame, consumed) = decode_data_frame(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.header.state, HaConnectionState::Transfer);
        assert_eq!(frame.header.body_size, 10);
        assert_eq!(frame.header.master_offset, 1570);
        assert_eq!(frame.header.epoch, Epoch::new(2));
        assert_eq!(frame.header.confirm_offset, 800);
        assert_eq!(&frame.body[..], body);
    }

    #[test]
    fn test_data_frame_heartbeat_has_empty_body() {
        let encoded =
            encode_data_frame(HaConnectionState::Transfer, 3140, Epoch::new(2), 3140, &[])
                .unwrap();
        let (frame, _) = decode_data_frame(&encoded).unwrap();
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_data_frame_needs_whole_body() {
        let encoded =
            encode_data_frame(HaConnectionState::Transfer, 0, Epoch::new(1), 0, b"abcdef")
                .unwrap();
        assert!(matches!(
            decode_data_frame(&encoded[..encoded.len() - 1]),
            Err(CodecError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let mut bad = BytesMut::new();
        bad.put_u32(9);
        bad.put_i64(0);
        assert!(matches!(
            decode_slave_request(&bad),
            Err(CodecError::UnknownState { value: 9 })
        ));
    }

    #[test]
    fn test_epoch_entries_round_trip() {
        let entries = vec![
            EpochEntry::new(Epoch::new(1), 0, 1570),
            EpochEntry::new(Epoch::new(2), 1570, 3140),
        ];
        let body = encode_epoch_entries(&entries);
        assert_eq!(body.len(), 2 * EPOCH_ENTRY_SIZE);

        let decoded = decode_epoch_entries(&body).unwrap();
        assert_eq!(decoded, vec![(Epoch::new(1), 0), (Epoch::new(2), 1570)]);
    }

    #[test]
    fn test_epoch_entries_reject_ragged_payload() {
        let body = [0u8; EPOCH_ENTRY_SIZE + 1];
        assert!(matches!(
            decode_epoch_entries(&body),
            Err(CodecError::InvalidEpochPayload { .. })
        ));
    }

    #[test]
    fn test_headers_are_big_endian() {
        let encoded = encode_offset_report(HaConnectionState::Transfer, 1);
        // State ordinal 2 then offset 1, both big-endian.
        assert_eq!(&encoded[..4], &[0, 0, 0, 2]);
        assert_eq!(&encoded[4..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
