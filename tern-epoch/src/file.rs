//! Durable storage for the epoch cache.
//!
//! The file holds the full entry list as fixed 12-byte records plus the
//! live entry's end offset, framed by magic/version and a trailing CRC:
//!
//! ```text
//! [magic: 4][version: 4][entry_count: 4]
//! [epoch: 4][start_offset: 8] × entry_count
//! [last_end_offset: 8]
//! [crc32: 4]
//! ```
//!
//! All integers big-endian, matching the replication wire format. The file
//! is rewritten through a temp file + rename so a crash mid-write leaves
//! the previous generation intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tern_core::Epoch;
use thiserror::Error;

/// Magic bytes for the epoch file format.
const EPOCH_FILE_MAGIC: u32 = 0x4550_4F43; // "EPOC"

/// Current version of the epoch file format.
const EPOCH_FILE_VERSION: u32 = 1;

/// Serialized size of one epoch record: epoch (u32) + start offset (i64).
pub const EPOCH_ENTRY_SIZE: usize = 4 + 8;

/// Upper bound on persisted entries; far beyond any real election history.
const MAX_ENTRIES: usize = 1_000_000;

/// Errors from epoch file operations.
#[derive(Debug, Error)]
pub enum EpochFileError {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid epoch file format.
    #[error("invalid epoch file format: {0}")]
    InvalidFormat(String),

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value.
        expected: u32,
        /// Actual checksum value.
        actual: u32,
    },

    /// Too many entries.
    #[error("too many epoch entries: {count} exceeds maximum {max}")]
    TooManyEntries {
        /// Actual entry count.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },
}

/// Result type for epoch file operations.
pub type EpochFileResult<T> = Result<T, EpochFileError>;

/// A recovered epoch file image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochFileImage {
    /// The `(epoch, start_offset)` records in file order.
    pub records: Vec<(Epoch, i64)>,
    /// End offset of the newest entry at the time of the last write.
    pub last_end_offset: i64,
}

/// Handle to the on-disk epoch file.
#[derive(Debug, Clone)]
pub struct EpochFile {
    path: PathBuf,
}

impl EpochFile {
    /// Creates a handle for the given path. No I/O happens here.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted image, or `None` if the file does not exist.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the file is corrupt.
    pub fn load(&self) -> EpochFileResult<Option<EpochFileImage>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EpochFileError::Io(e)),
        };
        decode_image(&data).map(Some)
    }

    /// Persists the given records atomically (temp file + rename + fsync).
    ///
    /// # Errors
    /// Returns an error on I/O failure or if there are too many entries.
    pub fn store(&self, records: &[(Epoch, i64)], last_end_offset: i64) -> EpochFileResult<()> {
        let data = encode_image(records, last_end_offset)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Removes the file if present.
    ///
    /// # Errors
    /// Returns an error on I/O failure other than the file missing.
    pub fn delete(&self) -> EpochFileResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EpochFileError::Io(e)),
        }
    }
}

fn encode_image(records: &[(Epoch, i64)], last_end_offset: i64) -> EpochFileResult<Bytes> {
    if records.len() > MAX_ENTRIES {
        return Err(EpochFileError::TooManyEntries {
            count: records.len(),
            max: MAX_ENTRIES,
        });
    }

    let header_size = 4 + 4 + 4;
    let body_size = records.len() * EPOCH_ENTRY_SIZE + 8;
    let mut buf = BytesMut::with_capacity(header_size + body_size + 4);

    buf.put_u32(EPOCH_FILE_MAGIC);
    buf.put_u32(EPOCH_FILE_VERSION);
    // Safe cast: bounded by MAX_ENTRIES which fits in u32.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(records.len() as u32);

    for (epoch, start_offset) in records {
        buf.put_u32(epoch.get());
        buf.put_i64(*start_offset);
    }
    buf.put_i64(last_end_offset);

    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);

    Ok(buf.freeze())
}

fn decode_image(data: &[u8]) -> EpochFileResult<EpochFileImage> {
    let min_size = 4 + 4 + 4 + 8 + 4; // header + last_end_offset + crc, no records
    if data.len() < min_size {
        return Err(EpochFileError::InvalidFormat(format!(
            "file too short: {} bytes, minimum {min_size}",
            data.len()
        )));
    }

    let payload = &data[..data.len() - 4];
    let expected = crc32fast::hash(payload);
    let stored = u32::from_be_bytes([
        data[data.len() - 4],
        data[data.len() - 3],
        data[data.len() - 2],
        data[data.len() - 1],
    ]);
    if expected != stored {
        return Err(EpochFileError::ChecksumMismatch {
            expected,
            actual: stored,
        });
    }

    let mut buf = payload;
    let magic = buf.get_u32();
    if magic != EPOCH_FILE_MAGIC {
        return Err(EpochFileError::InvalidFormat(format!(
            "invalid magic: {magic:#x}, expected {EPOCH_FILE_MAGIC:#x}"
        )));
    }

    let version = buf.get_u32();
    if version != EPOCH_FILE_VERSION {
        return Err(EpochFileError::InvalidFormat(format!(
            "unsupported version: {version}, expected {EPOCH_FILE_VERSION}"
        )));
    }

    let count = buf.get_u32() as usize;
    if count > MAX_ENTRIES {
        return Err(EpochFileError::TooManyEntries {
            count,
            max: MAX_ENTRIES,
        });
    }
    if buf.remaining() != count * EPOCH_ENTRY_SIZE + 8 {
        return Err(EpochFileError::InvalidFormat(format!(
            "record section has {} bytes, expected {} for {count} entries",
            buf.remaining(),
            count * EPOCH_ENTRY_SIZE + 8
        )));
    }

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let epoch = Epoch::new(buf.get_u32());
        let start_offset = buf.get_i64();
        records.push((epoch, start_offset));
    }
    let last_end_offset = buf.get_i64();

    Ok(EpochFileImage {
        records,
        last_end_offset,
    })
}
