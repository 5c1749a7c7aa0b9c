//! Tern Epoch - the epoch-indexed history of a commit log.
//!
//! Every master term owns a contiguous range of the commit log. The
//! `(epoch, start_offset)` entries recorded here let two replicas compute
//! the largest offset at which their logs are byte-identical, which is the
//! truncation point a rejoining slave must fall back to before it can
//! stream from a new master.
//!
//! The cache is kept in memory behind a read/write lock and mirrored to a
//! small checksummed file on every mutation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod file;

pub use cache::{EpochCache, EpochEntry};
pub use file::{EpochFile, EpochFileError, EpochFileImage, EpochFileResult, EPOCH_ENTRY_SIZE};
