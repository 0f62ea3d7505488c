//! Error type shared by every layer of the index engine.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Failures surfaced by the index engine.
///
/// Every error is terminal for the call that produced it; the engine
/// performs no internal retries.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The backing byte range failed to read or write.
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    /// On-disk structures violate the declared format.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The key being inserted already exists in the index.
    #[error("conflict: {0}")]
    Conflict(&'static str),
    /// The requested key is not present.
    #[error("not found")]
    NotFound,
    /// The operation is outside what the on-disk format supports.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Block allocation ran out of space.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
}
