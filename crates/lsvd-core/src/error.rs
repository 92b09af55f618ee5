//! Error type shared by the core wire formats.

use thiserror::Error;

use crate::extent::Extent;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated varint")]
    TruncatedVarint,

    #[error("varint overflow")]
    VarintOverflow,

    #[error("invalid block flags: {0}")]
    InvalidFlags(u8),

    #[error("invalid segment id: {0}")]
    InvalidSegmentId(String),

    #[error("truncated segment header")]
    TruncatedHeader,

    #[error("range for {extent} needs {expected} bytes, got {actual}")]
    RangeSize {
        extent: Extent,
        expected: usize,
        actual: usize,
    },
}
