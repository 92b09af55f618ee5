//! Storage error types.
//!
//! Everything the engine can fail with funnels into one enum so the public
//! entry points propagate with `?`. The broad categories:
//!
//! - **Not found**: unknown volume when auto-create is off, or a missing
//!   segment object.
//! - **Corruption**: malformed segment headers, decompression mismatches,
//!   short reads of immutable objects, journal records that fail their CRC.
//! - **Transient I/O**: object-store failures. Flush swallows these and
//!   retries forever; the read path surfaces them immediately.
//! - **Internal**: sub-range computations that violated their own
//!   invariants. These are bugs and are surfaced rather than papered over.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] lsvd_core::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown volume: {0}")]
    VolumeNotFound(String),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error("internal range error: {0}")]
    InternalRange(String),
}
