//! Core types for the LSVD log-structured virtual disk.
//!
//! This crate holds the pieces shared by every layer of the disk:
//!
//! 1. **Extent algebra**: arithmetic on contiguous LBA ranges (cover, clamp,
//!    subtract). Every overlap decision in the write cache, the extent map,
//!    and the read path reduces to these operations.
//! 2. **Range buffers**: [`RangeData`] pairs an extent with the bytes backing
//!    it, so block-aligned sub-slicing is checked in one place.
//! 3. **Segment model**: [`SegmentId`] (ULID), per-extent header records, and
//!    the segment header wire format.
//! 4. **Varints**: the unsigned LEB128 codec used by the segment header.
//!
//! Everything here is synchronous and allocation-light; the async machinery
//! (object stores, journals, caches) lives in `lsvd-storage`.

pub mod error;
pub mod extent;
pub mod range;
pub mod segment;
pub mod varint;

pub use error::{Error, Result};
pub use extent::{Cover, Extent, Lba};
pub use range::RangeData;
pub use segment::{
    BlockFlags, ExtentHeader, ExtentLocation, PartialExtent, SegmentHeader, SegmentId,
    SegmentStats,
};

/// Size of every device block in bytes. All extents address whole blocks.
pub const BLOCK_SIZE: usize = 4096;
