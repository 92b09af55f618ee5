//! LSVD storage engine.
//!
//! This crate implements a log-structured virtual disk: a fixed-size block
//! device whose writes become an append-only sequence of immutable,
//! compressed segments in blob storage (a local directory or any
//! S3-compatible object store).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐
//! │     Disk       │  read_extent / write_extent / zero_blocks
//! └───────┬────────┘
//!         │ writes
//!         ▼
//! ┌────────────────┐     seal      ┌────────────────┐
//! │ SegmentCreator │ ───────────►  │ previous cache │
//! │  (journaled)   │               │   (draining)   │
//! └────────────────┘               └───────┬────────┘
//!                                          │ background flush
//!                                          ▼
//! ┌────────────────┐   install   ┌────────────────────┐
//! │   ExtentMap    │ ◄────────── │  SegmentAccess     │
//! │  LBA → PBA     │             │  (object_store)    │
//! └───────┬────────┘             └────────────────────┘
//!         │ resolve                        ▲
//!         ▼                                │ ranged reads
//! ┌────────────────┐               ┌───────┴────────┐
//! │  read path     │ ◄──────────── │  ExtentCache   │
//! └────────────────┘               │  (on disk)     │
//!                                  └────────────────┘
//! ```
//!
//! Durability is at segment-flush boundaries plus the write-ahead journal
//! each creator keeps; crash recovery replays journals and reloads (or
//! rebuilds) the extent map. See the `disk` module for the concurrency
//! story.

pub mod access;
pub mod config;
pub mod disk;
pub mod error;
pub mod extent_cache;
pub mod extent_map;
mod previous_cache;
mod recovery;
pub mod segment_creator;
pub mod segments;

pub use access::{ObjectStoreAccess, SegmentAccess, SegmentReader, VolumeInfo};
pub use config::{DiskOptions, FlushCallback, SeqGen};
pub use disk::{Disk, FLUSH_THRESHOLD};
pub use error::{Error, Result};
pub use extent_cache::ExtentCache;
pub use extent_map::ExtentMap;
pub use segment_creator::SegmentCreator;
pub use segments::Segments;
