//! Disk configuration.
//!
//! Everything is optional: `DiskOptions::default()` opens (or creates) the
//! volume `"default"` against a local-directory object store rooted at the
//! disk path. Tests override `seq_gen` for deterministic segment ids and
//! `after_flush` to observe installs.

use std::sync::Arc;

use lsvd_core::SegmentId;

use crate::access::SegmentAccess;

/// Produces the id for the next segment. Overridden in tests to make
/// segment identity deterministic.
pub type SeqGen = Arc<dyn Fn() -> SegmentId + Send + Sync>;

/// Invoked with the segment id after each successful flush install.
pub type FlushCallback = Arc<dyn Fn(SegmentId) + Send + Sync>;

pub struct DiskOptions {
    /// Volume to attach to.
    pub volume: String,

    /// Create the volume when it does not exist (default: true).
    pub auto_create: bool,

    /// Body bytes that trigger a segment seal (default: 15 MiB).
    pub flush_threshold: u64,

    /// Byte budget of the on-disk extent cache (default: 256 MiB).
    pub extent_cache_bytes: u64,

    /// Backing object store. Defaults to a local directory at the disk path.
    pub access: Option<Arc<dyn SegmentAccess>>,

    /// Override segment id generation.
    pub seq_gen: Option<SeqGen>,

    /// Callback after each successful flush install.
    pub after_flush: Option<FlushCallback>,
}

impl Default for DiskOptions {
    fn default() -> Self {
        DiskOptions {
            volume: "default".to_string(),
            auto_create: true,
            flush_threshold: crate::disk::FLUSH_THRESHOLD,
            extent_cache_bytes: 256 * 1024 * 1024,
            access: None,
            seq_gen: None,
            after_flush: None,
        }
    }
}

impl std::fmt::Debug for DiskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskOptions")
            .field("volume", &self.volume)
            .field("auto_create", &self.auto_create)
            .field("flush_threshold", &self.flush_threshold)
            .field("extent_cache_bytes", &self.extent_cache_bytes)
            .field("access", &self.access.as_ref().map(|_| "custom"))
            .field("seq_gen", &self.seq_gen.as_ref().map(|_| "custom"))
            .field("after_flush", &self.after_flush.as_ref().map(|_| "set"))
            .finish()
    }
}
