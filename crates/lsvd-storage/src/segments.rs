//! Per-segment statistics and liveness registry.
//!
//! Every flushed segment is registered here with its size accounting. The
//! extent map reports live-block movements as writes shadow older data; a
//! segment whose live count reaches zero after installation is dead and gets
//! queued for deletion. [`Segments::find_deleted`] drains that queue.

use std::collections::HashMap;
use std::sync::Mutex;

use lsvd_core::{SegmentId, SegmentStats};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SegmentState {
    stats: SegmentStats,
    /// Set once the segment's extent-map batch has been fully applied.
    /// Segments are never considered dead before that point.
    installed: bool,
}

/// Registry of all known segments, guarded by one lock. Critical sections
/// are short: the heavy work (object deletion) happens outside.
#[derive(Debug, Default)]
pub struct Segments {
    inner: Mutex<HashMap<SegmentId, SegmentState>>,
}

impl Segments {
    pub fn new() -> Self {
        Segments::default()
    }

    /// Register a freshly flushed segment. Live blocks start at zero and are
    /// added entry by entry as the extent map installs the segment.
    pub fn create(&self, seg: SegmentId, stats: SegmentStats) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            seg,
            SegmentState {
                stats: SegmentStats {
                    live_blocks: 0,
                    ..stats
                },
                installed: false,
            },
        );
    }

    /// Register a segment recovered from a persisted map or a rebuild, where
    /// only liveness is known. Counts as already installed.
    pub fn restore(&self, seg: SegmentId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(seg).or_default().installed = true;
    }

    pub fn add_live(&self, seg: SegmentId, blocks: u32) {
        if blocks == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.entry(seg).or_default().stats.live_blocks += blocks;
    }

    pub fn remove_live(&self, seg: SegmentId, blocks: u32) {
        if blocks == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&seg) {
            Some(state) => {
                state.stats.live_blocks = state.stats.live_blocks.saturating_sub(blocks);
                if state.stats.live_blocks == 0 && state.installed {
                    debug!(segment = %seg, "segment fully superseded");
                }
            }
            None => warn!(segment = %seg, "live-block update for unknown segment"),
        }
    }

    /// Mark a segment's installation complete, making it eligible for death
    /// once its live count hits zero.
    pub fn mark_installed(&self, seg: SegmentId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.get_mut(&seg) {
            state.installed = true;
        }
    }

    pub fn stats(&self, seg: SegmentId) -> Option<SegmentStats> {
        let inner = self.inner.lock().unwrap();
        inner.get(&seg).map(|s| s.stats)
    }

    pub fn live_blocks(&self, seg: SegmentId) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.get(&seg).map(|s| s.stats.live_blocks)
    }

    /// Installed segments with zero live blocks, removed from the registry
    /// and handed to the caller for purging.
    pub fn find_deleted(&self) -> Vec<SegmentId> {
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<SegmentId> = inner
            .iter()
            .filter(|(_, state)| state.installed && state.stats.live_blocks == 0)
            .map(|(&seg, _)| seg)
            .collect();
        for seg in &dead {
            inner.remove(seg);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(n: u8) -> SegmentId {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        SegmentId::from_bytes(bytes)
    }

    fn stats(total_blocks: u32) -> SegmentStats {
        SegmentStats {
            total_bytes: total_blocks as u64 * 4096,
            used_bytes: total_blocks as u64 * 4096,
            total_blocks,
            live_blocks: 0,
        }
    }

    #[test]
    fn create_then_install_lifecycle() {
        let segments = Segments::new();
        segments.create(seg(1), stats(10));

        segments.add_live(seg(1), 10);
        segments.mark_installed(seg(1));
        assert_eq!(segments.live_blocks(seg(1)), Some(10));
        assert!(segments.find_deleted().is_empty());

        segments.remove_live(seg(1), 10);
        assert_eq!(segments.find_deleted(), vec![seg(1)]);

        // drained: gone from the registry
        assert_eq!(segments.live_blocks(seg(1)), None);
        assert!(segments.find_deleted().is_empty());
    }

    #[test]
    fn uninstalled_segment_is_never_dead() {
        let segments = Segments::new();
        segments.create(seg(1), stats(4));
        // live count is still zero, but the batch has not been applied yet
        assert!(segments.find_deleted().is_empty());

        segments.add_live(seg(1), 4);
        segments.mark_installed(seg(1));
        assert!(segments.find_deleted().is_empty());
    }

    #[test]
    fn remove_live_saturates() {
        let segments = Segments::new();
        segments.create(seg(2), stats(2));
        segments.add_live(seg(2), 2);
        segments.remove_live(seg(2), 5);
        assert_eq!(segments.live_blocks(seg(2)), Some(0));
    }

    #[test]
    fn create_resets_live_blocks() {
        let segments = Segments::new();
        segments.create(
            seg(3),
            SegmentStats {
                live_blocks: 99,
                ..stats(5)
            },
        );
        assert_eq!(segments.live_blocks(seg(3)), Some(0));
        assert_eq!(segments.stats(seg(3)).unwrap().total_blocks, 5);
    }
}
