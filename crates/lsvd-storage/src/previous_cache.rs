//! The previous-cache slot: the just-sealed creator, still serving reads.
//!
//! Between sealing a segment creator and installing its flushed entries into
//! the extent map there is a window where the data exists nowhere else. The
//! slot holds the sealed creator (read-only, shared) through that window so
//! reads keep seeing their own writes. The flush task clears the slot only
//! after the map update commits.
//!
//! Filling the slot waits until it is empty, which is what serializes
//! flushes: a second seal cannot proceed until the previous install
//! finished.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::segment_creator::SegmentCreator;

#[derive(Default)]
pub(crate) struct PreviousCache {
    slot: Mutex<Option<Arc<SegmentCreator>>>,
    cleared: Notify,
}

impl PreviousCache {
    pub(crate) fn new() -> Self {
        PreviousCache::default()
    }

    /// Park `creator` in the slot, waiting for any previous occupant to be
    /// cleared first.
    pub(crate) async fn set_when_clear(&self, creator: Arc<SegmentCreator>) {
        loop {
            // register for the wakeup before checking, so a clear between
            // the check and the await is not lost
            let notified = self.cleared.notified();

            {
                let mut slot = self.slot.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(creator);
                    return;
                }
            }

            notified.await;
        }
    }

    pub(crate) fn load(&self) -> Option<Arc<SegmentCreator>> {
        self.slot.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        *self.slot.lock().unwrap() = None;
        self.cleared.notify_waiters();
    }
}
