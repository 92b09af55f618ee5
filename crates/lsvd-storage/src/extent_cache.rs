//! On-disk cache of recently read extents.
//!
//! Object stores answer ranged reads in tens of milliseconds; a local file
//! answers in microseconds. This cache keeps the raw (still possibly
//! compressed) bytes of recently fetched extents on disk, keyed by
//! `(segment, offset, size)`. Keys are immutable — a segment never changes
//! once uploaded — so entries are valid until evicted.
//!
//! Eviction is LRU by byte budget: an in-memory index tracks sizes and
//! access order, and the least recently used entries are unlinked until the
//! new entry fits.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;
use lsvd_core::ExtentLocation;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// More entries than any sane byte budget will hold; the budget is the real
/// limit.
const INDEX_CAPACITY: usize = 100_000;

struct Inner {
    lru: LruCache<String, u64>,
    current_bytes: u64,
}

/// Bounded on-disk LRU cache of raw extent bytes.
pub struct ExtentCache {
    dir: PathBuf,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

impl ExtentCache {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let capacity = NonZeroUsize::new(INDEX_CAPACITY).ok_or_else(|| {
            Error::InternalRange("extent cache index capacity must be nonzero".to_string())
        })?;

        Ok(ExtentCache {
            dir,
            max_bytes,
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                current_bytes: 0,
            }),
        })
    }

    fn entry_path(&self, loc: &ExtentLocation) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", loc.segment, loc.offset, loc.size))
    }

    fn entry_key(loc: &ExtentLocation) -> String {
        format!("{}.{}.{}", loc.segment, loc.offset, loc.size)
    }

    /// Fill `buf` from the cache. Returns `false` on a miss. A present entry
    /// of the wrong length is corruption and surfaces as an error.
    pub async fn read_extent(&self, loc: &ExtentLocation, buf: &mut [u8]) -> Result<bool> {
        let path = self.entry_path(loc);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if data.len() != buf.len() {
            return Err(Error::Corruption(format!(
                "cached extent {} has {} bytes, expected {}",
                Self::entry_key(loc),
                data.len(),
                buf.len()
            )));
        }

        buf.copy_from_slice(&data);

        let mut inner = self.inner.lock().await;
        inner.lru.get(&Self::entry_key(loc));

        Ok(true)
    }

    /// Store an extent's raw bytes, evicting least recently used entries
    /// until the budget allows it.
    pub async fn write_extent(&self, loc: &ExtentLocation, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        let key = Self::entry_key(loc);

        {
            let mut inner = self.inner.lock().await;

            while inner.current_bytes + size > self.max_bytes {
                let Some((old_key, old_size)) = inner.lru.pop_lru() else {
                    warn!(
                        needed = size,
                        max_bytes = self.max_bytes,
                        "extent larger than the whole cache budget, not caching"
                    );
                    return Ok(());
                };

                let path = self.dir.join(&old_key);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(key = %old_key, error = %e, "failed to evict cached extent");
                }
                inner.current_bytes = inner.current_bytes.saturating_sub(old_size);
                debug!(key = %old_key, size = old_size, "evicted cached extent");
            }

            if let Some(prev) = inner.lru.push(key.clone(), size) {
                // replaced an entry for the same key; its bytes get rewritten
                inner.current_bytes = inner.current_bytes.saturating_sub(prev.1);
            }
            inner.current_bytes += size;
        }

        tokio::fs::write(self.entry_path(loc), data).await?;
        Ok(())
    }

    /// Number of entries currently indexed.
    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.lru.len()
    }

    /// Drop the index. Cached files stay on disk; a fresh cache over the
    /// same directory simply repopulates on use.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.lru.clear();
        inner.current_bytes = 0;
    }
}
