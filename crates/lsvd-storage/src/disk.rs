//! The virtual disk: the top-level read/write orchestrator.
//!
//! A [`Disk`] exposes block reads and writes over a linear LBA space while
//! persisting everything as an append-only sequence of immutable segments.
//!
//! ## Write flow
//!
//! ```text
//! write_extent(range)
//!     ↓
//! SegmentCreator        ← journaled + buffered in memory
//!     ↓ body ≥ threshold
//! seal: creator → previous-cache slot, fresh creator installed
//!     ↓ background task
//! flush: upload segment, retry forever on error
//!     ↓
//! extent map batch install (one critical section)
//!     ↓
//! previous-cache cleared, dead segments purged
//! ```
//!
//! ## Read flow
//!
//! A read resolves against three layers, newest first: the current creator,
//! the just-sealed creator still draining in the previous-cache slot, and
//! the extent map. Whatever the map resolves is fetched per partial extent —
//! extent cache first, then a ranged object-store read through a bounded
//! LRU of open segment readers — decompressed if needed, and stitched into
//! the zero-initialized destination. Unwritten holes stay zero.
//!
//! ## Concurrency
//!
//! One writer, many readers. The current creator sits behind a mutex; the
//! extent map behind a read/write lock whose batch installs are atomic from
//! a reader's point of view. There is at most one in-flight flush: sealing
//! waits for the previous-cache slot to clear, which only happens when the
//! prior install commits. In-flight flushes ignore caller cancellation and
//! retry until they succeed.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use lsvd_core::{
    BlockFlags, Extent, ExtentLocation, RangeData, SegmentId, SegmentStats, BLOCK_SIZE,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, trace};

use crate::access::{ObjectStoreAccess, SegmentAccess, SegmentReader, VolumeInfo};
use crate::config::{DiskOptions, FlushCallback, SeqGen};
use crate::error::{Error, Result};
use crate::extent_cache::ExtentCache;
use crate::extent_map::ExtentMap;
use crate::previous_cache::PreviousCache;
use crate::recovery;
use crate::segment_creator::SegmentCreator;
use crate::segments::Segments;

/// Body bytes that trigger a segment seal.
pub const FLUSH_THRESHOLD: u64 = 15 * 1024 * 1024;

/// Capacity of the open-segment reader cache.
const OPEN_SEGMENT_CAPACITY: usize = 256;

/// State shared with background flush tasks.
pub(crate) struct Shared {
    pub(crate) volume: String,
    pub(crate) access: Arc<dyn SegmentAccess>,
    pub(crate) map: RwLock<ExtentMap>,
    pub(crate) segments: Segments,
    pub(crate) prev_cache: PreviousCache,
    pub(crate) open_segments: Mutex<LruCache<SegmentId, Arc<dyn SegmentReader>>>,
    pub(crate) extent_cache: ExtentCache,
    pub(crate) after_flush: Option<FlushCallback>,
}

/// A log-structured virtual disk bound to one volume.
pub struct Disk {
    shared: Arc<Shared>,
    path: PathBuf,
    size: u64,
    cur: Mutex<SegmentCreator>,
    seq: StdMutex<ulid::Generator>,
    seq_gen: Option<SeqGen>,
    flush_threshold: u64,
}

impl Disk {
    /// Attach to (or create) a volume. `path` holds the write-cache
    /// journals and the on-disk read cache; unless overridden, it also
    /// backs the object store.
    pub async fn open(path: impl AsRef<std::path::Path>, mut opts: DiskOptions) -> Result<Disk> {
        let path = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&path).await?;

        let access: Arc<dyn SegmentAccess> = match opts.access.take() {
            Some(access) => access,
            None => Arc::new(ObjectStoreAccess::local(&path)?),
        };
        access.init_container().await?;

        let volume = opts.volume.clone();
        let size = match access.get_volume_info(&volume).await? {
            Some(info) => info.size,
            None => {
                if !opts.auto_create {
                    return Err(Error::VolumeNotFound(volume));
                }
                access
                    .init_volume(&VolumeInfo {
                        name: volume.clone(),
                        size: 0,
                    })
                    .await?;
                0
            }
        };

        info!(volume = %volume, size, "attaching to volume");

        let open_capacity = NonZeroUsize::new(OPEN_SEGMENT_CAPACITY).ok_or_else(|| {
            Error::InternalRange("open segment capacity must be nonzero".to_string())
        })?;

        let shared = Arc::new(Shared {
            volume,
            access,
            map: RwLock::new(ExtentMap::new()),
            segments: Segments::new(),
            prev_cache: PreviousCache::new(),
            open_segments: Mutex::new(LruCache::new(open_capacity)),
            extent_cache: ExtentCache::new(path.join("readcache"), opts.extent_cache_bytes)?,
            after_flush: opts.after_flush.take(),
        });

        let seq = StdMutex::new(ulid::Generator::new());
        let seq_gen = opts.seq_gen.take();

        let mut recovered = recovery::restore_write_cache(&path).await?;
        let cur = match recovered.pop() {
            Some(oc) => oc,
            None => SegmentCreator::new(&path, gen_seq(&seq_gen, &seq)).await?,
        };

        if recovery::load_lba_map(&shared).await? {
            info!(
                entries = shared.map.read().unwrap().len(),
                "reusing serialized LBA map"
            );
        } else {
            recovery::rebuild_from_segments(&shared).await?;
        }

        // journals older than the current one hold data that predates the
        // crash; publish them as segments before accepting new writes
        for oc in recovered {
            if oc.is_empty() {
                let _ = tokio::fs::remove_file(oc.journal_path()).await;
                continue;
            }
            info!(segment = %oc.id(), "flushing recovered write cache journal");
            flush_and_install(shared.clone(), Arc::new(oc)).await;
        }

        Ok(Disk {
            shared,
            path,
            size,
            cur: Mutex::new(cur),
            seq,
            seq_gen,
            flush_threshold: opts.flush_threshold,
        })
    }

    /// Volume size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn volume(&self) -> &str {
        &self.shared.volume
    }

    /// Number of live entries in the extent map.
    pub fn map_len(&self) -> usize {
        self.shared.map.read().unwrap().len()
    }

    /// Stats for a known segment; `None` once a segment has been purged.
    pub fn segment_stats(&self, seg: SegmentId) -> Option<SegmentStats> {
        self.shared.segments.stats(seg)
    }

    fn next_seq(&self) -> SegmentId {
        gen_seq(&self.seq_gen, &self.seq)
    }

    /// Write one extent. May seal the current segment when the body
    /// crosses the flush threshold; the flush itself runs in the
    /// background.
    pub async fn write_extent(&self, data: &RangeData) -> Result<()> {
        let mut cur = self.cur.lock().await;
        cur.write_extent(data).await?;
        self.maybe_seal(&mut cur).await
    }

    /// Write multiple extents with a single flush check at the end, so all
    /// of them land in the same segment.
    pub async fn write_extents(&self, ranges: &[RangeData]) -> Result<()> {
        let mut cur = self.cur.lock().await;
        for data in ranges {
            cur.write_extent(data).await?;
        }
        self.maybe_seal(&mut cur).await
    }

    /// Mark a range as zero.
    pub async fn zero_blocks(&self, rng: Extent) -> Result<()> {
        self.cur.lock().await.zero_blocks(rng).await
    }

    /// Fsync the current write-cache journal.
    pub async fn sync_write_cache(&self) -> Result<()> {
        self.cur.lock().await.sync().await
    }

    async fn maybe_seal(&self, cur: &mut SegmentCreator) -> Result<()> {
        if cur.body_size() < self.flush_threshold {
            return Ok(());
        }

        info!(
            body_size = cur.body_size(),
            extents = cur.entry_count(),
            blocks = cur.total_blocks(),
            storage_ratio = cur.avg_storage_ratio(),
            "flushing new segment"
        );

        let _ = self.seal(cur).await?;
        Ok(())
    }

    /// Detach the current creator, park it in the previous-cache slot, and
    /// hand it to a background flush task. Returns a receiver that fires
    /// once the install is complete.
    async fn seal(&self, cur: &mut SegmentCreator) -> Result<oneshot::Receiver<()>> {
        let next = SegmentCreator::new(&self.path, self.next_seq()).await?;
        let sealed = Arc::new(std::mem::replace(cur, next));

        debug!(segment = %sealed.id(), "starting background segment flush");
        self.shared.prev_cache.set_when_clear(sealed.clone()).await;

        let shared = self.shared.clone();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            flush_and_install(shared, sealed).await;
            let _ = done_tx.send(());
        });

        Ok(done_rx)
    }

    /// Seal the current segment and wait for it to be flushed and
    /// installed. A no-op when nothing has been written.
    pub async fn close_segment(&self) -> Result<()> {
        let done = {
            let mut cur = self.cur.lock().await;
            if cur.is_empty() {
                return Ok(());
            }
            self.seal(&mut cur).await?
        };
        let _ = done.await;
        Ok(())
    }

    /// Flush outstanding writes, persist the LBA map for fast restart, and
    /// release caches.
    pub async fn close(&self) -> Result<()> {
        self.close_segment().await?;
        recovery::save_lba_map(&self.shared).await?;
        self.shared.open_segments.lock().await.clear();
        self.shared.extent_cache.close().await;
        Ok(())
    }

    /// Read a range of blocks. Unwritten space reads as zeros.
    pub async fn read_extent(&self, rng: Extent) -> Result<RangeData> {
        let mut data = RangeData::zeroed(rng);

        trace!(extent = %rng, "attempting to fill request from write cache");
        let remaining = self.fill_from_write_cache(&mut data).await?;
        if remaining.is_empty() {
            trace!("extent filled entirely from write cache");
            return Ok(data);
        }

        trace!(holes = remaining.len(), "resolving remaining extents");

        // One fetch per distinct physical location. Consecutive holes served
        // by the same stored extent collapse into a single request.
        struct ReadRequest {
            loc: ExtentLocation,
            pieces: Vec<Extent>,
        }

        let mut reqs: Vec<ReadRequest> = Vec::new();
        {
            let map = self.shared.map.read().unwrap();
            for hole in &remaining {
                for pe in map.resolve(*hole) {
                    if pe.loc.size == 0 {
                        // empty extent: the destination is already zeroed
                        continue;
                    }
                    match reqs.last_mut() {
                        Some(last) if last.loc == pe.loc => last.pieces.push(pe.partial),
                        _ => reqs.push(ReadRequest {
                            loc: pe.loc,
                            pieces: vec![pe.partial],
                        }),
                    }
                }
            }
        }

        for req in &reqs {
            self.read_partial_extent(&req.loc, &req.pieces, &mut data)
                .await?;
        }

        Ok(data)
    }

    /// Serve what the current and previous creators hold; returns the holes
    /// still unmet.
    async fn fill_from_write_cache(&self, data: &mut RangeData) -> Result<Vec<Extent>> {
        let rng = data.extent();

        let used = {
            let cur = self.cur.lock().await;
            cur.fill_extent(rng, data.as_mut_slice())?
        };

        let remaining = if used.is_empty() {
            vec![rng]
        } else {
            rng.sub_many(&used)
        };

        if remaining.is_empty() {
            return Ok(remaining);
        }

        self.fill_from_prev_cache(data, remaining)
    }

    fn fill_from_prev_cache(
        &self,
        data: &mut RangeData,
        holes: Vec<Extent>,
    ) -> Result<Vec<Extent>> {
        let Some(prev) = self.shared.prev_cache.load() else {
            return Ok(holes);
        };

        let mut remaining = Vec::new();
        for hole in holes {
            let buf = data.slice_mut(hole).ok_or_else(|| {
                Error::InternalRange(format!("hole {hole} outside read range"))
            })?;

            let used = prev.fill_extent(hole, buf)?;
            if used.is_empty() {
                remaining.push(hole);
            } else {
                remaining.extend(hole.sub_many(&used));
            }
        }

        Ok(remaining)
    }

    /// Fetch one stored extent and copy its live pieces into the
    /// destination.
    async fn read_partial_extent(
        &self,
        loc: &ExtentLocation,
        pieces: &[Extent],
        dest: &mut RangeData,
    ) -> Result<()> {
        let mut raw = vec![0u8; loc.size as usize];

        let found = self.shared.extent_cache.read_extent(loc, &mut raw).await?;
        if !found {
            let reader = self.open_segment(loc.segment).await?;
            let n = reader.read_at(&mut raw, loc.offset as u64).await?;
            if n != raw.len() {
                error!(
                    segment = %loc.segment,
                    read = n,
                    expected = raw.len(),
                    "short read from segment"
                );
                return Err(Error::ShortRead {
                    expected: raw.len(),
                    actual: n,
                });
            }
            self.shared.extent_cache.write_extent(loc, &raw).await?;
        }

        let cooked = match loc.flags {
            BlockFlags::Empty => return Ok(()),
            BlockFlags::Uncompressed => raw,
            BlockFlags::Compressed => {
                let mut out = vec![0u8; loc.raw_size as usize];
                let n = lz4_flex::block::decompress_into(&raw, &mut out).map_err(|e| {
                    Error::Decompression(format!(
                        "error uncompressing extent (raw_size: {}, stored: {}): {e}",
                        loc.raw_size, loc.size
                    ))
                })?;
                if n != out.len() {
                    return Err(Error::Decompression(format!(
                        "extent decoded to wrong size ({n} != {})",
                        out.len()
                    )));
                }
                out
            }
        };

        // cooked holds the bytes of loc.extent; each piece is a live
        // sub-range of it landing at the same LBAs in the destination
        for piece in pieces {
            let src_start = (piece.lba - loc.extent.lba) as usize * BLOCK_SIZE;
            let src = cooked
                .get(src_start..src_start + piece.byte_len())
                .ok_or_else(|| {
                    Error::InternalRange(format!(
                        "piece {piece} outside stored extent {}",
                        loc.extent
                    ))
                })?;
            let dst = dest.slice_mut(*piece).ok_or_else(|| {
                Error::InternalRange(format!("piece {piece} outside read range"))
            })?;
            dst.copy_from_slice(src);
        }

        Ok(())
    }

    async fn open_segment(&self, seg: SegmentId) -> Result<Arc<dyn SegmentReader>> {
        {
            let mut open = self.shared.open_segments.lock().await;
            if let Some(reader) = open.get(&seg) {
                return Ok(reader.clone());
            }
        }

        let reader: Arc<dyn SegmentReader> =
            Arc::from(self.shared.access.open_segment(seg).await?);

        let mut open = self.shared.open_segments.lock().await;
        open.push(seg, reader.clone());
        Ok(reader)
    }
}

fn gen_seq(seq_gen: &Option<SeqGen>, seq: &StdMutex<ulid::Generator>) -> SegmentId {
    if let Some(custom) = seq_gen {
        return custom();
    }
    let mut generator = seq.lock().unwrap();
    match generator.generate() {
        Ok(ulid) => ulid.into(),
        // generator exhausted within one millisecond; a fresh random id
        // preserves uniqueness, monotonicity resumes next tick
        Err(_) => SegmentId::generate(),
    }
}

/// Upload a sealed creator and install it: registry entry, extent-map batch
/// (atomic for readers), previous-cache clear, dead-segment cleanup.
///
/// Flush does network calls, so it retries forever; nothing surfaces to the
/// writer.
pub(crate) async fn flush_and_install(shared: Arc<Shared>, oc: Arc<SegmentCreator>) {
    let seg = oc.id();
    let start = Instant::now();

    let (entries, stats) = loop {
        match oc.flush(shared.access.as_ref(), &shared.volume).await {
            Ok(out) => break out,
            Err(e) => {
                error!(segment = %seg, error = %e, "error flushing data to segment, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    let flush_dur = start.elapsed();

    debug!(segment = %seg, "segment published, installing into extent map");

    let map_start = Instant::now();
    shared.segments.create(seg, stats);
    {
        let mut map = shared.map.write().unwrap();
        map.update_batch(&entries, seg, &shared.segments);
    }
    shared.segments.mark_installed(seg);
    shared.prev_cache.clear();
    let map_dur = map_start.elapsed();

    if let Some(callback) = &shared.after_flush {
        callback(seg);
    }

    info!(
        segment = %seg,
        flush_ms = flush_dur.as_millis() as u64,
        map_us = map_dur.as_micros() as u64,
        "uploaded new segment"
    );

    if let Err(e) = cleanup_deleted_segments(&shared).await {
        error!(error = %e, "error cleaning up deleted segments");
    }
}

/// Purge segments whose last live block was overwritten.
async fn cleanup_deleted_segments(shared: &Shared) -> Result<()> {
    for seg in shared.segments.find_deleted() {
        debug!(volume = %shared.volume, segment = %seg, "removing dead segment");
        shared.open_segments.lock().await.pop(&seg);
        shared
            .access
            .remove_segment_from_volume(&shared.volume, seg)
            .await?;
        shared.access.remove_segment(seg).await?;
    }
    Ok(())
}
