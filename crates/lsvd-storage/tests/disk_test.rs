//! End-to-end disk tests.
//!
//! These exercise the full write → seal → flush → install → read pipeline
//! against a real (in-memory) object store, including crash recovery from
//! write-cache journals and restart from the persisted LBA map.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use lsvd_core::{Extent, RangeData, SegmentId, BLOCK_SIZE};
use lsvd_storage::{
    Disk, DiskOptions, ObjectStoreAccess, SegmentAccess, SegmentCreator, SegmentReader, SeqGen,
    VolumeInfo,
};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tempfile::TempDir;

fn solid(extent: Extent, value: u8) -> RangeData {
    let mut data = RangeData::zeroed(extent);
    data.as_mut_slice().fill(value);
    data
}

/// Compressible but non-trivial data.
fn patterned(extent: Extent, seed: u8) -> RangeData {
    let mut data = RangeData::zeroed(extent);
    for (i, b) in data.as_mut_slice().iter_mut().enumerate() {
        *b = seed.wrapping_add((i % 253) as u8);
    }
    data
}

/// Incompressible data, deterministic per seed.
fn noisy(extent: Extent, seed: u64) -> RangeData {
    let mut data = RangeData::zeroed(extent);
    let mut x = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    for b in data.as_mut_slice().iter_mut() {
        x = x
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *b = (x >> 56) as u8;
    }
    data
}

fn seq_id(n: u64) -> SegmentId {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&n.to_be_bytes());
    SegmentId::from_bytes(bytes)
}

/// Deterministic segment ids: start, start+1, ...
fn counting_seq_gen(start: u64) -> SeqGen {
    let counter = AtomicU64::new(start);
    Arc::new(move || seq_id(counter.fetch_add(1, Ordering::SeqCst)))
}

struct TestDisk {
    disk: Disk,
    access: Arc<dyn SegmentAccess>,
    store: Arc<InMemory>,
    flushed: Arc<Mutex<Vec<SegmentId>>>,
    _tmp: TempDir,
}

async fn open_test_disk() -> TestDisk {
    open_test_disk_at(Arc::new(InMemory::new()), TempDir::new().unwrap(), 1).await
}

async fn open_test_disk_at(store: Arc<InMemory>, tmp: TempDir, seq_start: u64) -> TestDisk {
    let access: Arc<dyn SegmentAccess> = Arc::new(ObjectStoreAccess::new(store.clone()));
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let flushed_cb = flushed.clone();

    let disk = Disk::open(
        tmp.path(),
        DiskOptions {
            access: Some(access.clone()),
            seq_gen: Some(counting_seq_gen(seq_start)),
            after_flush: Some(Arc::new(move |seg| {
                flushed_cb.lock().unwrap().push(seg);
            })),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    TestDisk {
        disk,
        access,
        store,
        flushed,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn exact_overwrite_supersedes_first_segment() {
    let t = open_test_disk().await;

    t.disk
        .write_extent(&solid(Extent::new(1, 1), 0x11))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    t.disk
        .write_extent(&solid(Extent::new(1, 1), 0x22))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    let data = t.disk.read_extent(Extent::new(1, 1)).await.unwrap();
    assert_eq!(data.as_slice(), &vec![0x22u8; BLOCK_SIZE][..]);

    assert_eq!(t.disk.map_len(), 1);

    let flushed = t.flushed.lock().unwrap().clone();
    assert_eq!(flushed, vec![seq_id(1), seq_id(2)]);

    // the first segment lost its last live block and was purged
    assert_eq!(t.disk.segment_stats(seq_id(1)), None);
    assert_eq!(
        t.access.list_segments("default").await.unwrap(),
        vec![seq_id(2)]
    );
}

#[tokio::test]
async fn partial_overwrite_in_middle() {
    let t = open_test_disk().await;

    t.disk
        .write_extent(&solid(Extent::new(0, 10), 0xAA))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    t.disk
        .write_extent(&solid(Extent::new(2, 1), 0xBB))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    let data = t.disk.read_extent(Extent::new(0, 10)).await.unwrap();
    for block in 0..10u32 {
        let expect = if block == 2 { 0xBB } else { 0xAA };
        assert_eq!(
            data.block(block),
            &vec![expect; BLOCK_SIZE][..],
            "block {block}"
        );
    }

    assert_eq!(t.disk.map_len(), 3);

    let (seg1, seg2) = {
        let flushed = t.flushed.lock().unwrap();
        (flushed[0], flushed[1])
    };
    assert_eq!(t.disk.segment_stats(seg1).unwrap().live_blocks, 9);
    assert_eq!(t.disk.segment_stats(seg2).unwrap().live_blocks, 1);
}

#[tokio::test]
async fn sparse_read_returns_zeros_for_holes() {
    let t = open_test_disk().await;

    t.disk
        .write_extent(&solid(Extent::new(5, 2), 0xCC))
        .await
        .unwrap();

    // served from the write cache
    let data = t.disk.read_extent(Extent::new(0, 10)).await.unwrap();
    for block in 0..10u32 {
        let expect = if block == 5 || block == 6 { 0xCC } else { 0 };
        assert_eq!(data.block(block), &vec![expect; BLOCK_SIZE][..]);
    }

    // and identically once flushed into a segment
    t.disk.close_segment().await.unwrap();
    let data = t.disk.read_extent(Extent::new(0, 10)).await.unwrap();
    for block in 0..10u32 {
        let expect = if block == 5 || block == 6 { 0xCC } else { 0 };
        assert_eq!(data.block(block), &vec![expect; BLOCK_SIZE][..]);
    }
}

/// Counts `open_segment` calls so tests can observe how many distinct
/// segment fetches a read needed.
struct CountingAccess {
    inner: Arc<dyn SegmentAccess>,
    opens: AtomicU64,
}

#[async_trait]
impl SegmentAccess for CountingAccess {
    async fn init_container(&self) -> lsvd_storage::Result<()> {
        self.inner.init_container().await
    }
    async fn init_volume(&self, info: &VolumeInfo) -> lsvd_storage::Result<()> {
        self.inner.init_volume(info).await
    }
    async fn get_volume_info(&self, vol: &str) -> lsvd_storage::Result<Option<VolumeInfo>> {
        self.inner.get_volume_info(vol).await
    }
    async fn list_volumes(&self) -> lsvd_storage::Result<Vec<String>> {
        self.inner.list_volumes().await
    }
    async fn list_segments(&self, vol: &str) -> lsvd_storage::Result<Vec<SegmentId>> {
        self.inner.list_segments(vol).await
    }
    async fn append_to_objects(&self, vol: &str, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.append_to_objects(vol, seg).await
    }
    async fn remove_segment_from_volume(
        &self,
        vol: &str,
        seg: SegmentId,
    ) -> lsvd_storage::Result<()> {
        self.inner.remove_segment_from_volume(vol, seg).await
    }
    async fn open_segment(&self, seg: SegmentId) -> lsvd_storage::Result<Box<dyn SegmentReader>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_segment(seg).await
    }
    async fn write_segment(&self, seg: SegmentId, data: Bytes) -> lsvd_storage::Result<()> {
        self.inner.write_segment(seg, data).await
    }
    async fn read_metadata(&self, vol: &str, name: &str) -> lsvd_storage::Result<Option<Bytes>> {
        self.inner.read_metadata(vol, name).await
    }
    async fn write_metadata(&self, vol: &str, name: &str, data: Bytes) -> lsvd_storage::Result<()> {
        self.inner.write_metadata(vol, name, data).await
    }
    async fn remove_segment(&self, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.remove_segment(seg).await
    }
}

#[tokio::test]
async fn cross_segment_read_stitches_two_segments() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());
    let counting = Arc::new(CountingAccess {
        inner: Arc::new(ObjectStoreAccess::new(store)),
        opens: AtomicU64::new(0),
    });

    let disk = Disk::open(
        tmp.path(),
        DiskOptions {
            access: Some(counting.clone()),
            seq_gen: Some(counting_seq_gen(1)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    disk.write_extent(&solid(Extent::new(0, 4), 0xA1))
        .await
        .unwrap();
    disk.close_segment().await.unwrap();
    disk.write_extent(&solid(Extent::new(4, 4), 0xB2))
        .await
        .unwrap();
    disk.close_segment().await.unwrap();

    counting.opens.store(0, Ordering::SeqCst);

    let data = disk.read_extent(Extent::new(0, 8)).await.unwrap();
    for block in 0..8u32 {
        let expect = if block < 4 { 0xA1 } else { 0xB2 };
        assert_eq!(data.block(block), &vec![expect; BLOCK_SIZE][..]);
    }

    assert_eq!(disk.map_len(), 2);
    assert_eq!(counting.opens.load(Ordering::SeqCst), 2);

    // the reader LRU keeps the handles: a second read opens nothing
    counting.opens.store(0, Ordering::SeqCst);
    disk.read_extent(Extent::new(0, 8)).await.unwrap();
    assert_eq!(counting.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn crash_before_flush_recovers_from_journal() {
    let store = Arc::new(InMemory::new());
    let written = patterned(Extent::new(0, 100), 0x31);

    let t = open_test_disk_at(store.clone(), TempDir::new().unwrap(), 1).await;
    t.disk.write_extent(&written).await.unwrap();
    t.disk.sync_write_cache().await.unwrap();

    let tmp = t._tmp;
    drop(t.disk);
    // simulated crash: no close, no flush

    let t2 = open_test_disk_at(store.clone(), tmp, 100).await;
    let data = t2.disk.read_extent(Extent::new(0, 100)).await.unwrap();
    assert_eq!(data.as_slice(), written.as_slice());

    // nothing was ever uploaded; this all came from the journal
    assert_eq!(t2.access.list_segments("default").await.unwrap(), vec![]);

    // a clean close flushes the recovered writes
    t2.disk.close().await.unwrap();
    assert_eq!(t2.access.list_segments("default").await.unwrap().len(), 1);
}

#[tokio::test]
async fn older_journals_are_flushed_on_open() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());

    // two sealed-but-never-flushed creators, as a crash mid-flush leaves
    {
        let mut older = SegmentCreator::new(tmp.path(), seq_id(1)).await.unwrap();
        older
            .write_extent(&solid(Extent::new(0, 4), 0x11))
            .await
            .unwrap();
        older.sync().await.unwrap();

        let mut newer = SegmentCreator::new(tmp.path(), seq_id(2)).await.unwrap();
        newer
            .write_extent(&solid(Extent::new(2, 2), 0x22))
            .await
            .unwrap();
        newer.sync().await.unwrap();
    }

    let t = open_test_disk_at(store, tmp, 100).await;

    // the older journal became a real segment during open
    assert_eq!(
        t.access.list_segments("default").await.unwrap(),
        vec![seq_id(1)]
    );

    // the newer journal is the current write cache and shadows the older
    let data = t.disk.read_extent(Extent::new(0, 4)).await.unwrap();
    assert_eq!(data.block(0), &vec![0x11u8; BLOCK_SIZE][..]);
    assert_eq!(data.block(1), &vec![0x11u8; BLOCK_SIZE][..]);
    assert_eq!(data.block(2), &vec![0x22u8; BLOCK_SIZE][..]);
    assert_eq!(data.block(3), &vec![0x22u8; BLOCK_SIZE][..]);
}

#[tokio::test]
async fn empty_block_write_is_elided() {
    let t = open_test_disk().await;

    t.disk
        .write_extent(&RangeData::zeroed(Extent::new(0, 1)))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    let data = t.disk.read_extent(Extent::new(0, 1)).await.unwrap();
    assert!(data.is_all_zero());

    let seg = t.flushed.lock().unwrap()[0];
    let stats = t.disk.segment_stats(seg).unwrap();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.live_blocks, 1);

    // the stored object is just a header, far smaller than a block
    let meta = t
        .store
        .head(&object_store::path::Path::from(format!(
            "objects/object.{seg}"
        )))
        .await
        .unwrap();
    assert!(meta.size < BLOCK_SIZE, "object is {} bytes", meta.size);
}

#[tokio::test]
async fn zero_blocks_shadow_earlier_data() {
    let t = open_test_disk().await;

    t.disk
        .write_extent(&solid(Extent::new(0, 4), 0x11))
        .await
        .unwrap();
    t.disk.zero_blocks(Extent::new(1, 2)).await.unwrap();

    let check = |data: &RangeData| {
        assert_eq!(data.block(0), &vec![0x11u8; BLOCK_SIZE][..]);
        assert!(data.block(1).iter().all(|&b| b == 0));
        assert!(data.block(2).iter().all(|&b| b == 0));
        assert_eq!(data.block(3), &vec![0x11u8; BLOCK_SIZE][..]);
    };

    let data = t.disk.read_extent(Extent::new(0, 4)).await.unwrap();
    check(&data);

    t.disk.close_segment().await.unwrap();
    let data = t.disk.read_extent(Extent::new(0, 4)).await.unwrap();
    check(&data);
}

#[tokio::test]
async fn clean_close_persists_lba_map() {
    let store = Arc::new(InMemory::new());
    let written = patterned(Extent::new(3, 20), 0x55);

    let t = open_test_disk_at(store.clone(), TempDir::new().unwrap(), 1).await;
    t.disk.write_extent(&written).await.unwrap();
    t.disk.close().await.unwrap();

    assert!(t
        .access
        .read_metadata("default", "lbamap")
        .await
        .unwrap()
        .is_some());

    let tmp = t._tmp;
    drop(t.disk);

    // reopen through a counting access: a loaded map means no segment
    // headers are re-read during open
    let counting = Arc::new(CountingAccess {
        inner: Arc::new(ObjectStoreAccess::new(store.clone())),
        opens: AtomicU64::new(0),
    });
    let disk = Disk::open(
        tmp.path(),
        DiskOptions {
            access: Some(counting.clone()),
            seq_gen: Some(counting_seq_gen(100)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(counting.opens.load(Ordering::SeqCst), 0);
    assert_eq!(disk.map_len(), 1);

    let data = disk.read_extent(Extent::new(3, 20)).await.unwrap();
    assert_eq!(data.as_slice(), written.as_slice());
}

#[tokio::test]
async fn missing_lba_map_rebuilds_from_segments() {
    let store = Arc::new(InMemory::new());

    let t = open_test_disk_at(store.clone(), TempDir::new().unwrap(), 1).await;
    t.disk
        .write_extent(&solid(Extent::new(0, 10), 0xAA))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();
    t.disk
        .write_extent(&solid(Extent::new(2, 1), 0xBB))
        .await
        .unwrap();
    t.disk.close_segment().await.unwrap();

    // drop without close(): no serialized map
    let tmp = t._tmp;
    drop(t.disk);

    let t2 = open_test_disk_at(store.clone(), tmp, 100).await;
    assert_eq!(t2.disk.map_len(), 3);

    let data = t2.disk.read_extent(Extent::new(0, 10)).await.unwrap();
    for block in 0..10u32 {
        let expect = if block == 2 { 0xBB } else { 0xAA };
        assert_eq!(data.block(block), &vec![expect; BLOCK_SIZE][..]);
    }
}

#[tokio::test]
async fn write_extents_lands_in_one_segment() {
    let t = open_test_disk().await;

    let ranges = vec![
        solid(Extent::new(0, 2), 0x01),
        solid(Extent::new(10, 2), 0x02),
        solid(Extent::new(20, 2), 0x03),
    ];
    t.disk.write_extents(&ranges).await.unwrap();
    t.disk.close_segment().await.unwrap();

    assert_eq!(t.flushed.lock().unwrap().len(), 1);
    let seg = t.flushed.lock().unwrap()[0];
    assert_eq!(t.disk.segment_stats(seg).unwrap().live_blocks, 6);

    for (ext, value) in [
        (Extent::new(0, 2), 0x01),
        (Extent::new(10, 2), 0x02),
        (Extent::new(20, 2), 0x03),
    ] {
        let data = t.disk.read_extent(ext).await.unwrap();
        assert_eq!(data.as_slice(), solid(ext, value).as_slice());
    }
}

/// Holds `write_segment` until released, so tests can observe the window
/// where a sealed creator is draining.
struct GatedAccess {
    inner: Arc<dyn SegmentAccess>,
    hold: AtomicBool,
    gate: tokio::sync::Semaphore,
}

#[async_trait]
impl SegmentAccess for GatedAccess {
    async fn init_container(&self) -> lsvd_storage::Result<()> {
        self.inner.init_container().await
    }
    async fn init_volume(&self, info: &VolumeInfo) -> lsvd_storage::Result<()> {
        self.inner.init_volume(info).await
    }
    async fn get_volume_info(&self, vol: &str) -> lsvd_storage::Result<Option<VolumeInfo>> {
        self.inner.get_volume_info(vol).await
    }
    async fn list_volumes(&self) -> lsvd_storage::Result<Vec<String>> {
        self.inner.list_volumes().await
    }
    async fn list_segments(&self, vol: &str) -> lsvd_storage::Result<Vec<SegmentId>> {
        self.inner.list_segments(vol).await
    }
    async fn append_to_objects(&self, vol: &str, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.append_to_objects(vol, seg).await
    }
    async fn remove_segment_from_volume(
        &self,
        vol: &str,
        seg: SegmentId,
    ) -> lsvd_storage::Result<()> {
        self.inner.remove_segment_from_volume(vol, seg).await
    }
    async fn open_segment(&self, seg: SegmentId) -> lsvd_storage::Result<Box<dyn SegmentReader>> {
        self.inner.open_segment(seg).await
    }
    async fn write_segment(&self, seg: SegmentId, data: Bytes) -> lsvd_storage::Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.inner.write_segment(seg, data).await
    }
    async fn read_metadata(&self, vol: &str, name: &str) -> lsvd_storage::Result<Option<Bytes>> {
        self.inner.read_metadata(vol, name).await
    }
    async fn write_metadata(&self, vol: &str, name: &str, data: Bytes) -> lsvd_storage::Result<()> {
        self.inner.write_metadata(vol, name, data).await
    }
    async fn remove_segment(&self, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.remove_segment(seg).await
    }
}

#[tokio::test]
async fn reads_see_sealed_creator_while_flush_is_in_flight() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());
    let gated = Arc::new(GatedAccess {
        inner: Arc::new(ObjectStoreAccess::new(store)),
        hold: AtomicBool::new(true),
        gate: tokio::sync::Semaphore::new(0),
    });

    let disk = Arc::new(
        Disk::open(
            tmp.path(),
            DiskOptions {
                access: Some(gated.clone()),
                seq_gen: Some(counting_seq_gen(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap(),
    );

    let written = patterned(Extent::new(0, 8), 0x60);
    disk.write_extent(&written).await.unwrap();

    let closer = {
        let disk = disk.clone();
        tokio::spawn(async move { disk.close_segment().await })
    };

    // give the flush task time to reach the gated upload
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // the data lives only in the draining creator right now, and reads
    // still see it
    let data = disk.read_extent(Extent::new(0, 8)).await.unwrap();
    assert_eq!(data.as_slice(), written.as_slice());

    gated.hold.store(false, Ordering::SeqCst);
    gated.gate.add_permits(1);
    closer.await.unwrap().unwrap();

    // and identically once installed in the extent map
    let data = disk.read_extent(Extent::new(0, 8)).await.unwrap();
    assert_eq!(data.as_slice(), written.as_slice());
    assert_eq!(disk.map_len(), 1);
}

/// Fails the first `failures` uploads, then succeeds.
struct FlakyAccess {
    inner: Arc<dyn SegmentAccess>,
    failures: AtomicU64,
}

#[async_trait]
impl SegmentAccess for FlakyAccess {
    async fn init_container(&self) -> lsvd_storage::Result<()> {
        self.inner.init_container().await
    }
    async fn init_volume(&self, info: &VolumeInfo) -> lsvd_storage::Result<()> {
        self.inner.init_volume(info).await
    }
    async fn get_volume_info(&self, vol: &str) -> lsvd_storage::Result<Option<VolumeInfo>> {
        self.inner.get_volume_info(vol).await
    }
    async fn list_volumes(&self) -> lsvd_storage::Result<Vec<String>> {
        self.inner.list_volumes().await
    }
    async fn list_segments(&self, vol: &str) -> lsvd_storage::Result<Vec<SegmentId>> {
        self.inner.list_segments(vol).await
    }
    async fn append_to_objects(&self, vol: &str, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.append_to_objects(vol, seg).await
    }
    async fn remove_segment_from_volume(
        &self,
        vol: &str,
        seg: SegmentId,
    ) -> lsvd_storage::Result<()> {
        self.inner.remove_segment_from_volume(vol, seg).await
    }
    async fn open_segment(&self, seg: SegmentId) -> lsvd_storage::Result<Box<dyn SegmentReader>> {
        self.inner.open_segment(seg).await
    }
    async fn write_segment(&self, seg: SegmentId, data: Bytes) -> lsvd_storage::Result<()> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(lsvd_storage::Error::Corruption(
                "injected upload failure".to_string(),
            ));
        }
        self.inner.write_segment(seg, data).await
    }
    async fn read_metadata(&self, vol: &str, name: &str) -> lsvd_storage::Result<Option<Bytes>> {
        self.inner.read_metadata(vol, name).await
    }
    async fn write_metadata(&self, vol: &str, name: &str, data: Bytes) -> lsvd_storage::Result<()> {
        self.inner.write_metadata(vol, name, data).await
    }
    async fn remove_segment(&self, seg: SegmentId) -> lsvd_storage::Result<()> {
        self.inner.remove_segment(seg).await
    }
}

#[tokio::test(start_paused = true)]
async fn flush_retries_until_upload_succeeds() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());
    let flaky = Arc::new(FlakyAccess {
        inner: Arc::new(ObjectStoreAccess::new(store)),
        failures: AtomicU64::new(3),
    });

    let disk = Disk::open(
        tmp.path(),
        DiskOptions {
            access: Some(flaky.clone()),
            seq_gen: Some(counting_seq_gen(1)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let written = solid(Extent::new(0, 4), 0x42);
    disk.write_extent(&written).await.unwrap();

    // paused time auto-advances through the retry sleeps
    disk.close_segment().await.unwrap();

    assert_eq!(flaky.failures.load(Ordering::SeqCst), 0);
    let data = disk.read_extent(Extent::new(0, 4)).await.unwrap();
    assert_eq!(data.as_slice(), written.as_slice());
}

#[tokio::test]
async fn unknown_volume_without_auto_create_errors() {
    let tmp = TempDir::new().unwrap();

    let result = Disk::open(
        tmp.path(),
        DiskOptions {
            volume: "missing".to_string(),
            auto_create: false,
            ..Default::default()
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(lsvd_storage::Error::VolumeNotFound(v)) if v == "missing"
    ));
}

#[tokio::test]
async fn flush_threshold_seals_in_background() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemory::new());
    let access: Arc<dyn SegmentAccess> = Arc::new(ObjectStoreAccess::new(store));
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let flushed_cb = flushed.clone();

    let disk = Disk::open(
        tmp.path(),
        DiskOptions {
            access: Some(access),
            seq_gen: Some(counting_seq_gen(1)),
            // a few incompressible blocks are enough to cross this
            flush_threshold: 8 * BLOCK_SIZE as u64,
            after_flush: Some(Arc::new(move |seg| {
                flushed_cb.lock().unwrap().push(seg);
            })),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // 17 incompressible blocks: two threshold crossings plus a tail that
    // the final close_segment flushes (and waits for)
    for i in 0..17u64 {
        disk.write_extent(&noisy(Extent::new(i, 1), i)).await.unwrap();
    }
    disk.close_segment().await.unwrap();

    assert!(
        flushed.lock().unwrap().len() >= 2,
        "threshold crossings should have sealed extra segments"
    );

    for i in 0..17u64 {
        let data = disk.read_extent(Extent::new(i, 1)).await.unwrap();
        assert_eq!(data.as_slice(), noisy(Extent::new(i, 1), i).as_slice());
    }
}
