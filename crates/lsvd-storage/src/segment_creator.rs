//! The segment creator: the disk's journaled write cache.
//!
//! All writes land here first. Each accepted extent is compressed (or
//! elided, when it is all zeros) into an in-memory body buffer and described
//! by a header record; in parallel, every operation is appended to an
//! on-disk journal so a crash before flush loses nothing that was synced.
//!
//! When the body crosses the flush threshold the creator is sealed and
//! [`SegmentCreator::flush`] turns it into one immutable segment object:
//! `[header || body]` uploaded through [`SegmentAccess`], the segment id
//! appended to the volume's object index, and the journal deleted.
//!
//! ## Journal format
//!
//! One `writecache.<ULID>` file per creator; the ULID is the id the segment
//! will have once flushed. Records are length-prefixed and checksummed:
//!
//! ```text
//! ┌─────────────┬──────────┬────────┬──────────┬────────────┬──────────┐
//! │ Record Size │ CRC32    │ Opcode │ LBA      │ Blocks     │ Payload  │
//! │ (4 bytes)   │(4 bytes) │(1 byte)│(8 bytes) │ (4 bytes)  │(N bytes) │
//! └─────────────┴──────────┴────────┴──────────┴────────────┴──────────┘
//! ```
//!
//! `OP_WRITE` carries the raw extent bytes as payload; `OP_ZERO` carries
//! none. Replay re-runs the same buffering code the live path uses, so a
//! recovered creator is indistinguishable from one that never crashed.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use lsvd_core::{
    BlockFlags, Extent, ExtentHeader, ExtentLocation, RangeData, SegmentHeader, SegmentId,
    SegmentStats, BLOCK_SIZE,
};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::access::SegmentAccess;
use crate::error::{Error, Result};

const OP_WRITE: u8 = 1;
const OP_ZERO: u8 = 2;

/// Fixed journal record region before the payload: crc + op + lba + blocks.
const RECORD_FIXED: usize = 4 + 1 + 8 + 4;

/// Prefix of every journal file name; the rest is the segment ULID.
pub const JOURNAL_PREFIX: &str = "writecache.";

/// Accumulates writes for the segment that will become `id`.
pub struct SegmentCreator {
    id: SegmentId,
    journal_path: PathBuf,
    journal: File,

    entries: Vec<ExtentHeader>,
    body: BytesMut,

    total_blocks: u32,
    raw_bytes: u64,
}

impl SegmentCreator {
    /// Create a fresh creator with an empty journal in `dir`.
    pub async fn new(dir: &Path, id: SegmentId) -> Result<Self> {
        let journal_path = dir.join(format!("{JOURNAL_PREFIX}{id}"));
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await?;

        debug!(segment = %id, path = ?journal_path, "write cache journal opened");

        Ok(SegmentCreator {
            id,
            journal_path,
            journal,
            entries: Vec::new(),
            body: BytesMut::new(),
            total_blocks: 0,
            raw_bytes: 0,
        })
    }

    /// Rebuild a creator from an existing journal. Replays every record
    /// whose length and checksum verify; a torn tail is truncated away so
    /// the journal is clean for further appends.
    pub async fn replay(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(JOURNAL_PREFIX))
            .ok_or_else(|| Error::Corruption(format!("not a journal file: {}", path.display())))?;
        let id = SegmentId::parse(name)?;

        let data = tokio::fs::read(path).await?;

        let mut creator = SegmentCreator {
            id,
            journal_path: path.to_path_buf(),
            journal: OpenOptions::new().append(true).open(path).await?,
            entries: Vec::new(),
            body: BytesMut::new(),
            total_blocks: 0,
            raw_bytes: 0,
        };

        let mut pos = 0usize;
        let mut records = 0usize;
        loop {
            let Some(record) = valid_record(&data[pos..]) else {
                break;
            };

            match record.op {
                OP_WRITE => creator.buffer_write(record.extent, record.payload),
                OP_ZERO => creator.buffer_zero(record.extent),
                _ => break,
            }

            pos += 4 + 4 + 1 + 8 + 4 + record.payload.len();
            records += 1;
        }

        if pos < data.len() {
            warn!(
                segment = %id,
                valid = pos,
                total = data.len(),
                "truncating torn tail of write cache journal"
            );
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(pos as u64).await?;
            file.sync_all().await?;
        }

        info!(
            segment = %id,
            records,
            body_bytes = creator.body.len(),
            "write cache journal replayed"
        );

        Ok(creator)
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Bytes currently buffered in the body, excluding header records.
    pub fn body_size(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored bytes over raw bytes accepted. Below 1.0 means compression
    /// and zero elision are paying off.
    pub fn avg_storage_ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            return 0.0;
        }
        self.body.len() as f64 / self.raw_bytes as f64
    }

    /// Accept one extent of data: journal it, then buffer it.
    pub async fn write_extent(&mut self, data: &RangeData) -> Result<()> {
        self.journal_append(OP_WRITE, data.extent(), data.as_slice())
            .await?;
        self.buffer_write(data.extent(), data.as_slice());
        Ok(())
    }

    /// Record an extent as explicitly zero. No body bytes are consumed.
    pub async fn zero_blocks(&mut self, extent: Extent) -> Result<()> {
        self.journal_append(OP_ZERO, extent, &[]).await?;
        self.buffer_zero(extent);
        Ok(())
    }

    /// Fsync the journal.
    pub async fn sync(&mut self) -> Result<()> {
        self.journal.sync_all().await?;
        Ok(())
    }

    fn buffer_write(&mut self, extent: Extent, bytes: &[u8]) {
        self.total_blocks += extent.blocks;
        self.raw_bytes += bytes.len() as u64;

        if bytes.iter().all(|&b| b == 0) {
            self.entries.push(ExtentHeader {
                extent,
                flags: BlockFlags::Empty,
                size: 0,
                raw_size: bytes.len() as u32,
                offset: 0,
            });
            return;
        }

        let mut scratch = vec![0u8; lz4_flex::block::get_maximum_output_size(bytes.len())];
        let (flags, stored): (BlockFlags, &[u8]) =
            match lz4_flex::block::compress_into(bytes, &mut scratch) {
                Ok(n) if n < bytes.len() => (BlockFlags::Compressed, &scratch[..n]),
                _ => (BlockFlags::Uncompressed, bytes),
            };

        self.entries.push(ExtentHeader {
            extent,
            flags,
            size: stored.len() as u32,
            raw_size: bytes.len() as u32,
            offset: self.body.len() as u32,
        });
        self.body.extend_from_slice(stored);
    }

    fn buffer_zero(&mut self, extent: Extent) {
        self.total_blocks += extent.blocks;
        self.raw_bytes += extent.byte_len() as u64;
        self.entries.push(ExtentHeader {
            extent,
            flags: BlockFlags::Empty,
            size: 0,
            raw_size: extent.byte_len() as u32,
            offset: 0,
        });
    }

    async fn journal_append(&mut self, op: u8, extent: Extent, payload: &[u8]) -> Result<()> {
        let record_size = (RECORD_FIXED + payload.len()) as u32;

        let mut buf = Vec::with_capacity(4 + record_size as usize);
        buf.extend_from_slice(&record_size.to_le_bytes());

        let mut crc = crc32fast::Hasher::new();
        crc.update(&[op]);
        crc.update(&extent.lba.to_le_bytes());
        crc.update(&extent.blocks.to_le_bytes());
        crc.update(payload);
        buf.extend_from_slice(&crc.finalize().to_le_bytes());

        buf.push(op);
        buf.extend_from_slice(&extent.lba.to_le_bytes());
        buf.extend_from_slice(&extent.blocks.to_le_bytes());
        buf.extend_from_slice(payload);

        self.journal.write_all(&buf).await?;
        Ok(())
    }

    /// Serve whatever part of `rng` this creator holds, copying into `buf`
    /// (which covers exactly `rng`). Later records shadow earlier ones for
    /// overlapping blocks. Returns the sub-extents that were filled.
    pub fn fill_extent(&self, rng: Extent, buf: &mut [u8]) -> Result<Vec<Extent>> {
        if buf.len() != rng.byte_len() {
            return Err(Error::InternalRange(format!(
                "fill buffer for {rng} has {} bytes, expected {}",
                buf.len(),
                rng.byte_len()
            )));
        }

        let mut used = Vec::new();
        for entry in &self.entries {
            let Some(overlap) = Extent::clamp(&entry.extent, rng) else {
                continue;
            };

            let dst_start = (overlap.lba - rng.lba) as usize * BLOCK_SIZE;
            let dst = &mut buf[dst_start..dst_start + overlap.byte_len()];
            let src_start = (overlap.lba - entry.extent.lba) as usize * BLOCK_SIZE;

            match entry.flags {
                BlockFlags::Empty => dst.fill(0),
                BlockFlags::Uncompressed => {
                    let body_start = entry.offset as usize + src_start;
                    dst.copy_from_slice(&self.body[body_start..body_start + overlap.byte_len()]);
                }
                BlockFlags::Compressed => {
                    let comp =
                        &self.body[entry.offset as usize..(entry.offset + entry.size) as usize];
                    let mut cooked = vec![0u8; entry.raw_size as usize];
                    let n = lz4_flex::block::decompress_into(comp, &mut cooked)
                        .map_err(|e| Error::Decompression(e.to_string()))?;
                    if n != cooked.len() {
                        return Err(Error::Decompression(format!(
                            "buffered extent decoded to wrong size ({n} != {})",
                            cooked.len()
                        )));
                    }
                    dst.copy_from_slice(&cooked[src_start..src_start + overlap.byte_len()]);
                }
            }

            used.push(overlap);
        }

        Ok(used)
    }

    /// Turn the buffered writes into one immutable segment object.
    ///
    /// Serializes the header, uploads `[header || body]`, appends the id to
    /// the volume's object index, and deletes the journal. Returns the
    /// entry locations (with offsets rebased to the object) for the extent
    /// map, plus the segment's stats.
    pub async fn flush(
        &self,
        access: &dyn SegmentAccess,
        volume: &str,
    ) -> Result<(Vec<ExtentLocation>, SegmentStats)> {
        let header = SegmentHeader::from_entries(self.entries.clone());
        let header_bytes = header.encode();
        let data_begin = header.data_begin;

        let mut object = BytesMut::with_capacity(header_bytes.len() + self.body.len());
        object.extend_from_slice(&header_bytes);
        object.extend_from_slice(&self.body);
        let object: Bytes = object.freeze();
        let total_bytes = object.len() as u64;

        access.write_segment(self.id, object).await?;
        access.append_to_objects(volume, self.id).await?;

        if let Err(e) = tokio::fs::remove_file(&self.journal_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let locations = self
            .entries
            .iter()
            .map(|entry| ExtentLocation {
                extent: entry.extent,
                segment: self.id,
                flags: entry.flags,
                size: entry.size,
                raw_size: entry.raw_size,
                offset: data_begin + entry.offset,
            })
            .collect();

        let stats = SegmentStats {
            total_bytes,
            used_bytes: self.body.len() as u64,
            total_blocks: self.total_blocks,
            live_blocks: 0,
        };

        Ok((locations, stats))
    }
}

struct JournalRecord<'a> {
    op: u8,
    extent: Extent,
    payload: &'a [u8],
}

/// Parse one record from the front of `data`, returning `None` for anything
/// torn or corrupt (short length, bad CRC, payload not matching the extent).
fn valid_record(data: &[u8]) -> Option<JournalRecord<'_>> {
    if data.len() < 4 {
        return None;
    }
    let record_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if record_size < RECORD_FIXED || data.len() < 4 + record_size {
        return None;
    }

    let record = &data[4..4 + record_size];
    let stored_crc = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    if crc32fast::hash(&record[4..]) != stored_crc {
        return None;
    }

    let op = record[4];
    let lba = u64::from_le_bytes(record[5..13].try_into().ok()?);
    let blocks = u32::from_le_bytes(record[13..17].try_into().ok()?);
    let payload = &record[17..];
    let extent = Extent::new(lba, blocks);

    match op {
        OP_WRITE if payload.len() == extent.byte_len() => {}
        OP_ZERO if payload.is_empty() => {}
        _ => return None,
    }

    Some(JournalRecord {
        op,
        extent,
        payload,
    })
}
