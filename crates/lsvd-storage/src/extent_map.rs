//! The LBA-to-physical extent map.
//!
//! An ordered mapping from logical block ranges to the segment locations
//! holding their data. Keys are the start LBA of each entry's *partial*
//! extent; values are [`PartialExtent`]s. The map maintains one invariant
//! above all: no two entries' partial extents overlap. Installing a new
//! write clips or removes whatever it shadows, and every block clipped away
//! is reported to the segment registry so liveness accounting stays exact.
//!
//! A `BTreeMap` gives ordered iteration and `O(log n)` seek; the non-trivial
//! part is the overlap resolution, not the container.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lsvd_core::{varint, BlockFlags, Extent, ExtentLocation, Lba, PartialExtent, SegmentId};
use tracing::trace;

use crate::error::{Error, Result};
use crate::segments::Segments;

const LBA_MAP_MAGIC: u32 = 0x4C4D_4150; // "LMAP"
const LBA_MAP_VERSION: u16 = 2;

/// Ordered mapping of live partial extents, keyed by their start LBA.
#[derive(Debug, Default)]
pub struct ExtentMap {
    entries: BTreeMap<Lba, PartialExtent>,
}

impl ExtentMap {
    pub fn new() -> Self {
        ExtentMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install `pe`, clipping or removing any entries its partial extent
    /// overlaps. Blocks clipped from existing entries are charged against
    /// their owning segments in `segments`.
    pub fn update(&mut self, pe: PartialExtent, segments: &Segments) {
        let rng = pe.partial;

        let mut affected: Vec<Lba> = Vec::new();
        if let Some((&key, existing)) = self.entries.range(..rng.lba).next_back() {
            if existing.partial.end() > rng.lba {
                affected.push(key);
            }
        }
        affected.extend(self.entries.range(rng.lba..rng.end()).map(|(&k, _)| k));

        for key in affected {
            let Some(old) = self.entries.remove(&key) else {
                continue;
            };

            let residuals = old.partial.sub(rng);
            let kept: u32 = residuals.iter().map(|r| r.blocks).sum();
            let clipped = old.partial.blocks - kept;

            trace!(
                entry = %old.partial,
                overlap = %rng,
                clipped,
                "clipping shadowed extent"
            );

            segments.remove_live(old.loc.segment, clipped);

            for residual in residuals {
                self.entries.insert(
                    residual.lba,
                    PartialExtent {
                        partial: residual,
                        loc: old.loc,
                    },
                );
            }
        }

        self.entries.insert(rng.lba, pe);
    }

    /// Install one flushed segment's entries, in the order they appear in
    /// the segment. Each inserted extent adds to `seg`'s live-block count;
    /// each clipped extent is charged against its owner.
    ///
    /// Callers hold this as one critical section so readers never observe a
    /// partially installed segment.
    pub fn update_batch(&mut self, entries: &[ExtentLocation], seg: SegmentId, segments: &Segments) {
        for loc in entries {
            let pe = PartialExtent {
                partial: loc.extent,
                loc: *loc,
            };
            self.update(pe, segments);
            segments.add_live(seg, loc.extent.blocks);
        }
    }

    /// The partial extents intersecting `rng`, in ascending LBA order, each
    /// clamped to `rng`. Gaps are simply absent: unwritten space never
    /// produces an entry.
    pub fn resolve(&self, rng: Extent) -> Vec<PartialExtent> {
        let mut out = Vec::new();

        if let Some((_, prev)) = self.entries.range(..rng.lba).next_back() {
            if let Some(clamped) = Extent::clamp(&prev.partial, rng) {
                out.push(PartialExtent {
                    partial: clamped,
                    loc: prev.loc,
                });
            }
        }

        for (_, pe) in self.entries.range(rng.lba..rng.end()) {
            if let Some(clamped) = Extent::clamp(&pe.partial, rng) {
                out.push(PartialExtent {
                    partial: clamped,
                    loc: pe.loc,
                });
            }
        }

        out
    }

    /// Iterate all live entries in LBA order.
    pub fn iter(&self) -> impl Iterator<Item = &PartialExtent> {
        self.entries.values()
    }

    /// Serialize the map for fast restart.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(LBA_MAP_MAGIC);
        buf.put_u16(LBA_MAP_VERSION);
        varint::encode_u64(&mut buf, self.entries.len() as u64);

        for pe in self.entries.values() {
            varint::encode_u64(&mut buf, pe.partial.lba);
            varint::encode_u64(&mut buf, pe.partial.blocks as u64);
            varint::encode_u64(&mut buf, pe.loc.extent.lba);
            varint::encode_u64(&mut buf, pe.loc.extent.blocks as u64);
            buf.put_slice(&pe.loc.segment.to_bytes());
            buf.put_u8(pe.loc.flags.as_u8());
            varint::encode_u64(&mut buf, pe.loc.size as u64);
            varint::encode_u64(&mut buf, pe.loc.raw_size as u64);
            varint::encode_u64(&mut buf, pe.loc.offset as u64);
        }

        buf.freeze()
    }

    /// Reload a serialized map, validating version and ordering.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        if buf.remaining() < 6 {
            return Err(Error::Corruption("LBA map too short".to_string()));
        }
        let magic = buf.get_u32();
        if magic != LBA_MAP_MAGIC {
            return Err(Error::Corruption(format!("bad LBA map magic: {magic:#x}")));
        }
        let version = buf.get_u16();
        if version != LBA_MAP_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported LBA map version: {version}"
            )));
        }

        let count = varint::decode_u64(&mut buf)?;

        let mut entries = BTreeMap::new();
        let mut prev_end: Lba = 0;
        for _ in 0..count {
            let partial = Extent::new(
                varint::decode_u64(&mut buf)?,
                varint::decode_u64(&mut buf)? as u32,
            );
            let full = Extent::new(
                varint::decode_u64(&mut buf)?,
                varint::decode_u64(&mut buf)? as u32,
            );

            if buf.remaining() < 17 {
                return Err(Error::Corruption("truncated LBA map entry".to_string()));
            }
            let mut id = [0u8; 16];
            buf.copy_to_slice(&mut id);
            let segment = SegmentId::from_bytes(id);
            let flags = BlockFlags::from_u8(buf.get_u8())?;
            let size = varint::decode_u64(&mut buf)? as u32;
            let raw_size = varint::decode_u64(&mut buf)? as u32;
            let offset = varint::decode_u64(&mut buf)? as u32;

            if partial.lba < prev_end {
                return Err(Error::Corruption(format!(
                    "LBA map entries overlap at {partial}"
                )));
            }
            prev_end = partial.end();

            entries.insert(
                partial.lba,
                PartialExtent {
                    partial,
                    loc: ExtentLocation {
                        extent: full,
                        segment,
                        flags,
                        size,
                        raw_size,
                        offset,
                    },
                },
            );
        }

        Ok(ExtentMap { entries })
    }
}
