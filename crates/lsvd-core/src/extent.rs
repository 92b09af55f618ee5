//! Extent algebra over the logical block address space.
//!
//! An [`Extent`] is a contiguous half-open run of blocks
//! `[lba, lba + blocks)`. The write cache, the extent map, and the read path
//! all reason about overlap exclusively through the operations here:
//! [`Extent::cover`] classifies how two extents relate, [`Extent::clamp`]
//! intersects them, and [`Extent::sub`]/[`Extent::sub_many`] carve holes out
//! of a range. Zero-block extents never participate: they are treated as
//! disjoint from everything, including themselves.

use std::fmt;

/// Logical block address: an index into the virtual disk's block space.
pub type Lba = u64;

/// A contiguous run of `blocks` device blocks starting at `lba`.
///
/// Ordering is by start address, then by length, which makes a sorted
/// sequence of extents iterate in disk order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    pub lba: Lba,
    pub blocks: u32,
}

/// How one extent relates to another. Returned by [`Extent::cover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cover {
    /// The extents are identical.
    Exact,
    /// The receiver fully contains the argument (and they differ).
    SuperRange,
    /// The extents overlap but neither contains the other.
    Partly,
    /// The extents share no blocks.
    None,
}

impl Extent {
    pub const fn new(lba: Lba, blocks: u32) -> Self {
        Extent { lba, blocks }
    }

    /// First block past the end of the extent.
    pub fn end(&self) -> Lba {
        self.lba + self.blocks as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks == 0
    }

    /// Total bytes the extent spans.
    pub fn byte_len(&self) -> usize {
        self.blocks as usize * crate::BLOCK_SIZE
    }

    /// Classify how `self` relates to `other`.
    pub fn cover(&self, other: Extent) -> Cover {
        if self.is_empty() || other.is_empty() {
            return Cover::None;
        }
        if *self == other {
            return Cover::Exact;
        }
        if other.end() <= self.lba || self.end() <= other.lba {
            return Cover::None;
        }
        if self.lba <= other.lba && other.end() <= self.end() {
            Cover::SuperRange
        } else {
            Cover::Partly
        }
    }

    /// Intersection of the two extents, or `None` when they are disjoint.
    pub fn clamp(&self, other: Extent) -> Option<Extent> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let start = self.lba.max(other.lba);
        let end = self.end().min(other.end());
        if start >= end {
            return None;
        }
        Some(Extent::new(start, (end - start) as u32))
    }

    /// `self` minus `other`: the zero, one, or two pieces of `self` that do
    /// not overlap `other`, in ascending order.
    pub fn sub(&self, other: Extent) -> Vec<Extent> {
        let Some(overlap) = self.clamp(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(2);
        if overlap.lba > self.lba {
            out.push(Extent::new(self.lba, (overlap.lba - self.lba) as u32));
        }
        if overlap.end() < self.end() {
            out.push(Extent::new(
                overlap.end(),
                (self.end() - overlap.end()) as u32,
            ));
        }
        out
    }

    /// `self` minus the union of `subs`, independent of their order. The
    /// result is the sorted list of holes left over.
    pub fn sub_many(&self, subs: &[Extent]) -> Vec<Extent> {
        let mut sorted = subs.to_vec();
        sorted.sort();

        let mut holes = vec![*self];
        for s in sorted {
            let mut next = Vec::with_capacity(holes.len() + 1);
            for h in holes {
                next.extend(h.sub(s));
            }
            holes = next;
        }
        holes
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lba, self.blocks)
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({}:{})", self.lba, self.blocks)
    }
}
