//! Segment identifiers and the segment header wire format.
//!
//! A segment is an immutable object: a header listing every stored extent,
//! followed by a body of raw or LZ4-compressed block data.
//!
//! ## Segment file structure
//!
//! ```text
//! +0  : u32 BE entry_count
//! +4  : u32 BE data_begin        // 8 + encoded size of the records
//! +8  : entry_count records:
//!         varint  lba
//!         u8      flags          // 0 Uncompressed, 1 Compressed, 2 Empty
//!         varint  size           // body bytes for this entry (0 if Empty)
//!         varint  offset         // body-relative
//!         varint  raw_size       // decompressed bytes
//!         varint  blocks
//! +db : body bytes, offset-indexed
//! ```
//!
//! The absolute body position of an entry is `data_begin + offset`. Records
//! always carry `raw_size` and `blocks`; there is no reduced layout.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::varint;

/// Identifier of one immutable segment: a 128-bit ULID.
///
/// ULIDs sort by creation time, so the natural ordering of ids is also the
/// age order of segments (newer ids compare greater).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(Ulid);

impl SegmentId {
    /// A fresh id from the current wall clock. Callers that need strict
    /// monotonicity within a millisecond use a `ulid::Generator` instead.
    pub fn generate() -> Self {
        SegmentId(Ulid::new())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SegmentId(Ulid::from_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(SegmentId)
            .map_err(|_| Error::InvalidSegmentId(s.to_string()))
    }
}

impl From<Ulid> for SegmentId {
    fn from(u: Ulid) -> Self {
        SegmentId(u)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

/// Storage class of one extent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockFlags {
    /// Raw block bytes, stored verbatim.
    Uncompressed = 0,
    /// LZ4 block compression; `raw_size` gives the decoded length.
    Compressed = 1,
    /// All-zero extent; no body bytes at all.
    Empty = 2,
}

impl BlockFlags {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BlockFlags::Uncompressed),
            1 => Ok(BlockFlags::Compressed),
            2 => Ok(BlockFlags::Empty),
            other => Err(Error::InvalidFlags(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One record in a segment header: where an extent's bytes live within the
/// segment body and how they are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    /// The extent as originally written.
    pub extent: Extent,
    pub flags: BlockFlags,
    /// Bytes occupied in the body. Zero iff `flags` is `Empty`.
    pub size: u32,
    /// Decompressed length: `extent.blocks * BLOCK_SIZE` when data exists.
    pub raw_size: u32,
    /// Byte offset of the data, relative to the start of the body.
    pub offset: u32,
}

impl ExtentHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        varint::encode_u64(buf, self.extent.lba);
        buf.put_u8(self.flags.as_u8());
        varint::encode_u64(buf, self.size as u64);
        varint::encode_u64(buf, self.offset as u64);
        varint::encode_u64(buf, self.raw_size as u64);
        varint::encode_u64(buf, self.extent.blocks as u64);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let lba = varint::decode_u64(buf)?;
        if !buf.has_remaining() {
            return Err(Error::TruncatedHeader);
        }
        let flags = BlockFlags::from_u8(buf.get_u8())?;
        let size = varint::decode_u64(buf)? as u32;
        let offset = varint::decode_u64(buf)? as u32;
        let raw_size = varint::decode_u64(buf)? as u32;
        let blocks = varint::decode_u64(buf)? as u32;

        Ok(ExtentHeader {
            extent: Extent::new(lba, blocks),
            flags,
            size,
            raw_size,
            offset,
        })
    }
}

/// The decoded header region of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub entries: Vec<ExtentHeader>,
    /// Byte position where the body starts; also the bias added to each
    /// record's body-relative offset to address into the object.
    pub data_begin: u32,
}

impl SegmentHeader {
    /// Build a header for `entries`, computing `data_begin` from their
    /// encoded size.
    pub fn from_entries(entries: Vec<ExtentHeader>) -> Self {
        let mut records = BytesMut::new();
        for entry in &entries {
            entry.encode(&mut records);
        }
        SegmentHeader {
            data_begin: 8 + records.len() as u32,
            entries,
        }
    }

    /// Serialize the full header region (fixed prefix plus records).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data_begin as usize);
        buf.put_u32(self.entries.len() as u32);
        buf.put_u32(self.data_begin);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Parse a header region. `buf` must hold at least `data_begin` bytes of
    /// the segment; trailing body bytes are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        if cursor.remaining() < 8 {
            return Err(Error::TruncatedHeader);
        }
        let entry_count = cursor.get_u32();
        let data_begin = cursor.get_u32();

        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(ExtentHeader::decode(&mut cursor)?);
        }

        Ok(SegmentHeader {
            entries,
            data_begin,
        })
    }
}

/// A fully resolved extent record: an [`ExtentHeader`] whose offset has been
/// rebased to the segment object, plus the owning segment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentLocation {
    /// The extent as originally written.
    pub extent: Extent,
    pub segment: SegmentId,
    pub flags: BlockFlags,
    /// Bytes occupied in the segment object.
    pub size: u32,
    /// Decompressed length of the stored data.
    pub raw_size: u32,
    /// Absolute byte offset within the segment object.
    pub offset: u32,
}

/// The unit of read resolution: the still-valid sub-range of a historical
/// write, after later overwrites clipped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialExtent {
    /// Sub-range of `loc.extent` that the extent map still considers live.
    pub partial: Extent,
    pub loc: ExtentLocation,
}

impl fmt::Display for PartialExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} {}:{}",
            self.partial, self.loc.extent, self.loc.segment, self.loc.offset, self.loc.size
        )
    }
}

/// Size and liveness accounting for one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Total object size: header plus body.
    pub total_bytes: u64,
    /// Body bytes actually holding data.
    pub used_bytes: u64,
    /// Blocks written into the segment when it was created.
    pub total_blocks: u32,
    /// Blocks still referenced by the extent map.
    pub live_blocks: u32,
}
