//! Block-aligned byte buffers tied to an extent.
//!
//! A [`RangeData`] is the unit moved through the read and write paths: an
//! extent plus exactly `blocks * BLOCK_SIZE` bytes backing it. Sub-slicing
//! by extent keeps all of the LBA-to-byte-offset arithmetic in one place, so
//! callers copy between ranges without re-deriving offsets.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::BLOCK_SIZE;

/// An extent together with the bytes for each of its blocks.
#[derive(Clone)]
pub struct RangeData {
    extent: Extent,
    data: BytesMut,
}

impl RangeData {
    /// A zero-filled range covering `extent`. Read destinations start here
    /// so unwritten holes come back as zeros without extra work.
    pub fn zeroed(extent: Extent) -> Self {
        RangeData {
            extent,
            data: BytesMut::zeroed(extent.byte_len()),
        }
    }

    /// Wrap caller-provided bytes. The buffer must be exactly
    /// `extent.blocks * BLOCK_SIZE` long.
    pub fn from_bytes(extent: Extent, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = bytes.as_ref();
        if bytes.len() != extent.byte_len() {
            return Err(Error::RangeSize {
                extent,
                expected: extent.byte_len(),
                actual: bytes.len(),
            });
        }
        Ok(RangeData {
            extent,
            data: BytesMut::from(bytes),
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when every byte in the range is zero.
    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes of block `i` within the extent.
    pub fn block(&self, i: u32) -> &[u8] {
        let start = i as usize * BLOCK_SIZE;
        &self.data[start..start + BLOCK_SIZE]
    }

    /// The bytes covering `sub`, which must lie entirely within the range.
    pub fn slice(&self, sub: Extent) -> Option<&[u8]> {
        let (start, len) = self.sub_bounds(sub)?;
        Some(&self.data[start..start + len])
    }

    /// Mutable bytes covering `sub`, which must lie entirely within the
    /// range.
    pub fn slice_mut(&mut self, sub: Extent) -> Option<&mut [u8]> {
        let (start, len) = self.sub_bounds(sub)?;
        Some(&mut self.data[start..start + len])
    }

    fn sub_bounds(&self, sub: Extent) -> Option<(usize, usize)> {
        if sub.is_empty() || sub.lba < self.extent.lba || sub.end() > self.extent.end() {
            return None;
        }
        let start = (sub.lba - self.extent.lba) as usize * BLOCK_SIZE;
        Some((start, sub.byte_len()))
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

impl std::fmt::Debug for RangeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RangeData({}, {} bytes)", self.extent, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_is_all_zero() {
        let rd = RangeData::zeroed(Extent::new(4, 3));
        assert_eq!(rd.len(), 3 * BLOCK_SIZE);
        assert!(rd.is_all_zero());
    }

    #[test]
    fn from_bytes_validates_length() {
        let ext = Extent::new(0, 2);
        assert!(RangeData::from_bytes(ext, vec![0u8; 2 * BLOCK_SIZE]).is_ok());
        assert!(matches!(
            RangeData::from_bytes(ext, vec![0u8; BLOCK_SIZE]),
            Err(Error::RangeSize { .. })
        ));
    }

    #[test]
    fn slice_maps_lba_to_bytes() {
        let ext = Extent::new(10, 4);
        let mut rd = RangeData::zeroed(ext);
        rd.slice_mut(Extent::new(11, 2)).unwrap().fill(0xAB);

        assert_eq!(rd.block(0), &[0u8; BLOCK_SIZE]);
        assert_eq!(rd.block(1), &[0xABu8; BLOCK_SIZE]);
        assert_eq!(rd.block(2), &[0xABu8; BLOCK_SIZE]);
        assert_eq!(rd.block(3), &[0u8; BLOCK_SIZE]);

        assert_eq!(
            rd.slice(Extent::new(11, 1)).unwrap(),
            &[0xABu8; BLOCK_SIZE][..]
        );
    }

    #[test]
    fn slice_rejects_out_of_range() {
        let rd = RangeData::zeroed(Extent::new(10, 4));
        assert!(rd.slice(Extent::new(9, 2)).is_none());
        assert!(rd.slice(Extent::new(13, 2)).is_none());
        assert!(rd.slice(Extent::new(11, 0)).is_none());
        assert!(rd.slice(Extent::new(10, 4)).is_some());
    }
}
