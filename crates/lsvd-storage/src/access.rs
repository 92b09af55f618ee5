//! The segment access port: how the disk talks to blob storage.
//!
//! [`SegmentAccess`] abstracts everything the engine needs from an object
//! store: immutable segment objects under `objects/`, a per-volume object
//! index at `volumes/<vol>/objects` (16-byte segment ids concatenated in
//! creation order), and named metadata blobs at `volumes/<vol>/<name>`.
//!
//! [`ObjectStoreAccess`] is the one implementation, layered on the
//! `object_store` crate so the same code serves a local directory and any
//! S3-compatible endpoint. The index has append-only semantics at this
//! layer: appends and removals re-upload the whole (small) blob.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use lsvd_core::SegmentId;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Identity and size of one volume, stored as the `info` metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// Read handle for one immutable segment object.
#[async_trait]
pub trait SegmentReader: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`, returning how
    /// many bytes were actually available. Segments are immutable, so a
    /// short count means the request was wrong or the object is damaged.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Read `comp_size` compressed bytes at `offset` and LZ4-decode them
    /// into `dst`, which must be sized to the decoded length.
    async fn read_at_compressed(&self, dst: &mut [u8], offset: u64, comp_size: u32)
        -> Result<usize>;
}

/// Port to the backing object store.
#[async_trait]
pub trait SegmentAccess: Send + Sync {
    /// Idempotent setup of the storage root.
    async fn init_container(&self) -> Result<()>;

    /// Idempotent volume creation.
    async fn init_volume(&self, info: &VolumeInfo) -> Result<()>;

    /// Volume info, or `None` when the volume does not exist.
    async fn get_volume_info(&self, vol: &str) -> Result<Option<VolumeInfo>>;

    async fn list_volumes(&self) -> Result<Vec<String>>;

    /// Segment ids in the volume's object index, in creation order.
    async fn list_segments(&self, vol: &str) -> Result<Vec<SegmentId>>;

    /// Append one segment id to the volume's object index.
    async fn append_to_objects(&self, vol: &str, seg: SegmentId) -> Result<()>;

    /// Remove one segment id from the volume's object index.
    async fn remove_segment_from_volume(&self, vol: &str, seg: SegmentId) -> Result<()>;

    /// Open a reader for a segment object. Errors if the object is missing.
    async fn open_segment(&self, seg: SegmentId) -> Result<Box<dyn SegmentReader>>;

    /// Upload a complete segment object. Durable when this returns.
    async fn write_segment(&self, seg: SegmentId, data: Bytes) -> Result<()>;

    /// Named metadata blob for a volume, or `None` when absent.
    async fn read_metadata(&self, vol: &str, name: &str) -> Result<Option<Bytes>>;

    async fn write_metadata(&self, vol: &str, name: &str, data: Bytes) -> Result<()>;

    /// Permanently delete a segment object.
    async fn remove_segment(&self, seg: SegmentId) -> Result<()>;
}

fn segment_key(seg: SegmentId) -> Path {
    Path::from(format!("objects/object.{seg}"))
}

fn volume_key(vol: &str, name: &str) -> Path {
    Path::from(format!("volumes/{vol}/{name}"))
}

/// [`SegmentAccess`] over any `object_store` backend.
pub struct ObjectStoreAccess {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreAccess {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        ObjectStoreAccess { store }
    }

    /// Backend rooted at a local directory, created if missing.
    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(ObjectStoreAccess {
            store: Arc::new(store),
        })
    }

    async fn read_blob(&self, key: &Path) -> Result<Option<Bytes>> {
        match self.store.get(key).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn encode_index(segments: &[SegmentId]) -> Bytes {
        let mut buf = BytesMut::with_capacity(segments.len() * 16);
        for seg in segments {
            buf.extend_from_slice(&seg.to_bytes());
        }
        buf.freeze()
    }
}

#[async_trait]
impl SegmentAccess for ObjectStoreAccess {
    async fn init_container(&self) -> Result<()> {
        Ok(())
    }

    async fn init_volume(&self, info: &VolumeInfo) -> Result<()> {
        let body = serde_json::to_vec(info)?;
        self.store
            .put(&volume_key(&info.name, "info"), Bytes::from(body))
            .await?;
        Ok(())
    }

    async fn get_volume_info(&self, vol: &str) -> Result<Option<VolumeInfo>> {
        match self.read_blob(&volume_key(vol, "info")).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<String>> {
        let prefix = Path::from("volumes");
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix)).try_collect().await?;

        let mut names = BTreeSet::new();
        for meta in metas {
            if let Some(part) = meta.location.parts().nth(1) {
                names.insert(part.as_ref().to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn list_segments(&self, vol: &str) -> Result<Vec<SegmentId>> {
        let Some(bytes) = self.read_blob(&volume_key(vol, "objects")).await? else {
            return Ok(Vec::new());
        };

        if bytes.len() % 16 != 0 {
            return Err(Error::Corruption(format!(
                "volume {vol} object index has odd length {}",
                bytes.len()
            )));
        }

        Ok(bytes
            .chunks_exact(16)
            .map(|chunk| {
                let mut id = [0u8; 16];
                id.copy_from_slice(chunk);
                SegmentId::from_bytes(id)
            })
            .collect())
    }

    async fn append_to_objects(&self, vol: &str, seg: SegmentId) -> Result<()> {
        let mut segments = self.list_segments(vol).await?;
        segments.push(seg);
        self.store
            .put(&volume_key(vol, "objects"), Self::encode_index(&segments))
            .await?;
        Ok(())
    }

    async fn remove_segment_from_volume(&self, vol: &str, seg: SegmentId) -> Result<()> {
        let mut segments = self.list_segments(vol).await?;
        segments.retain(|&s| s != seg);
        self.store
            .put(&volume_key(vol, "objects"), Self::encode_index(&segments))
            .await?;
        Ok(())
    }

    async fn open_segment(&self, seg: SegmentId) -> Result<Box<dyn SegmentReader>> {
        let key = segment_key(seg);
        // fail fast on a dangling reference instead of on the first read
        self.store.head(&key).await?;

        Ok(Box::new(ObjectSegmentReader {
            store: self.store.clone(),
            key,
        }))
    }

    async fn write_segment(&self, seg: SegmentId, data: Bytes) -> Result<()> {
        let key = segment_key(seg);
        debug!(segment = %seg, bytes = data.len(), "uploading segment");
        self.store.put(&key, data).await?;
        Ok(())
    }

    async fn read_metadata(&self, vol: &str, name: &str) -> Result<Option<Bytes>> {
        self.read_blob(&volume_key(vol, name)).await
    }

    async fn write_metadata(&self, vol: &str, name: &str, data: Bytes) -> Result<()> {
        self.store.put(&volume_key(vol, name), data).await?;
        Ok(())
    }

    async fn remove_segment(&self, seg: SegmentId) -> Result<()> {
        self.store.delete(&segment_key(seg)).await?;
        Ok(())
    }
}

struct ObjectSegmentReader {
    store: Arc<dyn ObjectStore>,
    key: Path,
}

#[async_trait]
impl SegmentReader for ObjectSegmentReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let start = offset as usize;
        let data = self.store.get_range(&self.key, start..start + buf.len()).await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn read_at_compressed(
        &self,
        dst: &mut [u8],
        offset: u64,
        comp_size: u32,
    ) -> Result<usize> {
        let mut comp = vec![0u8; comp_size as usize];
        let n = self.read_at(&mut comp, offset).await?;
        if n != comp.len() {
            return Err(Error::ShortRead {
                expected: comp.len(),
                actual: n,
            });
        }

        let decoded = lz4_flex::block::decompress_into(&comp, dst)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        if decoded != dst.len() {
            return Err(Error::Decompression(format!(
                "compressed extent decoded to wrong size ({decoded} != {})",
                dst.len()
            )));
        }
        Ok(decoded)
    }
}
