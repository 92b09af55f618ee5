//! Crash recovery: journal replay and LBA-map restoration.
//!
//! Opening a disk reconstructs state in three steps:
//!
//! 1. Replay every `writecache.<ULID>` journal in the disk directory, in id
//!    (chronological) order. The newest becomes the current creator; older
//!    ones are sealed writes that never flushed and get published as
//!    segments during open.
//! 2. Load the serialized LBA map persisted by the last clean close. A
//!    missing or unreadable map is not fatal.
//! 3. Failing that, rebuild the map by listing the volume's segments and
//!    re-installing each header, oldest first, exactly as the original
//!    flushes did.

use std::path::{Path, PathBuf};

use lsvd_core::{ExtentLocation, SegmentHeader, SegmentStats};
use tracing::{info, warn};

use crate::disk::Shared;
use crate::error::{Error, Result};
use crate::extent_map::ExtentMap;
use crate::segment_creator::{SegmentCreator, JOURNAL_PREFIX};

/// Name of the metadata blob holding the serialized extent map.
const LBA_MAP_BLOB: &str = "lbamap";

/// Replay all write-cache journals under `path`, oldest first.
pub(crate) async fn restore_write_cache(path: &Path) -> Result<Vec<SegmentCreator>> {
    let mut journals: Vec<PathBuf> = Vec::new();

    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(JOURNAL_PREFIX) && entry.file_type().await?.is_file() {
            journals.push(entry.path());
        }
    }

    // ULID strings are fixed-length Crockford base32, so filename order is
    // creation order
    journals.sort();

    let mut creators = Vec::with_capacity(journals.len());
    for journal in journals {
        creators.push(SegmentCreator::replay(&journal).await?);
    }

    if !creators.is_empty() {
        info!(journals = creators.len(), "restored write cache journals");
    }

    Ok(creators)
}

/// Load the persisted LBA map, if one exists and is intact. Restores the
/// segment registry's liveness counts from the map contents.
pub(crate) async fn load_lba_map(shared: &Shared) -> Result<bool> {
    let Some(bytes) = shared
        .access
        .read_metadata(&shared.volume, LBA_MAP_BLOB)
        .await?
    else {
        return Ok(false);
    };

    let map = match ExtentMap::deserialize(&bytes) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "discarding unreadable LBA map, will rebuild");
            return Ok(false);
        }
    };

    for pe in map.iter() {
        shared.segments.restore(pe.loc.segment);
        shared.segments.add_live(pe.loc.segment, pe.partial.blocks);
    }

    *shared.map.write().unwrap() = map;
    Ok(true)
}

/// Persist the LBA map for fast restart.
pub(crate) async fn save_lba_map(shared: &Shared) -> Result<()> {
    let bytes = shared.map.read().unwrap().serialize();
    info!(bytes = bytes.len(), "saving LBA map");
    shared
        .access
        .write_metadata(&shared.volume, LBA_MAP_BLOB, bytes)
        .await
}

/// Rebuild the LBA map by replaying every segment header in creation order.
pub(crate) async fn rebuild_from_segments(shared: &Shared) -> Result<()> {
    let segments = shared.access.list_segments(&shared.volume).await?;
    info!(segments = segments.len(), "rebuilding LBA map from segments");

    for seg in segments {
        let reader = shared.access.open_segment(seg).await?;

        let mut prefix = [0u8; 8];
        let n = reader.read_at(&mut prefix, 0).await?;
        if n != 8 {
            return Err(Error::Corruption(format!(
                "segment {seg} too short for a header"
            )));
        }

        let data_begin =
            u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        if data_begin < 8 {
            return Err(Error::Corruption(format!(
                "segment {seg} has invalid data_begin {data_begin}"
            )));
        }

        let mut header = vec![0u8; data_begin];
        header[..8].copy_from_slice(&prefix);
        if data_begin > 8 {
            let n = reader.read_at(&mut header[8..], 8).await?;
            if n != data_begin - 8 {
                return Err(Error::Corruption(format!(
                    "segment {seg} header truncated ({n} of {} bytes)",
                    data_begin - 8
                )));
            }
        }

        let parsed = SegmentHeader::parse(&header)?;

        let total_blocks: u32 = parsed.entries.iter().map(|e| e.extent.blocks).sum();
        let body_bytes: u64 = parsed.entries.iter().map(|e| e.size as u64).sum();

        let locations: Vec<ExtentLocation> = parsed
            .entries
            .iter()
            .map(|entry| ExtentLocation {
                extent: entry.extent,
                segment: seg,
                flags: entry.flags,
                size: entry.size,
                raw_size: entry.raw_size,
                offset: parsed.data_begin + entry.offset,
            })
            .collect();

        shared.segments.create(
            seg,
            SegmentStats {
                total_bytes: data_begin as u64 + body_bytes,
                used_bytes: body_bytes,
                total_blocks,
                live_blocks: 0,
            },
        );
        {
            let mut map = shared.map.write().unwrap();
            map.update_batch(&locations, seg, &shared.segments);
        }
        shared.segments.mark_installed(seg);
    }

    Ok(())
}
