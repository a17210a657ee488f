//! Chunked range migration between two partition copies.
//!
//! ```text
//! source                      destination
//!   │  scan [start, end] ≤ chunk  │
//!   │ ──────────────────────────▶ │ insert_many (LWW)
//!   │                             │ verify every copied (key, seq) is present
//!   │ ◀────────────────────────── │
//!   │  delete copied keys         │
//!   ▼  repeat until empty         ▼
//! ```
//!
//! Rows leave the source only after the destination holds them, so an
//! interrupted migration is resumed by calling [`migrate_range`] again: rows
//! already copied but not yet deleted are re-inserted as no-ops.

use super::PartitionStore;
use crate::error::{Error, Result};
use crate::types::{Key, Location, Record};
use crc::{Crc, CRC_32_ISCSI};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Outcome of a completed migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Records copied to the destination.
    pub copied: u64,
    /// Records deleted from the source.
    pub deleted: u64,
    /// Chunks processed.
    pub chunks: u64,
}

/// Count and CRC-32 over the `(key, seq, payload)` triples of a key range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeDigest {
    /// Records in the range.
    pub count: u64,
    /// Checksum in key order.
    pub checksum: u32,
}

/// Move every record in `[start, end]` from `source` to `destination`.
pub async fn migrate_range(
    store: &dyn PartitionStore,
    source: &Location,
    destination: &Location,
    start: Key,
    end: Key,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    let chunk_size = chunk_size.max(1);

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let chunk = store.scan_range(source, start, end, chunk_size).await?;
        if chunk.is_empty() {
            break;
        }
        let keys: Vec<Key> = chunk.iter().map(|r| r.key).collect();

        store.insert_many(destination, chunk.clone()).await?;
        verify_chunk(store, destination, &chunk).await?;

        let deleted = store.delete_keys(source, &keys).await?;
        if deleted == 0 {
            return Err(Error::TransientStore {
                location: source.clone(),
                reason: "migrated chunk was not deleted from source".into(),
            });
        }

        report.copied += chunk.len() as u64;
        report.deleted += deleted as u64;
        report.chunks += 1;
        tracing::debug!(
            source = %source,
            destination = %destination,
            chunk = report.chunks,
            records = chunk.len(),
            "Migrated chunk"
        );
    }

    Ok(report)
}

/// Confirm the destination holds every record of `chunk`, or a newer version.
async fn verify_chunk(
    store: &dyn PartitionStore,
    destination: &Location,
    chunk: &[Record],
) -> Result<()> {
    let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
        return Ok(());
    };
    let held: HashMap<Key, u64> = store
        .scan_range(destination, first.key, last.key, usize::MAX)
        .await?
        .into_iter()
        .map(|r| (r.key, r.seq))
        .collect();

    let missing = chunk
        .iter()
        .filter(|r| held.get(&r.key).map_or(true, |seq| *seq < r.seq))
        .count();
    if missing > 0 {
        return Err(Error::TransientStore {
            location: destination.clone(),
            reason: format!("{} migrated records not confirmed at destination", missing),
        });
    }
    Ok(())
}

/// Compute the digest of `[start, end]` at `location`, reading in chunks.
pub async fn range_checksum(
    store: &dyn PartitionStore,
    location: &Location,
    start: Key,
    end: Key,
    chunk_size: usize,
) -> Result<RangeDigest> {
    let mut digest = CRC32.digest();
    let mut count = 0u64;
    let mut cursor = start;

    loop {
        let chunk = store
            .scan_range(location, cursor, end, chunk_size.max(1))
            .await?;
        let Some(last) = chunk.last().map(|r| r.key) else {
            break;
        };
        for record in &chunk {
            digest.update(&record.key.to_be_bytes());
            digest.update(&record.seq.to_be_bytes());
            digest.update(&record.payload);
        }
        count += chunk.len() as u64;
        if last >= end {
            break;
        }
        cursor = last + 1;
    }

    Ok(RangeDigest {
        count,
        checksum: digest.finalize(),
    })
}
