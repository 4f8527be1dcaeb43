//! Per-source-segment patch writer.
//!
//! While a segment is being built, updates to documents of older, sealed
//! segments are routed here. [`PatchWriter`] keeps one
//! [`ShardedUpdateBuffer`] per destination segment, created on the first update
//! that targets it, and dumps them all when the building segment is sealed.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::error::Result;
use crate::lexical::SegmentId;
use crate::lexical::config::PatchCompression;
use crate::lexical::core::doc_delta::DocId;
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::buffer::{PatchFileInfo, ShardedUpdateBuffer, UpdateOutcome};
use crate::storage::Storage;

/// Update buffers of one (index, source segment), keyed by destination segment.
#[derive(Debug)]
pub struct PatchWriter {
    index_name: String,
    src_segment: SegmentId,
    shard_count: u32,
    compression: PatchCompression,
    buffers: RwLock<BTreeMap<SegmentId, Arc<ShardedUpdateBuffer>>>,
}

impl PatchWriter {
    /// Create a writer for updates recorded by `src_segment`.
    pub fn new(
        index_name: impl Into<String>,
        src_segment: SegmentId,
        shard_count: u32,
        compression: PatchCompression,
    ) -> Self {
        PatchWriter {
            index_name: index_name.into(),
            src_segment,
            shard_count: shard_count.max(1),
            compression,
            buffers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Index name.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Segment recording the updates.
    pub fn source_segment(&self) -> SegmentId {
        self.src_segment
    }

    /// Record an event for document `doc_id` of sealed segment `dst_segment`.
    pub fn update(
        &self,
        dst_segment: SegmentId,
        doc_id: DocId,
        term: TermKey,
        is_delete: bool,
    ) -> Result<UpdateOutcome> {
        self.buffer(dst_segment).try_update(doc_id, term, is_delete)
    }

    /// Destination segments with a buffer.
    pub fn destination_segments(&self) -> Vec<SegmentId> {
        self.buffers.read().keys().copied().collect()
    }

    /// Whether any buffer holds undumped updates.
    pub fn is_dirty(&self) -> bool {
        self.buffers.read().values().any(|buffer| buffer.is_dirty())
    }

    /// Buffered events over all destinations.
    pub fn item_count(&self) -> u64 {
        self.buffers.read().values().map(|buffer| buffer.item_count()).sum()
    }

    /// Dump every buffer, in destination order.
    ///
    /// The first failure aborts the remaining dumps.
    pub fn dump_all(&self, storage: &dyn Storage) -> Result<Vec<PatchFileInfo>> {
        let buffers: Vec<Arc<ShardedUpdateBuffer>> =
            self.buffers.read().values().cloned().collect();

        let mut infos = Vec::new();
        for buffer in buffers {
            infos.extend(buffer.dump(storage)?);
        }

        info!(
            "{}: segment {} dumped {} patch files",
            self.index_name,
            self.src_segment,
            infos.len()
        );
        Ok(infos)
    }

    fn buffer(&self, dst_segment: SegmentId) -> Arc<ShardedUpdateBuffer> {
        if let Some(buffer) = self.buffers.read().get(&dst_segment) {
            return Arc::clone(buffer);
        }

        let mut buffers = self.buffers.write();
        let buffer = buffers.entry(dst_segment).or_insert_with(|| {
            Arc::new(ShardedUpdateBuffer::new(
                &self.index_name,
                self.src_segment,
                dst_segment,
                self.shard_count,
                self.compression,
            ))
        });
        Arc::clone(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_buffers_created_per_destination() {
        let storage = MemoryStorage::new_default();
        let writer = PatchWriter::new("tag", 9, 1, PatchCompression::None);
        assert!(!writer.is_dirty());

        writer.update(3, 0, TermKey::new(1), false).unwrap();
        writer.update(1, 4, TermKey::new(1), true).unwrap();
        writer.update(3, 2, TermKey::NULL, false).unwrap();
        assert_eq!(writer.destination_segments(), vec![1, 3]);
        assert_eq!(writer.item_count(), 3);

        let infos = writer.dump_all(&storage).unwrap();
        let paths: Vec<String> = infos.iter().map(PatchFileInfo::path).collect();
        assert_eq!(
            paths,
            vec!["segment_1/patch/tag/9_1.patch", "segment_3/patch/tag/9_3.patch"]
        );
        assert!(!writer.is_dirty());

        // Everything after the dump is dropped.
        assert_eq!(
            writer.update(3, 5, TermKey::new(1), false).unwrap(),
            UpdateOutcome::DroppedBecauseSealed
        );
    }

    #[test]
    fn test_sharded_writer() {
        let storage = MemoryStorage::new_default();
        let writer = PatchWriter::new("tag", 2, 3, PatchCompression::None);
        for key in 0..30u64 {
            writer.update(0, key as u32, TermKey::new(key), false).unwrap();
        }

        let infos = writer.dump_all(&storage).unwrap();
        assert!(infos.iter().all(|info| info.shard.is_some()));
        assert_eq!(infos.iter().map(|info| info.item_count).sum::<u64>(), 30);
    }
}
