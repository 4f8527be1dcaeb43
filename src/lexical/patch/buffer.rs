//! In-memory accumulation of updates against a sealed segment.
//!
//! A [`SegmentUpdateBuffer`] collects the add/remove events one source segment
//! records against one destination segment. Events are grouped per term in
//! arrival order; nothing is sorted until the buffer is dumped, at which point
//! every term list is collapsed with the last-write-wins rule and written as a
//! patch file.
//!
//! Dumping drains the buffer for good. An update that arrives once a drain has
//! begun is dropped and reported as [`UpdateOutcome::DroppedBecauseSealed`]: the
//! owning segment is being sealed and the persisted patch is what counts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::error::Result;
use crate::lexical::SegmentId;
use crate::lexical::config::PatchCompression;
use crate::lexical::core::doc_delta::{DocDelta, DocId, dedup_last_wins};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::codec::{
    PatchFileWriter, patch_directory, patch_file_name, patch_file_path,
};
use crate::storage::Storage;

/// Result of offering an update to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOutcome {
    /// The delta was recorded.
    Applied,
    /// The buffer is draining or drained; the delta was discarded.
    DroppedBecauseSealed,
}

impl UpdateOutcome {
    /// Whether the delta was recorded.
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

/// Description of a dumped patch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchFileInfo {
    /// Segment that recorded the updates.
    pub src_segment: SegmentId,
    /// Segment the updates apply to.
    pub dst_segment: SegmentId,
    /// Dictionary shard, `None` for unsharded indexes.
    pub shard: Option<u32>,
    /// Directory of the file inside the storage.
    pub directory: String,
    /// File name inside `directory`.
    pub file_name: String,
    /// Number of term blocks, null term included.
    pub term_count: u64,
    /// Whether the file carries a null-term block.
    pub has_null_term: bool,
    /// Number of deltas after dedup.
    pub item_count: u64,
}

impl PatchFileInfo {
    /// Storage path of the file.
    pub fn path(&self) -> String {
        format!("{}/{}", self.directory, self.file_name)
    }
}

/// Result of dumping a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpOutcome {
    /// A patch file was written.
    Written(PatchFileInfo),
    /// The buffer never received an update; no file was produced.
    NotDirty,
}

impl DumpOutcome {
    /// The written file, if any.
    pub fn into_info(self) -> Option<PatchFileInfo> {
        match self {
            DumpOutcome::Written(info) => Some(info),
            DumpOutcome::NotDirty => None,
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    terms: AHashMap<u64, Vec<DocDelta>>,
    null_term: Vec<DocDelta>,
    item_count: u64,
    consumed: bool,
}

impl BufferState {
    fn push(&mut self, term: TermKey, delta: DocDelta) {
        if term.is_null() {
            self.null_term.push(delta);
        } else {
            self.terms.entry(term.key()).or_default().push(delta);
        }
        self.item_count += 1;
    }

    fn is_dirty(&self) -> bool {
        self.item_count > 0
    }

    fn term_count(&self) -> usize {
        self.terms.len() + (!self.null_term.is_empty()) as usize
    }
}

/// Update accumulator for one (index, source segment, destination segment).
#[derive(Debug)]
pub struct SegmentUpdateBuffer {
    index_name: String,
    src_segment: SegmentId,
    dst_segment: SegmentId,
    shard: Option<u32>,
    compression: PatchCompression,
    state: Mutex<BufferState>,
    draining: AtomicBool,
    dropped: AtomicU64,
}

impl SegmentUpdateBuffer {
    /// Create an empty buffer.
    pub fn new(
        index_name: impl Into<String>,
        src_segment: SegmentId,
        dst_segment: SegmentId,
        compression: PatchCompression,
    ) -> Self {
        SegmentUpdateBuffer {
            index_name: index_name.into(),
            src_segment,
            dst_segment,
            shard: None,
            compression,
            state: Mutex::new(BufferState::default()),
            draining: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Place the buffer in a dictionary shard's patch area.
    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Index the buffer belongs to.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Segment recording the updates.
    pub fn source_segment(&self) -> SegmentId {
        self.src_segment
    }

    /// Segment the updates apply to.
    pub fn destination_segment(&self) -> SegmentId {
        self.dst_segment
    }

    /// Dictionary shard, if any.
    pub fn shard(&self) -> Option<u32> {
        self.shard
    }

    /// Record one event, or drop it if the buffer is sealed.
    ///
    /// Fails only for document ids wider than 31 bits.
    pub fn try_update(&self, doc_id: DocId, term: TermKey, is_delete: bool) -> Result<UpdateOutcome> {
        let delta = DocDelta::try_new(doc_id, is_delete)?;

        if self.draining.load(Ordering::Acquire) {
            return Ok(self.drop_update(doc_id, term));
        }

        let mut state = self.state.lock();
        if state.consumed {
            drop(state);
            return Ok(self.drop_update(doc_id, term));
        }
        state.push(term, delta);
        Ok(UpdateOutcome::Applied)
    }

    /// Alias of [`Self::try_update`].
    pub fn update(&self, doc_id: DocId, term: TermKey, is_delete: bool) -> Result<UpdateOutcome> {
        self.try_update(doc_id, term, is_delete)
    }

    /// Whether any update has been recorded and not yet dumped.
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        !state.consumed && state.is_dirty()
    }

    /// Whether a drain has begun.
    pub fn is_sealed(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Number of buffered events, before dedup.
    pub fn item_count(&self) -> u64 {
        self.state.lock().item_count
    }

    /// Number of distinct terms buffered, null term included.
    pub fn term_count(&self) -> usize {
        self.state.lock().term_count()
    }

    /// Number of updates dropped because the buffer was sealed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Seal the buffer and take its lock. Updates arriving while the guard is
    /// alive are dropped; [`DrainGuard::dump`] writes and consumes the content.
    pub fn begin_drain(&self) -> DrainGuard<'_> {
        self.draining.store(true, Ordering::Release);
        let state = self.state.lock();
        DrainGuard {
            buffer: self,
            state,
        }
    }

    /// Sort, dedup and write the buffered deltas as one patch file.
    pub fn dump(&self, storage: &dyn Storage) -> Result<DumpOutcome> {
        self.begin_drain().dump(storage)
    }

    fn drop_update(&self, doc_id: DocId, term: TermKey) -> UpdateOutcome {
        let previous = self.dropped.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            warn!(
                "{}: dropping update (doc {doc_id}, term {term}) for sealed segment {} from segment {}",
                self.index_name, self.dst_segment, self.src_segment
            );
        } else {
            debug!(
                "{}: dropping update (doc {doc_id}, term {term}), {} dropped so far",
                self.index_name,
                previous + 1
            );
        }
        UpdateOutcome::DroppedBecauseSealed
    }
}

/// Exclusive access to a sealed buffer.
///
/// Dropping the guard without dumping reopens the buffer.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    buffer: &'a SegmentUpdateBuffer,
    state: MutexGuard<'a, BufferState>,
}

impl DrainGuard<'_> {
    /// Number of buffered events, before dedup.
    pub fn item_count(&self) -> u64 {
        self.state.item_count
    }

    /// Write the content and consume the buffer.
    ///
    /// The file is written under a temporary name and renamed into place once
    /// complete, so a failed dump leaves no patch file behind.
    pub fn dump(mut self, storage: &dyn Storage) -> Result<DumpOutcome> {
        let buffer = self.buffer;
        if self.state.consumed {
            return Ok(DumpOutcome::NotDirty);
        }
        let state = std::mem::take(&mut *self.state);
        self.state.consumed = true;
        if !state.is_dirty() {
            debug!(
                "{}: nothing to dump for {} -> {}",
                buffer.index_name, buffer.src_segment, buffer.dst_segment
            );
            return Ok(DumpOutcome::NotDirty);
        }

        let directory = patch_directory(buffer.dst_segment, &buffer.index_name, buffer.shard);
        let file_name = patch_file_name(buffer.src_segment, buffer.dst_segment);
        let final_path = patch_file_path(
            &buffer.index_name,
            buffer.shard,
            buffer.src_segment,
            buffer.dst_segment,
        );

        let (temp_path, output) = storage.create_temp_output(&final_path)?;
        let written = write_record(state, output, buffer.compression)
            .and_then(|stats| storage.rename_file(&temp_path, &final_path).map(|_| stats));

        let (term_count, has_null_term, item_count) = match written {
            Ok(stats) => stats,
            Err(e) => {
                if storage.file_exists(&temp_path)
                    && let Err(cleanup) = storage.delete_file(&temp_path)
                {
                    warn!("failed to remove {temp_path} after failed dump: {cleanup}");
                }
                return Err(e);
            }
        };

        info!(
            "dumped patch {final_path}: {term_count} terms, {item_count} deltas"
        );
        Ok(DumpOutcome::Written(PatchFileInfo {
            src_segment: buffer.src_segment,
            dst_segment: buffer.dst_segment,
            shard: buffer.shard,
            directory,
            file_name,
            term_count,
            has_null_term,
            item_count,
        }))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.state.consumed {
            self.buffer.draining.store(false, Ordering::Release);
        }
    }
}

fn write_record(
    state: BufferState,
    output: Box<dyn crate::storage::StorageOutput>,
    compression: PatchCompression,
) -> Result<(u64, bool, u64)> {
    let BufferState {
        terms, null_term, ..
    } = state;

    let mut terms: Vec<(u64, Vec<DocDelta>)> = terms.into_iter().collect();
    terms.sort_unstable_by_key(|(key, _)| *key);

    let mut writer = PatchFileWriter::new(output, compression);
    for (key, mut deltas) in terms {
        dedup_last_wins(&mut deltas);
        writer.write_term(TermKey::new(key), &deltas)?;
    }
    if !null_term.is_empty() {
        let mut deltas = null_term;
        dedup_last_wins(&mut deltas);
        writer.write_term(TermKey::NULL, &deltas)?;
    }

    let item_count = writer.item_count();
    let meta = writer.finish()?;
    Ok((meta.term_count(), meta.has_null_term, item_count))
}

/// SplitMix64 finalizer; stable across platforms and releases.
pub fn splitmix64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    value ^ (value >> 31)
}

/// Shard owning `term` in a dictionary of `shard_count` shards.
///
/// The null term always lives in shard 0.
pub fn shard_for(term: TermKey, shard_count: u32) -> u32 {
    if term.is_null() || shard_count <= 1 {
        return 0;
    }
    (splitmix64(term.key()) % shard_count as u64) as u32
}

/// One buffer per dictionary shard, all for the same segment pair.
///
/// With a single shard the buffer uses the unsharded patch layout.
#[derive(Debug)]
pub struct ShardedUpdateBuffer {
    shards: Vec<SegmentUpdateBuffer>,
}

impl ShardedUpdateBuffer {
    /// Create `shard_count` empty buffers (at least one).
    pub fn new(
        index_name: &str,
        src_segment: SegmentId,
        dst_segment: SegmentId,
        shard_count: u32,
        compression: PatchCompression,
    ) -> Self {
        let shards = if shard_count <= 1 {
            vec![SegmentUpdateBuffer::new(
                index_name,
                src_segment,
                dst_segment,
                compression,
            )]
        } else {
            (0..shard_count)
                .map(|shard| {
                    SegmentUpdateBuffer::new(index_name, src_segment, dst_segment, compression)
                        .with_shard(shard)
                })
                .collect()
        };
        ShardedUpdateBuffer { shards }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// The buffer of one shard.
    pub fn shard(&self, shard: u32) -> Option<&SegmentUpdateBuffer> {
        self.shards.get(shard as usize)
    }

    /// Route an event to the shard owning `term`.
    pub fn try_update(&self, doc_id: DocId, term: TermKey, is_delete: bool) -> Result<UpdateOutcome> {
        let shard = shard_for(term, self.shard_count());
        self.shards[shard as usize].try_update(doc_id, term, is_delete)
    }

    /// Whether any shard holds undumped updates.
    pub fn is_dirty(&self) -> bool {
        self.shards.iter().any(SegmentUpdateBuffer::is_dirty)
    }

    /// Buffered events over all shards.
    pub fn item_count(&self) -> u64 {
        self.shards.iter().map(SegmentUpdateBuffer::item_count).sum()
    }

    /// Dump every shard; each dirty shard produces its own patch file.
    pub fn dump(&self, storage: &dyn Storage) -> Result<Vec<PatchFileInfo>> {
        let mut infos = Vec::new();
        for shard in &self.shards {
            if let DumpOutcome::Written(info) = shard.dump(storage)? {
                infos.push(info);
            }
        }
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::patch::reader::PatchFileReader;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{StorageInput, StorageOutput};
    use std::sync::Arc;
    use std::thread;

    fn read_back(storage: &dyn Storage, info: &PatchFileInfo) -> Vec<(TermKey, Vec<(DocId, bool)>)> {
        PatchFileReader::open(storage, &info.path(), PatchCompression::None)
            .unwrap()
            .read_all()
            .unwrap()
            .into_iter()
            .map(|(term, deltas)| {
                (
                    term,
                    deltas.iter().map(|d| (d.doc_id(), d.is_delete())).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_dump_sorts_and_dedups() {
        let storage = MemoryStorage::new_default();
        let buffer = SegmentUpdateBuffer::new("tag", 5, 2, PatchCompression::None);

        buffer.try_update(2, TermKey::NULL, false).unwrap();
        buffer.try_update(1, TermKey::new(200), true).unwrap();
        buffer.try_update(0, TermKey::new(100), false).unwrap();
        buffer.try_update(3, TermKey::new(100), false).unwrap();
        buffer.try_update(0, TermKey::new(100), true).unwrap();
        assert_eq!(buffer.item_count(), 5);
        assert_eq!(buffer.term_count(), 3);
        assert!(buffer.is_dirty());

        let info = buffer.dump(&storage).unwrap().into_info().unwrap();
        assert_eq!(info.path(), "segment_2/patch/tag/5_2.patch");
        assert_eq!(info.term_count, 3);
        assert!(info.has_null_term);
        assert_eq!(info.item_count, 4);

        assert_eq!(
            read_back(&storage, &info),
            vec![
                (TermKey::new(100), vec![(0, true), (3, false)]),
                (TermKey::new(200), vec![(1, true)]),
                (TermKey::NULL, vec![(2, false)]),
            ]
        );
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_empty_dump_writes_nothing() {
        let storage = MemoryStorage::new_default();
        let buffer = SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None);

        assert_eq!(buffer.dump(&storage).unwrap(), DumpOutcome::NotDirty);
        assert!(storage.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_updates_dropped_during_and_after_drain() {
        let storage = MemoryStorage::new_default();
        let buffer = Arc::new(SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None));
        assert_eq!(
            buffer.try_update(4, TermKey::new(9), false).unwrap(),
            UpdateOutcome::Applied
        );

        let guard = buffer.begin_drain();
        assert!(buffer.is_sealed());
        let racing = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.try_update(5, TermKey::new(9), false).unwrap())
                .join()
                .unwrap()
        };
        assert_eq!(racing, UpdateOutcome::DroppedBecauseSealed);
        assert_eq!(guard.item_count(), 1);

        let info = guard.dump(&storage).unwrap().into_info().unwrap();
        assert_eq!(info.item_count, 1);
        assert_eq!(
            buffer.try_update(6, TermKey::new(9), false).unwrap(),
            UpdateOutcome::DroppedBecauseSealed
        );
        assert_eq!(buffer.dropped_count(), 2);

        // A second dump is a no-op.
        assert_eq!(buffer.dump(&storage).unwrap(), DumpOutcome::NotDirty);
    }

    #[test]
    fn test_abandoned_drain_reopens_buffer() {
        let buffer = SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None);
        drop(buffer.begin_drain());
        assert!(!buffer.is_sealed());
        assert!(buffer.try_update(1, TermKey::new(1), false).unwrap().is_applied());
    }

    #[test]
    fn test_rejects_wide_doc_ids() {
        let buffer = SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None);
        assert!(buffer.try_update(u32::MAX, TermKey::new(1), false).is_err());
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_concurrent_updates_are_all_recorded() {
        let buffer = Arc::new(SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for doc in 0..250u32 {
                        buffer
                            .try_update(t * 250 + doc, TermKey::new(doc as u64 % 7), false)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.item_count(), 1000);
        assert_eq!(buffer.term_count(), 7);
    }

    /// Storage whose outputs fail on write, to exercise dump cleanup.
    #[derive(Debug)]
    struct FailingStorage {
        inner: MemoryStorage,
    }

    #[derive(Debug)]
    struct FailingOutput;

    impl std::io::Write for FailingOutput {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl std::io::Seek for FailingOutput {
        fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    impl StorageOutput for FailingOutput {
        fn flush_and_sync(&mut self) -> Result<()> {
            Ok(())
        }

        fn position(&self) -> Result<u64> {
            Ok(0)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl Storage for FailingStorage {
        fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, _name: &str) -> Result<Box<dyn StorageOutput>> {
            Ok(Box::new(FailingOutput))
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }

        fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_file(old_name, new_name)
        }

        fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
            let (name, _) = self.inner.create_temp_output(prefix)?;
            Ok((name, Box::new(FailingOutput)))
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn test_failed_dump_leaves_no_file() {
        let storage = FailingStorage {
            inner: MemoryStorage::new_default(),
        };
        let buffer = SegmentUpdateBuffer::new("tag", 1, 0, PatchCompression::None);
        buffer.try_update(1, TermKey::new(1), false).unwrap();

        assert!(buffer.dump(&storage).is_err());
        assert!(storage.list_files().unwrap().is_empty());
        assert!(!storage.file_exists("segment_0/patch/tag/1_0.patch"));
    }

    #[test]
    fn test_shard_routing_is_stable() {
        assert_eq!(shard_for(TermKey::NULL, 8), 0);
        assert_eq!(shard_for(TermKey::new(42), 1), 0);
        for key in 0..100u64 {
            let shard = shard_for(TermKey::new(key), 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for(TermKey::new(key), 4));
        }
        assert_eq!(splitmix64(0), 0xE220_A839_7B1D_CDAF);
    }

    #[test]
    fn test_sharded_dump_writes_one_file_per_dirty_shard() {
        let storage = MemoryStorage::new_default();
        let buffer = ShardedUpdateBuffer::new("tag", 3, 1, 4, PatchCompression::None);
        assert_eq!(buffer.shard_count(), 4);

        for key in 0..32u64 {
            buffer.try_update(key as u32, TermKey::new(key), false).unwrap();
        }
        buffer.try_update(99, TermKey::NULL, true).unwrap();
        assert_eq!(buffer.item_count(), 33);

        let infos = buffer.dump(&storage).unwrap();
        assert!(!infos.is_empty());
        assert_eq!(infos.iter().map(|info| info.item_count).sum::<u64>(), 33);

        for info in &infos {
            let shard = info.shard.unwrap();
            assert_eq!(info.directory, format!("segment_1/patch/tag_@_{shard}"));
            for (term, _) in read_back(&storage, info) {
                assert_eq!(shard_for(term, 4), shard);
            }
        }
        let null_owner = infos.iter().find(|info| info.has_null_term).unwrap();
        assert_eq!(null_owner.shard, Some(0));
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_single_shard_uses_plain_layout() {
        let storage = MemoryStorage::new_default();
        let buffer = ShardedUpdateBuffer::new("tag", 3, 1, 1, PatchCompression::None);
        buffer.try_update(0, TermKey::new(1), false).unwrap();

        let infos = buffer.dump(&storage).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].shard, None);
        assert_eq!(infos[0].path(), "segment_1/patch/tag/3_1.patch");
    }
}
