//! Patch lookup for one destination segment.
//!
//! [`PatchIndexReader`] opens every patch file in a segment's patch area for
//! one index, composes them with [`PatchMerger`] and serves term lookups from
//! the merged result. This is the read side the search and merge layers use for
//! sealed segments.

use std::collections::BTreeMap;

use log::debug;

use crate::error::Result;
use crate::lexical::SegmentId;
use crate::lexical::config::PatchCompression;
use crate::lexical::core::doc_delta::DocDelta;
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::codec::{is_patch_file_name, patch_directory};
use crate::lexical::patch::merger::{PatchMerger, VecDeltaCursor};
use crate::lexical::patch::reader::PatchFileReader;
use crate::storage::Storage;

/// Merged patches of one (index, destination segment).
#[derive(Debug, Clone, Default)]
pub struct PatchIndexReader {
    dst_segment: SegmentId,
    patch_files: Vec<String>,
    terms: BTreeMap<TermKey, Vec<DocDelta>>,
}

impl PatchIndexReader {
    /// Load the patches of `index_name` stored in segment `dst_segment`.
    ///
    /// For sharded indexes every shard's patch area is read; terms never span
    /// shards, so the shard results are disjoint.
    pub fn open(
        storage: &dyn Storage,
        index_name: &str,
        dst_segment: SegmentId,
        shard_count: u32,
        compression: PatchCompression,
    ) -> Result<Self> {
        let shards: Vec<Option<u32>> = if shard_count <= 1 {
            vec![None]
        } else {
            (0..shard_count).map(Some).collect()
        };

        let all_files = storage.list_files()?;
        let mut reader = PatchIndexReader {
            dst_segment,
            ..Default::default()
        };

        for shard in shards {
            let directory = patch_directory(dst_segment, index_name, shard);
            let mut paths: Vec<String> = all_files
                .iter()
                .filter_map(|name| {
                    let file = name.strip_prefix(&directory)?.strip_prefix('/')?;
                    (!file.contains('/') && is_patch_file_name(file)).then(|| name.clone())
                })
                .collect();
            paths.sort();

            let readers = paths
                .iter()
                .map(|path| PatchFileReader::open(storage, path, compression))
                .collect::<Result<Vec<_>>>()?;
            reader.terms.extend(PatchMerger::new(readers)?.read_all()?);
            reader.patch_files.extend(paths);
        }

        debug!(
            "{index_name}: loaded {} patch files with {} terms for segment {dst_segment}",
            reader.patch_files.len(),
            reader.terms.len()
        );
        Ok(reader)
    }

    /// Destination segment.
    pub fn destination_segment(&self) -> SegmentId {
        self.dst_segment
    }

    /// Paths of the merged patch files.
    pub fn patch_files(&self) -> &[String] {
        &self.patch_files
    }

    /// Whether no patch touches the segment.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Number of patched terms.
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// Merged deltas of `term`, `None` when no patch touches it.
    pub fn lookup(&self, term: TermKey) -> Option<&[DocDelta]> {
        self.terms.get(&term).map(Vec::as_slice)
    }

    /// A delta cursor over `term`, attributed to the destination segment.
    pub fn cursor(&self, term: TermKey) -> Option<VecDeltaCursor> {
        self.terms
            .get(&term)
            .map(|deltas| VecDeltaCursor::new(self.dst_segment, deltas.clone()))
    }

    /// Patched terms in ascending order.
    pub fn terms(&self) -> impl Iterator<Item = TermKey> + '_ {
        self.terms.keys().copied()
    }

    /// (term, deltas) pairs in ascending term order.
    pub fn iter(&self) -> impl Iterator<Item = (TermKey, &[DocDelta])> + '_ {
        self.terms
            .iter()
            .map(|(term, deltas)| (*term, deltas.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::patch::writer::PatchWriter;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn test_composes_patches_from_several_sources() {
        let storage = MemoryStorage::new_default();

        let first = PatchWriter::new("tag", 4, 1, PatchCompression::None);
        first.update(1, 0, TermKey::new(10), false).unwrap();
        first.update(1, 1, TermKey::new(10), false).unwrap();
        first.update(2, 0, TermKey::new(10), false).unwrap();
        first.dump_all(&storage).unwrap();

        let second = PatchWriter::new("tag", 6, 1, PatchCompression::None);
        second.update(1, 1, TermKey::new(10), true).unwrap();
        second.update(1, 3, TermKey::NULL, false).unwrap();
        second.dump_all(&storage).unwrap();

        let reader =
            PatchIndexReader::open(&storage, "tag", 1, 1, PatchCompression::None).unwrap();
        assert_eq!(reader.patch_files().len(), 2);
        assert_eq!(reader.term_count(), 2);

        let deltas: Vec<(u32, bool)> = reader
            .lookup(TermKey::new(10))
            .unwrap()
            .iter()
            .map(|d| (d.doc_id(), d.is_delete()))
            .collect();
        assert_eq!(deltas, vec![(0, false), (1, true)]);
        assert!(reader.lookup(TermKey::new(11)).is_none());
        assert_eq!(
            reader.terms().collect::<Vec<_>>(),
            vec![TermKey::new(10), TermKey::NULL]
        );

        let other = PatchIndexReader::open(&storage, "tag", 2, 1, PatchCompression::None).unwrap();
        assert_eq!(other.patch_files(), ["segment_2/patch/tag/4_2.patch"]);
    }

    #[test]
    fn test_ignores_other_indexes_and_temp_files() {
        let storage = MemoryStorage::new_default();
        let writer = PatchWriter::new("tag", 4, 1, PatchCompression::None);
        writer.update(1, 0, TermKey::new(10), false).unwrap();
        writer.dump_all(&storage).unwrap();

        let other = PatchWriter::new("tags", 4, 1, PatchCompression::None);
        other.update(1, 0, TermKey::new(99), false).unwrap();
        other.dump_all(&storage).unwrap();

        let _ = storage
            .create_temp_output("segment_1/patch/tag/5_1.patch")
            .unwrap();

        let reader =
            PatchIndexReader::open(&storage, "tag", 1, 1, PatchCompression::None).unwrap();
        assert_eq!(reader.patch_files(), ["segment_1/patch/tag/4_1.patch"]);
        assert!(reader.lookup(TermKey::new(99)).is_none());
    }

    #[test]
    fn test_empty_segment() {
        let storage = MemoryStorage::new_default();
        let reader =
            PatchIndexReader::open(&storage, "tag", 7, 4, PatchCompression::None).unwrap();
        assert!(reader.is_empty());
        assert!(reader.cursor(TermKey::new(1)).is_none());
    }

    #[test]
    fn test_sharded_lookup() {
        let storage = MemoryStorage::new_default();
        let writer = PatchWriter::new("tag", 4, 4, PatchCompression::None);
        for key in 0..20u64 {
            writer.update(0, key as u32, TermKey::new(key), key % 2 == 0).unwrap();
        }
        writer.dump_all(&storage).unwrap();

        let reader =
            PatchIndexReader::open(&storage, "tag", 0, 4, PatchCompression::None).unwrap();
        assert_eq!(reader.term_count(), 20);
        for key in 0..20u64 {
            let deltas = reader.lookup(TermKey::new(key)).unwrap();
            assert_eq!(deltas.len(), 1);
            assert_eq!(deltas[0].is_delete(), key % 2 == 0);
        }
    }
}
