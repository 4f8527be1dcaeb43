//! Integration tests for the sealed-segment patch pipeline: buffer, dump, read back, merge.

use segpatch::lexical::config::PatchCompression;
use segpatch::lexical::core::doc_delta::DocDelta;
use segpatch::lexical::core::term_key::TermKey;
use segpatch::lexical::patch::buffer::{DumpOutcome, SegmentUpdateBuffer, UpdateOutcome};
use segpatch::lexical::patch::index_reader::PatchIndexReader;
use segpatch::lexical::patch::merger::PatchMerger;
use segpatch::lexical::patch::reader::PatchFileReader;
use segpatch::lexical::patch::writer::PatchWriter;
use segpatch::prelude::Result;
use segpatch::storage::file::FileStorage;
use segpatch::storage::memory::MemoryStorage;
use segpatch::storage::{Storage, StorageConfig};
use tempfile::TempDir;

fn ops(deltas: &[DocDelta]) -> Vec<(u32, bool)> {
    deltas.iter().map(|d| (d.doc_id(), d.is_delete())).collect()
}

#[test]
fn test_last_op_survives_end_to_end() -> Result<()> {
    let storage = MemoryStorage::new_default();
    let buffer = SegmentUpdateBuffer::new("title", 1, 0, PatchCompression::None);

    for (doc, is_delete) in [(0, false), (1, false), (1, true), (0, true)] {
        let outcome = buffer.try_update(doc, TermKey::new(100), is_delete)?;
        assert_eq!(outcome, UpdateOutcome::Applied);
    }

    let info = buffer.dump(&storage)?.into_info().unwrap();
    let terms = PatchFileReader::open(&storage, &info.path(), PatchCompression::None)?.read_all()?;

    // Removals after adds are persisted as tombstones, not elided.
    assert_eq!(terms.len(), 1);
    assert_eq!(terms[0].0, TermKey::new(100));
    assert_eq!(ops(&terms[0].1), vec![(0, true), (1, true)]);

    Ok(())
}

#[test]
fn test_round_trip_through_file_storage() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FileStorage::new(dir.path(), StorageConfig::default())?;

    for compression in [
        PatchCompression::None,
        PatchCompression::Lz4 { block_size: 64 },
    ] {
        let dst = match compression {
            PatchCompression::None => 0,
            PatchCompression::Lz4 { .. } => 1,
        };
        let buffer = SegmentUpdateBuffer::new("title", 3, dst, compression);
        buffer.try_update(2, TermKey::NULL, false)?;
        buffer.try_update(1, TermKey::new(200), true)?;
        buffer.try_update(0, TermKey::new(100), false)?;

        let info = buffer.dump(&storage)?.into_info().unwrap();
        assert_eq!(info.term_count, 3);
        assert!(info.has_null_term);
        assert!(dir.path().join(info.path()).is_file());

        let mut reader = PatchFileReader::open(&storage, &info.path(), compression)?;
        assert_eq!(reader.source_segment(), 3);
        assert_eq!(reader.destination_segment(), dst);
        assert_eq!(reader.total_item_count(), 3);

        let mut visited = Vec::new();
        while let Some(term) = reader.current_term_key() {
            let mut deltas = Vec::new();
            while let Some(delta) = reader.next()? {
                deltas.push(delta);
            }
            visited.push((term, ops(&deltas)));
            reader.skip_current_term()?;
        }
        assert_eq!(
            visited,
            vec![
                (TermKey::new(100), vec![(0, false)]),
                (TermKey::new(200), vec![(1, true)]),
                (TermKey::NULL, vec![(2, false)]),
            ]
        );
    }

    Ok(())
}

#[test]
fn test_empty_dump_writes_nothing() {
    let storage = MemoryStorage::new_default();
    let buffer = SegmentUpdateBuffer::new("title", 1, 0, PatchCompression::None);
    assert!(!buffer.is_dirty());
    assert!(matches!(
        buffer.dump(&storage).unwrap(),
        DumpOutcome::NotDirty
    ));
    assert!(storage.list_files().unwrap().is_empty());
}

#[test]
fn test_cross_segment_tie_break() -> Result<()> {
    let storage = MemoryStorage::new_default();
    for (src, is_delete) in [(2, false), (7, true)] {
        let writer = PatchWriter::new("title", src, 1, PatchCompression::None);
        writer.update(0, 5, TermKey::new(300), is_delete)?;
        writer.dump_all(&storage)?;
    }

    let readers = ["segment_0/patch/title/2_0.patch", "segment_0/patch/title/7_0.patch"]
        .iter()
        .map(|path| PatchFileReader::open(&storage, path, PatchCompression::None))
        .collect::<Result<Vec<_>>>()?;
    let merged = PatchMerger::new(readers)?.read_all()?;
    assert_eq!(merged.len(), 1);
    assert_eq!(ops(&merged[0].1), vec![(5, true)]);

    let lookup = PatchIndexReader::open(&storage, "title", 0, 1, PatchCompression::None)?;
    assert_eq!(ops(lookup.lookup(TermKey::new(300)).unwrap()), vec![(5, true)]);

    Ok(())
}

#[test]
fn test_merged_view_is_term_ordered() -> Result<()> {
    let storage = MemoryStorage::new_default();
    for src in [4, 5, 6] {
        let writer = PatchWriter::new("title", src, 1, PatchCompression::None);
        for key in (0..50u64).filter(|key| key % (src as u64 - 2) == 0) {
            writer.update(1, key as u32, TermKey::new(key * 10), src == 5)?;
        }
        writer.update(1, src, TermKey::NULL, false)?;
        writer.dump_all(&storage)?;
    }

    let reader = PatchIndexReader::open(&storage, "title", 1, 1, PatchCompression::None)?;
    let terms: Vec<TermKey> = reader.terms().collect();
    assert!(terms.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(terms.last(), Some(&TermKey::NULL));
    assert_eq!(
        ops(reader.lookup(TermKey::NULL).unwrap()),
        vec![(4, false), (5, false), (6, false)]
    );
    // Term 0 is logged by every source; segment 6 wins.
    assert_eq!(ops(reader.lookup(TermKey::new(0)).unwrap()), vec![(0, false)]);

    Ok(())
}
