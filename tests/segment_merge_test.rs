//! Integration tests for consolidating patched segments.

use std::sync::Arc;

use segpatch::lexical::config::{FieldUpdateConfig, MergeConfig, PatchCompression, UpdateConfig};
use segpatch::lexical::core::posting::{IndexMode, SegmentPostings};
use segpatch::lexical::core::term_key::TermKey;
use segpatch::lexical::merge::segment_merger::{
    MergePlan, MergeSource, SegmentMerger, postings_file_path,
};
use segpatch::lexical::merge::term_queue::{SegmentTermInfo, TermMergeQueue};
use segpatch::lexical::modifier::IndexModifier;
use segpatch::lexical::patch::index_reader::PatchIndexReader;
use segpatch::prelude::Result;
use segpatch::storage::file::FileStorage;
use segpatch::storage::{Storage, StorageConfig};
use tempfile::TempDir;

fn base_segment(segment: u32, doc_count: u32, terms: &[(u64, &[u32])]) -> Result<SegmentPostings> {
    let mut postings = SegmentPostings::new(segment, doc_count);
    for (key, docs) in terms {
        for doc in *docs {
            postings.add_posting(TermKey::new(*key), *doc)?;
        }
    }
    Ok(postings)
}

/// Segments 0 and 1 are sealed; segment 2 is building and patches both.
fn build_index(storage: &dyn Storage) -> Result<()> {
    let first = base_segment(0, 4, &[(10, &[0, 1, 2]), (20, &[3])])?;
    let second = base_segment(1, 3, &[(10, &[0]), (30, &[1, 2])])?;
    first.write_to_storage(storage, &postings_file_path(0, "tag"))?;
    second.write_to_storage(storage, &postings_file_path(1, "tag"))?;

    let config = UpdateConfig::default().with_field(FieldUpdateConfig::patched("tag"));
    let modifier = IndexModifier::new(config, 2)?;
    modifier.update("tag", 0, 1, TermKey::new(10), true)?;
    modifier.update("tag", 0, 0, TermKey::new(40), false)?;
    modifier.update("tag", 1, 0, TermKey::new(10), true)?;
    modifier.update("tag", 1, 0, TermKey::new(30), false)?;
    modifier.dump_patches(storage)?;
    Ok(())
}

#[test]
fn test_merge_sealed_segments_with_patches() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FileStorage::new(dir.path(), StorageConfig::default())?;
    build_index(&storage)?;

    let merger = SegmentMerger::new(MergeConfig {
        high_frequency_threshold: 3,
        parallelism: 2,
    });
    let sources = merger.load_sources(&storage, "tag", &[0, 1], 1, PatchCompression::None)?;
    assert!(sources.iter().all(|source| source.patches.is_some()));

    let (merged, stats) = merger.merge(5, &sources)?;
    assert_eq!(merged.segment_id(), 5);
    assert_eq!(merged.doc_count(), 7);

    // Segment 1 documents start at 4.
    assert_eq!(
        merged.postings(TermKey::new(10), IndexMode::Normal),
        Some(vec![0, 2])
    );
    assert_eq!(
        merged.postings(TermKey::new(20), IndexMode::Normal),
        Some(vec![3])
    );
    assert_eq!(
        merged.postings(TermKey::new(30), IndexMode::Normal),
        Some(vec![4, 5, 6])
    );
    assert_eq!(
        merged.postings(TermKey::new(40), IndexMode::Normal),
        Some(vec![0])
    );
    assert!(merged.contains(TermKey::new(30), IndexMode::HighFrequency));
    assert_eq!(stats.patched_terms, 4);
    assert_eq!(stats.high_frequency_terms, 1);

    merged.write_to_storage(&storage, &postings_file_path(5, "tag"))?;
    let reloaded = SegmentPostings::read_from_storage(&storage, &postings_file_path(5, "tag"))?;
    assert_eq!(reloaded, merged);

    Ok(())
}

#[test]
fn test_bitmaps_agree_with_normal_postings_after_merge() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FileStorage::new(dir.path(), StorageConfig::default())?;

    let mut dense = base_segment(0, 3, &[(10, &[0, 1, 2])])?;
    dense.build_high_frequency(3);
    let sparse = base_segment(1, 1, &[(10, &[0])])?;
    let sources = vec![
        MergeSource::new(Arc::new(dense)),
        MergeSource::new(Arc::new(sparse)),
    ];

    let merger = SegmentMerger::new(MergeConfig {
        high_frequency_threshold: 0,
        parallelism: 1,
    });
    let (merged, _) = merger.merge(4, &sources)?;
    merged.write_to_storage(&storage, &postings_file_path(4, "tag"))?;
    let reloaded = SegmentPostings::read_from_storage(&storage, &postings_file_path(4, "tag"))?;

    for term in reloaded.terms(IndexMode::HighFrequency) {
        assert_eq!(
            reloaded.postings(term, IndexMode::HighFrequency),
            reloaded.postings(term, IndexMode::Normal)
        );
    }
    assert_eq!(
        reloaded.postings(TermKey::new(10), IndexMode::HighFrequency),
        Some(vec![0, 1, 2, 3])
    );

    Ok(())
}

#[test]
fn test_merge_destinations_in_parallel() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FileStorage::new(dir.path(), StorageConfig::default())?;
    build_index(&storage)?;

    let merger = SegmentMerger::new(MergeConfig {
        high_frequency_threshold: 0,
        parallelism: 2,
    });
    let sources = merger.load_sources(&storage, "tag", &[0, 1], 1, PatchCompression::None)?;
    let plans = vec![
        MergePlan {
            target_segment: 10,
            sources: vec![sources[0].clone()],
        },
        MergePlan {
            target_segment: 11,
            sources: vec![sources[1].clone()],
        },
    ];

    let results = merger.merge_destinations(&plans)?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0.segment_id(), 10);
    assert_eq!(
        results[1].0.postings(TermKey::new(30), IndexMode::Normal),
        Some(vec![0, 1, 2])
    );
    assert!(results[1].0.postings(TermKey::new(10), IndexMode::Normal).is_none());

    Ok(())
}

#[test]
fn test_term_queue_never_revisits_terms() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FileStorage::new(dir.path(), StorageConfig::default())?;
    build_index(&storage)?;

    let mut queue = TermMergeQueue::new(IndexMode::Normal);
    for segment in [0, 1] {
        let postings =
            SegmentPostings::read_from_storage(&storage, &postings_file_path(segment, "tag"))?;
        let patches = PatchIndexReader::open(&storage, "tag", segment, 1, PatchCompression::None)?;
        queue.add(
            SegmentTermInfo::from_postings(Arc::new(postings), IndexMode::Normal)
                .with_patches(Arc::new(patches)),
        )?;
    }

    let mut seen = Vec::new();
    while !queue.is_empty() {
        let infos = queue.current_term_infos()?;
        let term = infos[0].current_term().unwrap();
        assert!(infos.iter().all(|info| info.current_term() == Some(term)));
        seen.push(term);
        queue.move_to_next_term()?;
    }

    assert_eq!(
        seen,
        vec![
            TermKey::new(10),
            TermKey::new(20),
            TermKey::new(30),
            TermKey::new(40)
        ]
    );

    Ok(())
}
