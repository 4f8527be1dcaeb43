//! Segment consolidation.
//!
//! [`SegmentMerger`] turns a set of sealed source segments, each with its
//! outstanding patches, into one target segment. Documents are renumbered by a
//! [`DocIdMap`] (source segments laid end to end, deleted documents dropped),
//! and every term is rebuilt from the [`TermMergeQueue`] bundles: base postings
//! with patch deltas applied, remapped, concatenated. High-frequency bitmaps
//! are copies of the merged normal lists.
//!
//! A merge either produces a complete target or fails; no partially merged
//! term is ever emitted.

use std::sync::Arc;
use std::time::Instant;

use bit_vec::BitVec;
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::{MergeConfig, PatchCompression};
use crate::lexical::core::doc_delta::DocId;
use crate::lexical::core::posting::{IndexMode, SegmentPostings};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::merge::term_queue::{SegmentTermInfo, TermMergeQueue};
use crate::lexical::patch::index_reader::PatchIndexReader;
use crate::storage::Storage;

/// One source segment of a merge.
#[derive(Debug, Clone)]
pub struct MergeSource {
    /// Base postings.
    pub postings: Arc<SegmentPostings>,
    /// Outstanding patches of the segment.
    pub patches: Option<Arc<PatchIndexReader>>,
    /// Documents removed from the segment; they are not carried over.
    pub deleted_docs: Option<BitVec>,
}

impl MergeSource {
    /// A source without patches or deletions.
    pub fn new(postings: Arc<SegmentPostings>) -> Self {
        MergeSource {
            postings,
            patches: None,
            deleted_docs: None,
        }
    }

    /// Attach the segment's patches.
    pub fn with_patches(mut self, patches: Arc<PatchIndexReader>) -> Self {
        self.patches = Some(patches);
        self
    }

    /// Attach a deleted-document bitmap.
    pub fn with_deleted_docs(mut self, deleted_docs: BitVec) -> Self {
        self.deleted_docs = Some(deleted_docs);
        self
    }

    /// Segment id of the source.
    pub fn segment_id(&self) -> SegmentId {
        self.postings.segment_id()
    }
}

/// Maps (source segment, old doc id) to doc ids of the target segment.
#[derive(Debug, Clone)]
pub struct DocIdMap {
    segments: Vec<(SegmentId, Vec<Option<DocId>>)>,
    target_doc_count: u32,
}

impl DocIdMap {
    /// Lay `sources` out in the given order, skipping deleted documents.
    pub fn new(sources: &[MergeSource]) -> Result<Self> {
        let mut segments = Vec::with_capacity(sources.len());
        let mut next: u32 = 0;

        for source in sources {
            let doc_count = source.postings.doc_count();
            let mut mapping = Vec::with_capacity(doc_count as usize);
            for doc in 0..doc_count {
                let deleted = source
                    .deleted_docs
                    .as_ref()
                    .and_then(|bits| bits.get(doc as usize))
                    .unwrap_or(false);
                if deleted {
                    mapping.push(None);
                } else {
                    mapping.push(Some(next));
                    next = next.checked_add(1).ok_or_else(|| {
                        SegpatchError::invalid_argument("merged segment exceeds u32 documents")
                    })?;
                }
            }
            segments.push((source.segment_id(), mapping));
        }

        Ok(DocIdMap {
            segments,
            target_doc_count: next,
        })
    }

    /// Number of documents in the target segment.
    pub fn target_doc_count(&self) -> u32 {
        self.target_doc_count
    }

    /// Target id of `doc_id` in `segment_id`, `None` for deleted documents.
    pub fn map(&self, segment_id: SegmentId, doc_id: DocId) -> Result<Option<DocId>> {
        let (_, mapping) = self
            .segments
            .iter()
            .find(|(id, _)| *id == segment_id)
            .ok_or_else(|| SegpatchError::invalid_argument(format!("unknown segment {segment_id}")))?;
        mapping.get(doc_id as usize).copied().ok_or_else(|| {
            SegpatchError::inconsistent(format!(
                "document {doc_id} out of range for segment {segment_id} ({} docs)",
                mapping.len()
            ))
        })
    }
}

/// Statistics of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Target segment id.
    pub target_segment: SegmentId,
    /// Number of source segments.
    pub segments_merged: usize,
    /// Documents in the target segment.
    pub target_doc_count: u32,
    /// Documents dropped as deleted.
    pub docs_removed: u64,
    /// Normal terms written.
    pub terms_written: usize,
    /// High-frequency (bitmap) terms written.
    pub high_frequency_terms: usize,
    /// Normal postings written.
    pub postings_written: u64,
    /// Source terms that had patch deltas applied.
    pub patched_terms: usize,
    /// Terms whose merged posting list came out empty.
    pub terms_dropped: usize,
    /// Wall-clock duration in milliseconds.
    pub elapsed_ms: u64,
}

/// A merge of several sources into one target segment.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// Id of the segment to produce.
    pub target_segment: SegmentId,
    /// Segments to consolidate.
    pub sources: Vec<MergeSource>,
}

/// Merges segments term by term.
#[derive(Debug, Clone, Default)]
pub struct SegmentMerger {
    config: MergeConfig,
}

impl SegmentMerger {
    /// Create a merger.
    pub fn new(config: MergeConfig) -> Self {
        SegmentMerger { config }
    }

    /// Merge configuration.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Consolidate `sources` into segment `target_segment`.
    pub fn merge(
        &self,
        target_segment: SegmentId,
        sources: &[MergeSource],
    ) -> Result<(SegmentPostings, MergeStats)> {
        let start = Instant::now();
        if let Some(duplicate) = sources.iter().enumerate().find_map(|(i, source)| {
            sources[..i]
                .iter()
                .any(|other| other.segment_id() == source.segment_id())
                .then_some(source.segment_id())
        }) {
            return Err(SegpatchError::invalid_argument(format!(
                "segment {duplicate} listed twice in merge"
            )));
        }

        let doc_map = DocIdMap::new(sources)?;
        let mut output = SegmentPostings::new(target_segment, doc_map.target_doc_count());
        let mut stats = MergeStats {
            target_segment,
            segments_merged: sources.len(),
            target_doc_count: doc_map.target_doc_count(),
            docs_removed: sources
                .iter()
                .map(|s| s.postings.doc_count() as u64)
                .sum::<u64>()
                - doc_map.target_doc_count() as u64,
            ..Default::default()
        };

        let mut normal = self.queue_for(IndexMode::Normal, sources)?;
        self.merge_queue(&mut normal, &doc_map, &mut output, &mut stats)?;

        let mut high_frequency = self.queue_for(IndexMode::HighFrequency, sources)?;
        let bitmap_terms = collect_terms(&mut high_frequency)?;
        self.promote_high_frequency(&mut output, &mut stats, &bitmap_terms);

        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "merged {} segments into segment {target_segment}: {} docs, {} terms, {} bitmap terms, {} patched terms",
            stats.segments_merged,
            stats.target_doc_count,
            stats.terms_written,
            stats.high_frequency_terms,
            stats.patched_terms
        );
        Ok((output, stats))
    }

    /// Run independent merges in parallel, at most `parallelism` at a time.
    ///
    /// Results come back in plan order; any failure fails the whole call.
    pub fn merge_destinations(
        &self,
        plans: &[MergePlan],
    ) -> Result<Vec<(SegmentPostings, MergeStats)>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism.max(1))
            .build()
            .map_err(|e| SegpatchError::Anyhow(anyhow::anyhow!("merge thread pool: {e}")))?;

        pool.install(|| {
            plans
                .par_iter()
                .map(|plan| self.merge(plan.target_segment, &plan.sources))
                .collect()
        })
    }

    /// Load the base postings and patches of `segments` in parallel.
    ///
    /// Postings are read from `segment_<id>/<index_name>.postings`.
    pub fn load_sources(
        &self,
        storage: &dyn Storage,
        index_name: &str,
        segments: &[SegmentId],
        shard_count: u32,
        compression: PatchCompression,
    ) -> Result<Vec<MergeSource>> {
        segments
            .par_iter()
            .map(|&segment| {
                let postings = SegmentPostings::read_from_storage(
                    storage,
                    &postings_file_path(segment, index_name),
                )?;
                if postings.segment_id() != segment {
                    return Err(SegpatchError::inconsistent(format!(
                        "postings of segment {segment} claim segment {}",
                        postings.segment_id()
                    )));
                }
                let patches =
                    PatchIndexReader::open(storage, index_name, segment, shard_count, compression)?;
                let source = MergeSource::new(Arc::new(postings));
                Ok(if patches.is_empty() {
                    source
                } else {
                    source.with_patches(Arc::new(patches))
                })
            })
            .collect()
    }

    fn queue_for(&self, mode: IndexMode, sources: &[MergeSource]) -> Result<TermMergeQueue> {
        let mut queue = TermMergeQueue::new(mode);
        for source in sources {
            let mut info = SegmentTermInfo::from_postings(Arc::clone(&source.postings), mode);
            if let Some(patches) = &source.patches {
                info = info.with_patches(Arc::clone(patches));
            }
            queue.add(info)?;
        }
        Ok(queue)
    }

    fn merge_queue(
        &self,
        queue: &mut TermMergeQueue,
        doc_map: &DocIdMap,
        output: &mut SegmentPostings,
        stats: &mut MergeStats,
    ) -> Result<()> {
        loop {
            let infos = queue.current_term_infos()?;
            let Some(term) = infos.first().and_then(|info| info.current_term()) else {
                break;
            };

            let mut docs = Vec::new();
            for info in infos.iter_mut() {
                if info.patch_deltas().is_some() {
                    stats.patched_terms += 1;
                }
                let segment = info.segment_id();
                for doc in info.merged_postings()? {
                    if let Some(mapped) = doc_map.map(segment, doc)? {
                        docs.push(mapped);
                    }
                }
            }
            docs.sort_unstable();
            docs.dedup();

            if docs.is_empty() {
                stats.terms_dropped += 1;
            } else {
                stats.terms_written += 1;
                stats.postings_written += docs.len() as u64;
                output.set_postings(term, IndexMode::Normal, docs);
            }
            queue.move_to_next_term()?;
        }
        debug!("normal queue drained for segment {}", output.segment_id());
        Ok(())
    }

    /// Give a bitmap to every term that had one in some source or that
    /// reaches the threshold. Bitmaps are copies of the merged normal list.
    fn promote_high_frequency(
        &self,
        output: &mut SegmentPostings,
        stats: &mut MergeStats,
        bitmap_terms: &[TermKey],
    ) {
        let threshold = self.config.high_frequency_threshold;
        for term in output.terms(IndexMode::Normal) {
            let carried = bitmap_terms.binary_search(&term).is_ok();
            if let Some(docs) = output.postings(term, IndexMode::Normal)
                && (carried || (threshold > 0 && docs.len() >= threshold))
            {
                output.set_postings(term, IndexMode::HighFrequency, docs);
                stats.high_frequency_terms += 1;
            }
        }
    }
}

/// Drain a queue, returning its terms in order.
fn collect_terms(queue: &mut TermMergeQueue) -> Result<Vec<TermKey>> {
    let mut terms = Vec::new();
    loop {
        let infos = queue.current_term_infos()?;
        let Some(term) = infos.first().and_then(|info| info.current_term()) else {
            break;
        };
        terms.push(term);
        queue.move_to_next_term()?;
    }
    Ok(terms)
}

/// Storage path of a segment's base postings for one index.
pub fn postings_file_path(segment: SegmentId, index_name: &str) -> String {
    format!("segment_{segment}/{index_name}.postings")
}
