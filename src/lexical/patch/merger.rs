//! Cross-segment patch merge.
//!
//! Several patch files may target the same destination segment, one per source
//! segment that recorded updates against it. [`PatchMerger`] composes them into
//! one term-ordered view: terms come out ascending, and within a term documents
//! come out ascending with exactly one delta per document. When sources disagree
//! about a document, the source with the larger segment id wins, since larger
//! ids belong to more recently produced patches.
//!
//! The same tie-break is available for arbitrary delta sources through
//! [`DeltaCursor`] and [`merge_overlay`].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::{debug, trace};

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::core::doc_delta::{DocDelta, DocId};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::reader::PatchFileReader;

/// An ordered source of deltas for one term.
pub trait DeltaCursor {
    /// Current delta, `None` once exhausted.
    fn peek(&self) -> Option<DocDelta>;

    /// Move past the current delta.
    fn advance(&mut self) -> Result<()>;

    /// Segment that produced the deltas; larger ids win ties.
    fn source_id(&self) -> SegmentId;
}

impl<C: DeltaCursor + ?Sized> DeltaCursor for Box<C> {
    fn peek(&self) -> Option<DocDelta> {
        (**self).peek()
    }

    fn advance(&mut self) -> Result<()> {
        (**self).advance()
    }

    fn source_id(&self) -> SegmentId {
        (**self).source_id()
    }
}

/// [`DeltaCursor`] over an in-memory, strictly ascending delta list.
#[derive(Debug, Clone)]
pub struct VecDeltaCursor {
    source: SegmentId,
    deltas: Vec<DocDelta>,
    position: usize,
}

impl VecDeltaCursor {
    /// Cursor over `deltas`, attributed to `source`.
    pub fn new(source: SegmentId, deltas: Vec<DocDelta>) -> Self {
        VecDeltaCursor {
            source,
            deltas,
            position: 0,
        }
    }
}

impl DeltaCursor for VecDeltaCursor {
    fn peek(&self) -> Option<DocDelta> {
        self.deltas.get(self.position).copied()
    }

    fn advance(&mut self) -> Result<()> {
        if self.position < self.deltas.len() {
            self.position += 1;
        }
        Ok(())
    }

    fn source_id(&self) -> SegmentId {
        self.source
    }
}

/// A patch reader is a cursor over its current term.
impl DeltaCursor for PatchFileReader {
    fn peek(&self) -> Option<DocDelta> {
        PatchFileReader::peek(self)
    }

    fn advance(&mut self) -> Result<()> {
        PatchFileReader::next(self).map(|_| ())
    }

    fn source_id(&self) -> SegmentId {
        self.source_segment()
    }
}

/// Heap of cursors ordered by (doc id asc, source id desc).
#[derive(Debug, Default)]
struct DocHeap {
    heap: BinaryHeap<Reverse<(DocId, Reverse<SegmentId>, usize)>>,
}

impl DocHeap {
    fn push<C: DeltaCursor + ?Sized>(&mut self, index: usize, cursor: &C) {
        if let Some(delta) = cursor.peek() {
            self.heap
                .push(Reverse((delta.doc_id(), Reverse(cursor.source_id()), index)));
        }
    }

    fn clear(&mut self) {
        self.heap.clear();
    }

    /// Pop the winning delta of the smallest document and advance every cursor
    /// that carried that document.
    fn pop_winner<C: DeltaCursor>(&mut self, cursors: &mut [C]) -> Result<Option<DocDelta>> {
        let Some(Reverse((doc_id, _, winner))) = self.heap.pop() else {
            return Ok(None);
        };

        let cursor = &mut cursors[winner];
        let delta = cursor
            .peek()
            .ok_or_else(|| SegpatchError::inconsistent("delta cursor drained under the merger"))?;
        cursor.advance()?;
        self.push(winner, &cursors[winner]);

        while let Some(&Reverse((next_doc, Reverse(source), index))) = self.heap.peek() {
            if next_doc != doc_id {
                break;
            }
            self.heap.pop();
            trace!(
                "document {doc_id}: source {source} superseded by source {}",
                cursors[winner].source_id()
            );
            cursors[index].advance()?;
            self.push(index, &cursors[index]);
        }

        // Sources are strictly ascending; anything smaller now is a malformed source.
        if let Some(Reverse((next_doc, _, _))) = self.heap.peek()
            && *next_doc < doc_id
        {
            return Err(SegpatchError::inconsistent(format!(
                "delta source went backwards from document {doc_id} to {next_doc}"
            )));
        }

        Ok(Some(delta))
    }
}

/// Merge delta sources for one term into a single ascending list.
///
/// Each document appears once; when several sources carry it, the delta of the
/// source with the largest [`DeltaCursor::source_id`] is kept.
pub fn merge_overlay<C: DeltaCursor>(cursors: &mut [C]) -> Result<Vec<DocDelta>> {
    let mut heap = DocHeap::default();
    for (index, cursor) in cursors.iter().enumerate() {
        heap.push(index, cursor);
    }

    let mut merged = Vec::new();
    while let Some(delta) = heap.pop_winner(cursors)? {
        merged.push(delta);
    }
    Ok(merged)
}

#[derive(Debug, PartialEq, Eq)]
struct TermHeapEntry {
    term: TermKey,
    doc_id: DocId,
    source: SegmentId,
    index: usize,
}

impl Ord for TermHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse term and doc, keep source descending.
        other
            .term
            .cmp(&self.term)
            .then_with(|| other.doc_id.cmp(&self.doc_id))
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for TermHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge of the patch files of one destination segment.
///
/// ```no_run
/// # use segpatch::lexical::patch::merger::PatchMerger;
/// # fn run(mut merger: PatchMerger) -> segpatch::error::Result<()> {
/// while let Some(term) = merger.next_term()? {
///     while let Some(delta) = merger.next_delta()? {
///         println!("{term}: {delta:?}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PatchMerger {
    readers: Vec<PatchFileReader>,
    terms: BinaryHeap<TermHeapEntry>,
    active: Vec<usize>,
    docs: DocHeap,
    current_term: Option<TermKey>,
    dst_segment: Option<SegmentId>,
}

impl PatchMerger {
    /// Merge `readers`, which must all address the same destination segment and
    /// come from distinct source segments.
    pub fn new(readers: Vec<PatchFileReader>) -> Result<Self> {
        let dst_segment = readers.first().map(PatchFileReader::destination_segment);
        for (i, reader) in readers.iter().enumerate() {
            if Some(reader.destination_segment()) != dst_segment {
                return Err(SegpatchError::invalid_argument(format!(
                    "{} targets segment {}, expected {}",
                    reader.name(),
                    reader.destination_segment(),
                    dst_segment.unwrap_or_default()
                )));
            }
            if readers[..i]
                .iter()
                .any(|other| other.source_segment() == reader.source_segment())
            {
                return Err(SegpatchError::invalid_argument(format!(
                    "two patch files from source segment {}",
                    reader.source_segment()
                )));
            }
        }

        debug!(
            "merging {} patch files for destination segment {}",
            readers.len(),
            dst_segment
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        let mut merger = PatchMerger {
            readers,
            terms: BinaryHeap::new(),
            active: Vec::new(),
            docs: DocHeap::default(),
            current_term: None,
            dst_segment,
        };
        for index in 0..merger.readers.len() {
            merger.push_term(index);
        }
        Ok(merger)
    }

    /// Destination segment, `None` when merging no files.
    pub fn destination_segment(&self) -> Option<SegmentId> {
        self.dst_segment
    }

    /// Number of merged files.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Sum of the readers' decoded-memory estimates.
    pub fn estimate_expand_memory(&self) -> usize {
        self.readers
            .iter()
            .map(PatchFileReader::estimate_expand_memory)
            .sum()
    }

    /// Sum of the readers' delta counts.
    pub fn total_item_count(&self) -> u64 {
        self.readers
            .iter()
            .map(PatchFileReader::total_item_count)
            .sum()
    }

    /// Term currently being drained.
    pub fn current_term(&self) -> Option<TermKey> {
        self.current_term
    }

    /// Advance to the next term. Deltas of the previous term that were not
    /// pulled are discarded.
    pub fn next_term(&mut self) -> Result<Option<TermKey>> {
        for index in std::mem::take(&mut self.active) {
            self.readers[index].skip_current_term()?;
            self.push_term(index);
        }
        self.docs.clear();

        let Some(first) = self.terms.pop() else {
            self.current_term = None;
            return Ok(None);
        };
        let term = first.term;
        self.active.push(first.index);
        while self.terms.peek().is_some_and(|entry| entry.term == term) {
            if let Some(entry) = self.terms.pop() {
                self.active.push(entry.index);
            }
        }

        for &index in &self.active {
            self.docs.push(index, &self.readers[index]);
        }
        self.current_term = Some(term);
        Ok(Some(term))
    }

    /// Next delta of the current term in ascending document order.
    pub fn next_delta(&mut self) -> Result<Option<DocDelta>> {
        if self.current_term.is_none() {
            return Ok(None);
        }
        self.docs.pop_winner(&mut self.readers)
    }

    /// Drain the current term into a list.
    pub fn current_term_deltas(&mut self) -> Result<Vec<DocDelta>> {
        let mut deltas = Vec::new();
        while let Some(delta) = self.next_delta()? {
            deltas.push(delta);
        }
        Ok(deltas)
    }

    /// Drain every remaining term.
    pub fn read_all(mut self) -> Result<Vec<(TermKey, Vec<DocDelta>)>> {
        let mut terms = Vec::new();
        while let Some(term) = self.next_term()? {
            terms.push((term, self.current_term_deltas()?));
        }
        Ok(terms)
    }

    fn push_term(&mut self, index: usize) {
        let reader = &self.readers[index];
        if let Some(term) = reader.current_term_key() {
            self.terms.push(TermHeapEntry {
                term,
                doc_id: reader.peek().map(|d| d.doc_id()).unwrap_or_default(),
                source: reader.source_segment(),
                index,
            });
        }
    }
}
