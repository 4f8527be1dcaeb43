//! Build-time term merge queue.
//!
//! When segments are consolidated, every source segment contributes a cursor
//! over its terms: the base postings of the segment with its outstanding patch
//! deltas overlaid. [`TermMergeQueue`] merges those cursors so that each call to
//! [`TermMergeQueue::current_term_infos`] yields every segment's contribution to
//! the next term, in strictly ascending term order.
//!
//! Normal and high-frequency postings are merged in separate queues, one per
//! [`IndexMode`]. A high-frequency cursor only visits the terms of its base
//! bitmap dictionary; patch deltas for other terms flow through the normal
//! queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::core::doc_delta::{DocDelta, DocId};
use crate::lexical::core::posting::{IndexMode, SegmentPostings, SegmentTermIterator, TermPostingIterator};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::index_reader::PatchIndexReader;

type IteratorFactory = Box<dyn FnOnce() -> Result<Box<dyn TermPostingIterator>> + Send>;

enum BaseSource {
    Pending(IteratorFactory),
    Ready(Box<dyn TermPostingIterator>),
    Taken,
}

impl fmt::Debug for BaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseSource::Pending(_) => f.write_str("Pending"),
            BaseSource::Ready(iter) => f.debug_tuple("Ready").field(iter).finish(),
            BaseSource::Taken => f.write_str("Taken"),
        }
    }
}

/// One segment's cursor in a [`TermMergeQueue`].
///
/// The base iterator is created on the first access to the cursor's term key,
/// and a term's postings are decoded only when asked for.
#[derive(Debug)]
pub struct SegmentTermInfo {
    segment_id: SegmentId,
    mode: IndexMode,
    base: BaseSource,
    base_term: Option<TermKey>,
    patches: Option<Arc<PatchIndexReader>>,
    patch_terms: Vec<TermKey>,
    patch_position: usize,
}

impl SegmentTermInfo {
    /// Cursor whose base iterator is built by `factory` on first use.
    pub fn new<F>(segment_id: SegmentId, mode: IndexMode, factory: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn TermPostingIterator>> + Send + 'static,
    {
        SegmentTermInfo {
            segment_id,
            mode,
            base: BaseSource::Pending(Box::new(factory)),
            base_term: None,
            patches: None,
            patch_terms: Vec::new(),
            patch_position: 0,
        }
    }

    /// Cursor over in-memory segment postings.
    pub fn from_postings(postings: Arc<SegmentPostings>, mode: IndexMode) -> Self {
        let segment_id = postings.segment_id();
        Self::new(segment_id, mode, move || {
            Ok(Box::new(SegmentTermIterator::new(postings, mode)) as Box<dyn TermPostingIterator>)
        })
    }

    /// Overlay the outstanding patches of the segment.
    pub fn with_patches(mut self, patches: Arc<PatchIndexReader>) -> Self {
        self.patch_terms = match self.mode {
            IndexMode::Normal => patches.terms().collect(),
            IndexMode::HighFrequency => Vec::new(),
        };
        self.patch_position = 0;
        self.patches = Some(patches);
        self
    }

    /// Segment of the cursor.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Index mode of the cursor.
    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    fn initialize(&mut self) -> Result<()> {
        if let BaseSource::Pending(_) = self.base {
            let BaseSource::Pending(factory) = std::mem::replace(&mut self.base, BaseSource::Taken)
            else {
                return Ok(());
            };
            let iter = factory()?;
            self.base_term = iter.current_term();
            self.base = BaseSource::Ready(iter);
            trace!(
                "initialized {:?} cursor of segment {}",
                self.mode, self.segment_id
            );
        }
        Ok(())
    }

    fn patch_term(&self) -> Option<TermKey> {
        self.patch_terms.get(self.patch_position).copied()
    }

    /// Term the cursor is positioned at, `None` once exhausted.
    pub fn current_term(&self) -> Option<TermKey> {
        match (self.base_term, self.patch_term()) {
            (Some(base), Some(patch)) => Some(base.min(patch)),
            (base, patch) => base.or(patch),
        }
    }

    /// Whether the current term exists in the base postings.
    pub fn in_base(&self) -> bool {
        self.base_term.is_some() && self.base_term == self.current_term()
    }

    /// Base postings of the current term; empty for patch-only terms.
    pub fn base_postings(&mut self) -> Result<Vec<DocId>> {
        if !self.in_base() {
            return Ok(Vec::new());
        }
        match &mut self.base {
            BaseSource::Ready(iter) => iter.read_postings(),
            _ => Err(SegpatchError::inconsistent(format!(
                "cursor of segment {} read before initialization",
                self.segment_id
            ))),
        }
    }

    /// Patch deltas of the current term.
    pub fn patch_deltas(&self) -> Option<&[DocDelta]> {
        let term = self.current_term()?;
        self.patches.as_ref()?.lookup(term)
    }

    /// Base postings with the patch deltas applied: adds insert the document,
    /// removes drop it.
    pub fn merged_postings(&mut self) -> Result<Vec<DocId>> {
        let base = self.base_postings()?;
        match self.patch_deltas() {
            Some(deltas) => Ok(apply_deltas(&base, deltas)),
            None => Ok(base),
        }
    }

    fn advance(&mut self) -> Result<()> {
        let Some(term) = self.current_term() else {
            return Ok(());
        };

        if self.base_term == Some(term) {
            if let BaseSource::Ready(iter) = &mut self.base {
                iter.advance()?;
                self.base_term = iter.current_term();
            }
        }
        if self.patch_term() == Some(term) {
            self.patch_position += 1;
        }
        Ok(())
    }
}

/// Overlay `deltas` on ascending `base` doc ids.
pub fn apply_deltas(base: &[DocId], deltas: &[DocDelta]) -> Vec<DocId> {
    let mut merged = Vec::with_capacity(base.len() + deltas.len());
    let mut base = base.iter().copied().peekable();

    for delta in deltas {
        while let Some(doc) = base.next_if(|&doc| doc < delta.doc_id()) {
            merged.push(doc);
        }
        base.next_if_eq(&delta.doc_id());
        if !delta.is_delete() {
            merged.push(delta.doc_id());
        }
    }
    merged.extend(base);
    merged
}

struct QueueEntry {
    term: TermKey,
    info: SegmentTermInfo,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (term, segment id).
        other
            .term
            .cmp(&self.term)
            .then_with(|| other.info.segment_id.cmp(&self.info.segment_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge of per-segment term cursors for one index mode.
pub struct TermMergeQueue {
    mode: IndexMode,
    pending: Vec<SegmentTermInfo>,
    heap: BinaryHeap<QueueEntry>,
    current: Vec<SegmentTermInfo>,
    current_term: Option<TermKey>,
    last_term: Option<TermKey>,
}

impl fmt::Debug for TermMergeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TermMergeQueue")
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .field("queued", &self.heap.len())
            .field("current_term", &self.current_term)
            .finish()
    }
}

impl TermMergeQueue {
    /// Create an empty queue for `mode`.
    pub fn new(mode: IndexMode) -> Self {
        TermMergeQueue {
            mode,
            pending: Vec::new(),
            heap: BinaryHeap::new(),
            current: Vec::new(),
            current_term: None,
            last_term: None,
        }
    }

    /// Index mode of the queue.
    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    /// Add a segment cursor. It is initialized when the queue first needs it.
    pub fn add(&mut self, info: SegmentTermInfo) -> Result<()> {
        if info.mode != self.mode {
            return Err(SegpatchError::invalid_argument(format!(
                "{:?} cursor of segment {} added to a {:?} queue",
                info.mode, info.segment_id, self.mode
            )));
        }
        self.pending.push(info);
        Ok(())
    }

    /// Term of the current bundle.
    pub fn current_term(&self) -> Option<TermKey> {
        self.current_term
    }

    /// The cursors positioned at the smallest outstanding term, ordered by
    /// segment id. Empty once every cursor is exhausted.
    pub fn current_term_infos(&mut self) -> Result<&mut [SegmentTermInfo]> {
        if self.current.is_empty() {
            self.fill_pending()?;
            self.pop_bundle()?;
        }
        Ok(&mut self.current)
    }

    /// Advance every cursor of the current bundle past its term.
    pub fn move_to_next_term(&mut self) -> Result<()> {
        for mut info in std::mem::take(&mut self.current) {
            info.advance()?;
            self.push(info);
        }
        self.current_term = None;
        Ok(())
    }

    /// Whether no term remains.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.heap.is_empty() && self.current.is_empty()
    }

    fn fill_pending(&mut self) -> Result<()> {
        for mut info in std::mem::take(&mut self.pending) {
            info.initialize()?;
            self.push(info);
        }
        Ok(())
    }

    fn push(&mut self, info: SegmentTermInfo) {
        if let Some(term) = info.current_term() {
            self.heap.push(QueueEntry { term, info });
        }
    }

    fn pop_bundle(&mut self) -> Result<()> {
        let Some(first) = self.heap.pop() else {
            return Ok(());
        };
        let term = first.term;

        if let Some(last) = self.last_term
            && term <= last
        {
            return Err(SegpatchError::inconsistent(format!(
                "term {term} revisited after {last} in segment {}",
                first.info.segment_id
            )));
        }

        self.current.push(first.info);
        while self.heap.peek().is_some_and(|entry| entry.term == term) {
            if let Some(entry) = self.heap.pop() {
                self.current.push(entry.info);
            }
        }

        self.current_term = Some(term);
        self.last_term = Some(term);
        Ok(())
    }
}
