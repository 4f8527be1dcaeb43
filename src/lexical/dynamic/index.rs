//! Dynamic trees of one updatable field in one segment.
//!
//! [`DynamicIndexSegment`] owns the segment's [`NodeArena`] and a tree per
//! term, created on the first update that mentions the term. Dumping the
//! segment hands the live structure to [`PersistedResources`]; a
//! [`DynamicIndexReader`] opened from there reads the very same trees, so
//! updates applied after the dump stay visible.

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info};
use parking_lot::RwLock;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::DynamicTreeConfig;
use crate::lexical::core::doc_delta::{DocDelta, DocId};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::dynamic::arena::{ArenaStats, NodeArena};
use crate::lexical::dynamic::resource::{PersistedResources, dynamic_resource_name};
use crate::lexical::dynamic::tree::{DynamicPostingTree, TreeCursor};

/// Term trees of one (field, segment).
#[derive(Debug)]
pub struct DynamicIndexSegment {
    field: String,
    arena: Arc<NodeArena>,
    trees: RwLock<AHashMap<TermKey, Arc<DynamicPostingTree>>>,
}

impl DynamicIndexSegment {
    /// Create the dynamic index of `field` in `segment_id`.
    pub fn new(field: impl Into<String>, segment_id: SegmentId, config: &DynamicTreeConfig) -> Self {
        DynamicIndexSegment {
            field: field.into(),
            arena: Arc::new(NodeArena::new(segment_id, config)),
            trees: RwLock::new(AHashMap::new()),
        }
    }

    /// Field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Segment id.
    pub fn segment_id(&self) -> SegmentId {
        self.arena.segment_id()
    }

    /// Apply an add or delete of `doc_id` under `term`.
    ///
    /// Fails only when the segment's arena is exhausted, which leaves the
    /// segment unusable.
    pub fn update(&self, doc_id: DocId, term: TermKey, is_delete: bool) -> Result<()> {
        self.tree_for_update(term)?.update(doc_id, is_delete)?;
        Ok(())
    }

    /// Tree of `term`, `None` when the term was never updated.
    pub fn lookup(&self, term: TermKey) -> Option<Arc<DynamicPostingTree>> {
        self.trees.read().get(&term).cloned()
    }

    /// Number of terms with a tree.
    pub fn term_count(&self) -> usize {
        self.trees.read().len()
    }

    /// Terms with a tree, ascending.
    pub fn terms(&self) -> Vec<TermKey> {
        let mut terms: Vec<TermKey> = self.trees.read().keys().copied().collect();
        terms.sort();
        terms
    }

    /// Memory counters of the segment arena.
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Hand the live trees over to `resources`. Returns the resource name.
    pub fn dump(self: &Arc<Self>, resources: &PersistedResources) -> Result<String> {
        let name = dynamic_resource_name(&self.field);
        resources.register(&name, Arc::clone(self))?;

        let stats = self.arena.stats();
        info!(
            "segment {}: handed off {} dynamic trees of {} as {name} ({} bytes)",
            self.segment_id(),
            self.term_count(),
            self.field,
            stats.allocated_bytes
        );
        Ok(name)
    }

    fn tree_for_update(&self, term: TermKey) -> Result<Arc<DynamicPostingTree>> {
        if let Some(tree) = self.trees.read().get(&term) {
            return Ok(Arc::clone(tree));
        }

        let mut trees = self.trees.write();
        if let Some(tree) = trees.get(&term) {
            return Ok(Arc::clone(tree));
        }
        let tree = Arc::new(DynamicPostingTree::new(term, Arc::clone(&self.arena))?);
        trees.insert(term, Arc::clone(&tree));
        debug!(
            "segment {}: new dynamic tree for {} term {term}",
            self.segment_id(),
            self.field
        );
        Ok(tree)
    }
}

/// Read access to dynamic trees reopened from a dumped segment.
#[derive(Debug, Clone)]
pub struct DynamicIndexReader {
    index: Arc<DynamicIndexSegment>,
}

impl DynamicIndexReader {
    /// Reopen the dynamic trees of `field` from `resources`.
    pub fn open(resources: &PersistedResources, field: &str) -> Result<Self> {
        let name = dynamic_resource_name(field);
        let index = resources
            .get::<DynamicIndexSegment>(&name)?
            .ok_or_else(|| SegpatchError::storage(format!("resource {name} not found")))?;
        Ok(DynamicIndexReader { index })
    }

    /// Field name.
    pub fn field(&self) -> &str {
        self.index.field()
    }

    /// Segment id.
    pub fn segment_id(&self) -> SegmentId {
        self.index.segment_id()
    }

    /// Current deltas of `term`, `None` when the term has no tree.
    pub fn lookup(&self, term: TermKey) -> Option<Vec<DocDelta>> {
        self.index.lookup(term).map(|tree| tree.to_vec())
    }

    /// Live documents of `term`.
    pub fn live_docs(&self, term: TermKey) -> Vec<DocId> {
        self.index
            .lookup(term)
            .map(|tree| tree.live_docs())
            .unwrap_or_default()
    }

    /// Delta cursor over `term`.
    pub fn cursor(&self, term: TermKey) -> Option<TreeCursor> {
        self.index.lookup(term).map(|tree| tree.cursor())
    }

    /// Terms with a tree, ascending.
    pub fn terms(&self) -> Vec<TermKey> {
        self.index.terms()
    }

    /// Memory counters of the segment arena.
    pub fn arena_stats(&self) -> ArenaStats {
        self.index.arena_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(quota: Option<u64>) -> Arc<DynamicIndexSegment> {
        Arc::new(DynamicIndexSegment::new(
            "title",
            4,
            &DynamicTreeConfig {
                node_capacity: 8,
                memory_quota_bytes: quota,
            },
        ))
    }

    #[test]
    fn test_trees_created_lazily() {
        let index = segment(None);
        assert!(index.lookup(TermKey::new(1)).is_none());

        index.update(3, TermKey::new(1), false).unwrap();
        index.update(2, TermKey::NULL, false).unwrap();
        index.update(3, TermKey::new(1), true).unwrap();
        assert_eq!(index.term_count(), 2);
        assert_eq!(index.terms(), vec![TermKey::new(1), TermKey::NULL]);

        let tree = index.lookup(TermKey::new(1)).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.get(3).unwrap().is_delete());
    }

    #[test]
    fn test_dump_handoff_shares_trees() {
        let index = segment(None);
        for doc in 0..20 {
            index.update(doc, TermKey::new(9), doc % 4 == 0).unwrap();
        }

        let resources = PersistedResources::new();
        let name = index.dump(&resources).unwrap();
        assert_eq!(name, "title_@_dynamic_index.trees");

        let reader = DynamicIndexReader::open(&resources, "title").unwrap();
        assert_eq!(reader.segment_id(), 4);
        assert_eq!(reader.lookup(TermKey::new(9)).unwrap().len(), 20);
        assert!(reader.lookup(TermKey::new(8)).is_none());

        // Updates after the handoff are visible through the reader.
        index.update(0, TermKey::new(9), false).unwrap();
        assert!(reader.live_docs(TermKey::new(9)).contains(&0));
        assert_eq!(reader.arena_stats(), index.arena_stats());

        assert!(index.dump(&resources).is_err());
        assert!(DynamicIndexReader::open(&resources, "body").is_err());
    }

    #[test]
    fn test_exhausted_arena_fails_updates() {
        let index = segment(Some(4096));
        let mut failure = None;
        for doc in 0..10_000 {
            if let Err(err) = index.update(doc, TermKey::new(doc as u64 % 7), false) {
                failure = Some(err);
                break;
            }
        }
        let err = failure.unwrap();
        assert!(err.is_fatal_to_segment());
        assert!(index.update(0, TermKey::new(100), false).is_err());
    }
}
