//! Copy-on-write B-link tree of document deltas.
//!
//! A [`DynamicPostingTree`] holds the postings of one term of an updatable
//! field as [`DocDelta`] entries ordered by document id. Nodes are immutable
//! snapshots stored in arena [`NodeSlot`]s; a mutation builds replacement
//! snapshots and swaps them into their slots, retiring the old ones to the
//! arena.
//!
//! Every node carries a high key, the smallest document id that no longer
//! belongs to it, and a link to its right sibling. A split publishes the new
//! right sibling first, then the shrunk left node (with its high key and
//! link), then the separator in the parent. A reader that lands on a node whose
//! high key is at or below its target moves right, so it always finds its
//! document in either the whole pre-split node or the post-split pair.
//!
//! Writers of one tree are serialized; readers never block on them beyond a
//! single slot read lock.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::core::doc_delta::{DocDelta, DocId};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::dynamic::arena::{EpochGuard, NodeArena};
use crate::lexical::patch::merger::DeltaCursor;

/// Leaf node: entries plus sibling links.
#[derive(Debug, Clone)]
pub struct LeafNode {
    entries: Vec<DocDelta>,
    high_key: Option<DocId>,
    next: Weak<NodeSlot>,
    prev: Weak<NodeSlot>,
}

/// Internal node: `children[i]` covers `[keys[i - 1], keys[i])`.
#[derive(Debug, Clone)]
pub struct InternalNode {
    keys: Vec<DocId>,
    children: Vec<Arc<NodeSlot>>,
    high_key: Option<DocId>,
    right: Weak<NodeSlot>,
}

impl InternalNode {
    fn child_for(&self, doc_id: DocId) -> &Arc<NodeSlot> {
        let idx = self.keys.partition_point(|key| *key <= doc_id);
        &self.children[idx]
    }
}

/// An immutable node snapshot.
#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    /// An unlinked leaf holding `entries`.
    pub fn leaf(entries: Vec<DocDelta>) -> Self {
        Node::Leaf(LeafNode {
            entries,
            high_key: None,
            next: Weak::new(),
            prev: Weak::new(),
        })
    }

    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Leaf entries; empty for internal nodes.
    pub fn entries(&self) -> &[DocDelta] {
        match self {
            Node::Leaf(leaf) => &leaf.entries,
            Node::Internal(_) => &[],
        }
    }

    /// Smallest document id beyond this node, `None` for the rightmost node of a level.
    pub fn high_key(&self) -> Option<DocId> {
        match self {
            Node::Leaf(leaf) => leaf.high_key,
            Node::Internal(inner) => inner.high_key,
        }
    }

    fn right_link(&self) -> &Weak<NodeSlot> {
        match self {
            Node::Leaf(leaf) => &leaf.next,
            Node::Internal(inner) => &inner.right,
        }
    }

    /// Bytes accounted to the arena for this snapshot.
    pub fn memory_size(&self) -> u64 {
        let payload = match self {
            Node::Leaf(leaf) => leaf.entries.capacity() * mem::size_of::<DocDelta>(),
            Node::Internal(inner) => {
                inner.keys.capacity() * mem::size_of::<DocId>()
                    + inner.children.capacity() * mem::size_of::<Arc<NodeSlot>>()
            }
        };
        (mem::size_of::<Node>() + payload) as u64
    }
}

/// A node location whose snapshot is swapped atomically.
pub struct NodeSlot {
    id: u64,
    current: RwLock<Arc<Node>>,
}

impl NodeSlot {
    pub(crate) fn new(id: u64, node: Node) -> Self {
        NodeSlot {
            id,
            current: RwLock::new(Arc::new(node)),
        }
    }

    /// Arena-wide slot id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Node> {
        Arc::clone(&self.current.read())
    }

    /// Publish `node`, returning the replaced snapshot.
    pub(crate) fn replace(&self, node: Node) -> Arc<Node> {
        mem::replace(&mut *self.current.write(), Arc::new(node))
    }
}

impl fmt::Debug for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSlot").field("id", &self.id).finish()
    }
}

/// Postings of one term as a B-link tree.
#[derive(Debug)]
pub struct DynamicPostingTree {
    term: TermKey,
    arena: Arc<NodeArena>,
    root: RwLock<Arc<NodeSlot>>,
    writer: Mutex<()>,
    len: AtomicUsize,
    height: AtomicUsize,
}

impl DynamicPostingTree {
    /// Create an empty tree for `term` in `arena`.
    pub fn new(term: TermKey, arena: Arc<NodeArena>) -> Result<Self> {
        let root = arena.new_slot(Node::leaf(Vec::new()))?;
        Ok(DynamicPostingTree {
            term,
            arena,
            root: RwLock::new(root),
            writer: Mutex::new(()),
            len: AtomicUsize::new(0),
            height: AtomicUsize::new(1),
        })
    }

    /// Term of the tree.
    pub fn term(&self) -> TermKey {
        self.term
    }

    /// Arena backing the tree.
    pub fn arena(&self) -> &Arc<NodeArena> {
        &self.arena
    }

    /// Number of distinct documents.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the tree holds no document.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of levels.
    pub fn height(&self) -> usize {
        self.height.load(Ordering::Acquire)
    }

    /// Record an add or delete of `doc_id`; the last event for a document wins.
    ///
    /// Returns `true` when the document was not in the tree before.
    pub fn update(&self, doc_id: DocId, is_delete: bool) -> Result<bool> {
        self.insert(DocDelta::try_new(doc_id, is_delete)?)
    }

    /// Insert `delta`, overwriting the flag of an existing entry for its document.
    pub fn insert(&self, delta: DocDelta) -> Result<bool> {
        let _writer = self.writer.lock();
        let doc_id = delta.doc_id();

        let mut path = Vec::new();
        let mut slot = Arc::clone(&self.root.read());
        let leaf = loop {
            let node = slot.load();
            match &*node {
                Node::Internal(inner) => {
                    let child = Arc::clone(inner.child_for(doc_id));
                    path.push(mem::replace(&mut slot, child));
                }
                Node::Leaf(leaf) => break leaf.clone(),
            }
        };

        let inserted = match leaf.entries.binary_search_by_key(&doc_id, DocDelta::doc_id) {
            Ok(pos) => {
                if leaf.entries[pos].is_delete() != delta.is_delete() {
                    let mut updated = leaf;
                    updated.entries[pos] = delta;
                    self.publish(&slot, Node::Leaf(updated))?;
                }
                false
            }
            Err(pos) => {
                let mut updated = leaf;
                updated.entries.insert(pos, delta);
                if updated.entries.len() <= self.arena.node_capacity() {
                    self.publish(&slot, Node::Leaf(updated))?;
                } else {
                    self.split_leaf(slot, updated, path)?;
                }
                self.len.fetch_add(1, Ordering::AcqRel);
                true
            }
        };

        self.arena.reclaim();
        Ok(inserted)
    }

    /// Current delta of `doc_id`.
    pub fn get(&self, doc_id: DocId) -> Option<DocDelta> {
        let _guard = self.arena.pin();
        let leaf = self.find_leaf(doc_id);
        let entries = leaf.entries();
        entries
            .binary_search_by_key(&doc_id, DocDelta::doc_id)
            .ok()
            .map(|pos| entries[pos])
    }

    /// Ascending traversal of every entry.
    pub fn iter(&self) -> TreeIter {
        let guard = self.arena.pin();
        let mut slot = Arc::clone(&self.root.read());
        let leaf = loop {
            let node = slot.load();
            match &*node {
                Node::Internal(inner) => slot = Arc::clone(&inner.children[0]),
                Node::Leaf(_) => break node,
            }
        };
        TreeIter::new(guard, leaf, 0)
    }

    /// Ascending traversal of the entries with document id `>= doc_id`.
    pub fn seek(&self, doc_id: DocId) -> TreeIter {
        let guard = self.arena.pin();
        let leaf = self.find_leaf(doc_id);
        let pos = leaf.entries().partition_point(|delta| delta.doc_id() < doc_id);
        TreeIter::new(guard, leaf, pos)
    }

    /// Entries with document ids in `[start, end)`.
    pub fn range(&self, start: DocId, end: DocId) -> impl Iterator<Item = DocDelta> {
        self.seek(start).take_while(move |delta| delta.doc_id() < end)
    }

    /// Copy of every entry, ascending.
    pub fn to_vec(&self) -> Vec<DocDelta> {
        self.iter().collect()
    }

    /// Document ids currently marked added.
    pub fn live_docs(&self) -> Vec<DocId> {
        self.iter()
            .filter(|delta| !delta.is_delete())
            .map(|delta| delta.doc_id())
            .collect()
    }

    /// Delta cursor over the tree, attributed to the arena's segment.
    pub fn cursor(&self) -> TreeCursor {
        TreeCursor::new(self.arena.segment_id(), self.iter())
    }

    /// Check the structural invariants of the current layout.
    ///
    /// Leaves must be strictly ascending, respect their high keys and be linked
    /// both ways; the leaf count of entries must match [`len`](Self::len).
    pub fn validate(&self) -> Result<()> {
        let _writer = self.writer.lock();

        let mut slot = Arc::clone(&self.root.read());
        loop {
            let node = slot.load();
            match &*node {
                Node::Internal(inner) => {
                    if inner.children.len() != inner.keys.len() + 1
                        || !inner.keys.windows(2).all(|w| w[0] < w[1])
                    {
                        return Err(SegpatchError::inconsistent(format!(
                            "term {}: malformed internal node {}",
                            self.term,
                            slot.id()
                        )));
                    }
                    slot = Arc::clone(&inner.children[0]);
                }
                Node::Leaf(_) => break,
            }
        }

        let mut prev: Option<Arc<NodeSlot>> = None;
        let mut last: Option<DocId> = None;
        let mut count = 0usize;
        let mut current = Some(slot);
        while let Some(slot) = current {
            let node = slot.load();
            let Node::Leaf(leaf) = &*node else {
                return Err(SegpatchError::inconsistent(format!(
                    "term {}: leaf chain reaches internal node {}",
                    self.term,
                    slot.id()
                )));
            };

            let linked_prev = leaf.prev.upgrade();
            let prev_matches = match (&prev, &linked_prev) {
                (None, None) => true,
                (Some(expected), Some(actual)) => Arc::ptr_eq(expected, actual),
                _ => false,
            };
            if !prev_matches {
                return Err(SegpatchError::inconsistent(format!(
                    "term {}: broken prev link at leaf {}",
                    self.term,
                    slot.id()
                )));
            }

            for delta in &leaf.entries {
                let doc_id = delta.doc_id();
                let ordered = last.is_none_or(|last| doc_id > last);
                let bounded = leaf.high_key.is_none_or(|high| doc_id < high);
                if !ordered || !bounded {
                    return Err(SegpatchError::inconsistent(format!(
                        "term {}: document {doc_id} out of order in leaf {}",
                        self.term,
                        slot.id()
                    )));
                }
                last = Some(doc_id);
            }
            count += leaf.entries.len();

            current = leaf.next.upgrade();
            prev = Some(slot);
        }

        if count != self.len() {
            return Err(SegpatchError::inconsistent(format!(
                "term {}: {count} entries in leaves but length {}",
                self.term,
                self.len()
            )));
        }
        Ok(())
    }

    fn find_leaf(&self, doc_id: DocId) -> Arc<Node> {
        let mut slot = Arc::clone(&self.root.read());
        loop {
            let node = slot.load();
            if let Some(high) = node.high_key()
                && doc_id >= high
                && let Some(right) = node.right_link().upgrade()
            {
                slot = right;
                continue;
            }
            match &*node {
                Node::Internal(inner) => slot = Arc::clone(inner.child_for(doc_id)),
                Node::Leaf(_) => return node,
            }
        }
    }

    fn publish(&self, slot: &NodeSlot, node: Node) -> Result<()> {
        self.arena.allocate(node.memory_size())?;
        let old = slot.replace(node);
        self.arena.retire(old);
        Ok(())
    }

    fn split_leaf(
        &self,
        slot: Arc<NodeSlot>,
        mut leaf: LeafNode,
        path: Vec<Arc<NodeSlot>>,
    ) -> Result<()> {
        let right_entries = leaf.entries.split_off(leaf.entries.len() / 2);
        let separator = right_entries[0].doc_id();
        let old_next = leaf.next.clone();

        let right = self.arena.new_slot(Node::Leaf(LeafNode {
            entries: right_entries,
            high_key: leaf.high_key,
            next: old_next.clone(),
            prev: Arc::downgrade(&slot),
        }))?;

        leaf.high_key = Some(separator);
        leaf.next = Arc::downgrade(&right);
        self.publish(&slot, Node::Leaf(leaf))?;

        if let Some(next_slot) = old_next.upgrade() {
            let next = next_slot.load();
            if let Node::Leaf(next_leaf) = &*next {
                let mut relinked = next_leaf.clone();
                relinked.prev = Arc::downgrade(&right);
                self.publish(&next_slot, Node::Leaf(relinked))?;
            }
        }

        trace!(
            "term {}: split leaf {} at {separator} into {}",
            self.term,
            slot.id(),
            right.id()
        );
        self.insert_separator(path, slot, separator, right)
    }

    fn insert_separator(
        &self,
        mut path: Vec<Arc<NodeSlot>>,
        mut left: Arc<NodeSlot>,
        mut separator: DocId,
        mut right: Arc<NodeSlot>,
    ) -> Result<()> {
        loop {
            let Some(parent_slot) = path.pop() else {
                let root = self.arena.new_slot(Node::Internal(InternalNode {
                    keys: vec![separator],
                    children: vec![left, right],
                    high_key: None,
                    right: Weak::new(),
                }))?;
                *self.root.write() = root;
                self.height.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            };

            let node = parent_slot.load();
            let Node::Internal(parent) = &*node else {
                return Err(SegpatchError::inconsistent(format!(
                    "term {}: ancestor {} is a leaf",
                    self.term,
                    parent_slot.id()
                )));
            };

            let pos = parent.keys.partition_point(|key| *key <= separator);
            let mut keys = parent.keys.clone();
            let mut children = parent.children.clone();
            keys.insert(pos, separator);
            children.insert(pos + 1, right);

            if children.len() <= self.arena.node_capacity() {
                return self.publish(
                    &parent_slot,
                    Node::Internal(InternalNode {
                        keys,
                        children,
                        high_key: parent.high_key,
                        right: parent.right.clone(),
                    }),
                );
            }

            let mid = keys.len() / 2;
            let right_keys = keys.split_off(mid + 1);
            let promoted = keys.pop().ok_or_else(|| {
                SegpatchError::inconsistent(format!("term {}: empty internal split", self.term))
            })?;
            let right_children = children.split_off(mid + 1);

            let sibling = self.arena.new_slot(Node::Internal(InternalNode {
                keys: right_keys,
                children: right_children,
                high_key: parent.high_key,
                right: parent.right.clone(),
            }))?;
            self.publish(
                &parent_slot,
                Node::Internal(InternalNode {
                    keys,
                    children,
                    high_key: Some(promoted),
                    right: Arc::downgrade(&sibling),
                }),
            )?;

            left = parent_slot;
            separator = promoted;
            right = sibling;
        }
    }
}

/// Ascending iterator over a tree.
///
/// The iterator pins the arena epoch for its lifetime. Each leaf is read as one
/// snapshot; entries already passed are skipped when a later leaf was split
/// after the iterator left its predecessor.
#[derive(Debug)]
pub struct TreeIter {
    _guard: EpochGuard,
    leaf: Option<Arc<Node>>,
    pos: usize,
    last: Option<DocId>,
}

impl TreeIter {
    fn new(guard: EpochGuard, leaf: Arc<Node>, pos: usize) -> Self {
        TreeIter {
            _guard: guard,
            leaf: Some(leaf),
            pos,
            last: None,
        }
    }
}

impl Iterator for TreeIter {
    type Item = DocDelta;

    fn next(&mut self) -> Option<DocDelta> {
        loop {
            let leaf = self.leaf.as_ref()?;
            let entries = leaf.entries();
            while self.pos < entries.len() {
                let delta = entries[self.pos];
                self.pos += 1;
                if self.last.is_none_or(|last| delta.doc_id() > last) {
                    self.last = Some(delta.doc_id());
                    return Some(delta);
                }
            }

            self.leaf = leaf.right_link().upgrade().map(|slot| slot.load());
            self.pos = 0;
        }
    }
}

/// [`DeltaCursor`] over a tree traversal.
#[derive(Debug)]
pub struct TreeCursor {
    source: SegmentId,
    iter: TreeIter,
    current: Option<DocDelta>,
}

impl TreeCursor {
    fn new(source: SegmentId, mut iter: TreeIter) -> Self {
        let current = iter.next();
        TreeCursor {
            source,
            iter,
            current,
        }
    }
}

impl DeltaCursor for TreeCursor {
    fn peek(&self) -> Option<DocDelta> {
        self.current
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.iter.next();
        Ok(())
    }

    fn source_id(&self) -> SegmentId {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    use super::*;
    use crate::lexical::config::DynamicTreeConfig;
    use crate::lexical::patch::merger::{VecDeltaCursor, merge_overlay};

    fn tree_with_capacity(capacity: usize) -> DynamicPostingTree {
        let arena = Arc::new(NodeArena::new(
            5,
            &DynamicTreeConfig {
                node_capacity: capacity,
                memory_quota_bytes: None,
            },
        ));
        DynamicPostingTree::new(TermKey::new(42), arena).unwrap()
    }

    #[test]
    fn test_insert_and_overwrite() {
        let tree = tree_with_capacity(4);
        assert!(tree.is_empty());
        assert!(tree.get(1).is_none());

        assert!(tree.update(3, false).unwrap());
        assert!(tree.update(1, false).unwrap());
        assert!(!tree.update(3, true).unwrap());
        assert!(!tree.update(1, false).unwrap());

        assert_eq!(tree.len(), 2);
        assert_eq!(tree.to_vec(), vec![DocDelta::add(1), DocDelta::remove(3)]);
        assert!(tree.get(3).unwrap().is_delete());
        assert_eq!(tree.live_docs(), vec![1]);
        tree.validate().unwrap();
    }

    #[test]
    fn test_splits_keep_order() {
        let tree = tree_with_capacity(4);
        let mut docs: Vec<u32> = (0..500).collect();
        docs.shuffle(&mut StdRng::seed_from_u64(11));
        for &doc in &docs {
            tree.update(doc, doc % 3 == 0).unwrap();
        }

        assert_eq!(tree.len(), 500);
        assert!(tree.height() >= 4);
        tree.validate().unwrap();

        let all = tree.to_vec();
        assert_eq!(all.len(), 500);
        for (expected, delta) in all.iter().enumerate() {
            assert_eq!(delta.doc_id(), expected as u32);
            assert_eq!(delta.is_delete(), expected % 3 == 0);
        }
        for doc in [0, 1, 250, 499] {
            assert_eq!(tree.get(doc).unwrap().doc_id(), doc);
        }
        assert!(tree.get(500).is_none());
    }

    #[test]
    fn test_seek_and_range() {
        let tree = tree_with_capacity(4);
        for doc in (0..100).step_by(5) {
            tree.update(doc, false).unwrap();
        }

        let from_42: Vec<u32> = tree.seek(42).map(|d| d.doc_id()).take(3).collect();
        assert_eq!(from_42, vec![45, 50, 55]);
        assert_eq!(tree.seek(95).count(), 1);
        assert_eq!(tree.seek(96).count(), 0);

        let range: Vec<u32> = tree.range(10, 30).map(|d| d.doc_id()).collect();
        assert_eq!(range, vec![10, 15, 20, 25]);
    }

    #[test]
    fn test_rejects_out_of_range_doc() {
        let tree = tree_with_capacity(4);
        assert!(tree.update(u32::MAX, false).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_iterator_sees_pre_split_snapshot() {
        let tree = tree_with_capacity(4);
        for doc in [10, 20, 30, 40] {
            tree.update(doc, false).unwrap();
        }

        let mut iter = tree.iter();
        assert_eq!(iter.next().unwrap().doc_id(), 10);

        // Splits the leaf the iterator is reading.
        tree.update(25, false).unwrap();
        tree.update(5, false).unwrap();
        assert_eq!(tree.height(), 2);

        let rest: Vec<u32> = iter.map(|d| d.doc_id()).collect();
        assert_eq!(rest, vec![20, 30, 40]);
        assert_eq!(
            tree.live_docs(),
            vec![5, 10, 20, 25, 30, 40]
        );
    }

    #[test]
    fn test_retired_nodes_reclaimed_after_readers_leave() {
        let tree = tree_with_capacity(4);
        tree.update(1, false).unwrap();

        let iter = tree.iter();
        tree.update(1, true).unwrap();
        assert!(tree.arena().stats().retired_nodes > 0);

        drop(iter);
        tree.update(2, false).unwrap();
        assert_eq!(tree.arena().stats().retired_nodes, 0);
        assert!(tree.arena().stats().freed_bytes > 0);
    }

    #[test]
    fn test_cursor_overlays_with_patches() {
        let tree = tree_with_capacity(4);
        tree.update(1, false).unwrap();
        tree.update(4, true).unwrap();

        // Segment 5 beats the older segment 2.
        let mut cursors: Vec<Box<dyn DeltaCursor>> = vec![
            Box::new(tree.cursor()),
            Box::new(VecDeltaCursor::new(
                2,
                vec![DocDelta::remove(1), DocDelta::add(3)],
            )),
        ];
        let merged = merge_overlay(&mut cursors).unwrap();
        assert_eq!(
            merged,
            vec![DocDelta::add(1), DocDelta::add(3), DocDelta::remove(4)]
        );
        assert!(!merged[0].is_delete());
    }

    #[test]
    fn test_concurrent_readers_see_committed_docs() {
        let tree = Arc::new(tree_with_capacity(4));
        let mut docs: Vec<u32> = (0..2000).collect();
        docs.shuffle(&mut StdRng::seed_from_u64(3));
        let docs = Arc::new(docs);
        let committed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let tree = Arc::clone(&tree);
                let docs = Arc::clone(&docs);
                let committed = Arc::clone(&committed);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let visible = committed.load(Ordering::Acquire);
                        let seen: Vec<u32> = tree.iter().map(|d| d.doc_id()).collect();
                        assert!(seen.windows(2).all(|w| w[0] < w[1]));
                        for doc in &docs[..visible] {
                            assert!(seen.binary_search(doc).is_ok(), "missing {doc}");
                            assert!(tree.get(*doc).is_some());
                        }
                    }
                })
            })
            .collect();

        for (i, &doc) in docs.iter().enumerate() {
            tree.update(doc, false).unwrap();
            committed.store(i + 1, Ordering::Release);
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }

        tree.validate().unwrap();
        assert_eq!(tree.len(), 2000);
    }
}
