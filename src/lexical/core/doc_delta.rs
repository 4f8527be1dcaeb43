//! Per-document add/remove events.
//!
//! A [`DocDelta`] packs a 31-bit document id with a delete flag into one `u32`:
//! bits `0..=30` hold the id, bit 31 the flag. That word, little-endian, is the
//! on-disk representation used by patch files.
//!
//! Identity is the document id alone. An add and a remove for the same document
//! compare equal, which is what lets [`dedup_last_wins`] collapse chronological
//! event lists with a stable sort.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegpatchError};

/// Local document id inside a segment.
pub type DocId = u32;

/// Largest representable document id.
pub const MAX_DOC_ID: DocId = (1 << 31) - 1;

const DELETE_BIT: u32 = 1 << 31;

/// Encoded size of one delta.
pub const DOC_DELTA_SIZE: usize = 4;

/// One add/remove event for a document under a term.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(into = "DocDeltaRepr", from = "DocDeltaRepr")]
pub struct DocDelta(u32);

impl DocDelta {
    /// Create a delta.
    ///
    /// # Panics
    ///
    /// Panics if `doc_id` exceeds [`MAX_DOC_ID`]. Use [`DocDelta::try_new`] for
    /// ids coming from untrusted input.
    pub fn new(doc_id: DocId, is_delete: bool) -> Self {
        assert!(doc_id <= MAX_DOC_ID, "document id {doc_id} exceeds 31 bits");
        DocDelta(doc_id | if is_delete { DELETE_BIT } else { 0 })
    }

    /// Create a delta, rejecting ids wider than 31 bits.
    pub fn try_new(doc_id: DocId, is_delete: bool) -> Result<Self> {
        if doc_id > MAX_DOC_ID {
            return Err(SegpatchError::invalid_argument(format!(
                "document id {doc_id} exceeds {MAX_DOC_ID}"
            )));
        }
        Ok(Self::new(doc_id, is_delete))
    }

    /// An "add" event.
    pub fn add(doc_id: DocId) -> Self {
        Self::new(doc_id, false)
    }

    /// A "remove" event.
    pub fn remove(doc_id: DocId) -> Self {
        Self::new(doc_id, true)
    }

    /// Document id.
    pub const fn doc_id(&self) -> DocId {
        self.0 & !DELETE_BIT
    }

    /// Whether this event removes the document from the term.
    pub const fn is_delete(&self) -> bool {
        self.0 & DELETE_BIT != 0
    }

    /// Packed wire representation.
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Rebuild a delta from its wire representation. Every `u32` is valid.
    pub const fn from_bits(bits: u32) -> Self {
        DocDelta(bits)
    }
}

impl PartialEq for DocDelta {
    fn eq(&self, other: &Self) -> bool {
        self.doc_id() == other.doc_id()
    }
}

impl Eq for DocDelta {}

impl PartialOrd for DocDelta {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocDelta {
    fn cmp(&self, other: &Self) -> Ordering {
        self.doc_id().cmp(&other.doc_id())
    }
}

impl Hash for DocDelta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.doc_id().hash(state);
    }
}

impl fmt::Debug for DocDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_delete() { "remove" } else { "add" };
        write!(f, "({}, {op})", self.doc_id())
    }
}

#[derive(Serialize, Deserialize)]
struct DocDeltaRepr {
    doc_id: DocId,
    is_delete: bool,
}

impl From<DocDelta> for DocDeltaRepr {
    fn from(delta: DocDelta) -> Self {
        DocDeltaRepr {
            doc_id: delta.doc_id(),
            is_delete: delta.is_delete(),
        }
    }
}

impl From<DocDeltaRepr> for DocDelta {
    fn from(repr: DocDeltaRepr) -> Self {
        DocDelta((repr.doc_id & !DELETE_BIT) | if repr.is_delete { DELETE_BIT } else { 0 })
    }
}

/// Collapse a chronologically ordered delta list to one entry per document.
///
/// The list is stably sorted by document id; within each run of equal ids the
/// last-inserted entry survives. The result is strictly ascending.
pub fn dedup_last_wins(deltas: &mut Vec<DocDelta>) {
    if deltas.len() < 2 {
        return;
    }

    // slice::sort is stable, so runs keep their insertion order.
    deltas.sort();

    let mut write = 0;
    for read in 1..deltas.len() {
        if deltas[read] == deltas[write] {
            deltas[write] = deltas[read];
        } else {
            write += 1;
            deltas[write] = deltas[read];
        }
    }
    deltas.truncate(write + 1);
}

/// Whether the list is strictly ascending by document id.
pub fn is_strictly_ascending(deltas: &[DocDelta]) -> bool {
    deltas.windows(2).all(|pair| pair[0] < pair[1])
}
