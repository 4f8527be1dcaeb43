//! Sealed segment postings.
//!
//! The base (immutable) postings of a segment: for every term, the ascending
//! list of documents indexed under it. Terms whose document frequency reaches the
//! high-frequency threshold are additionally kept as bitmaps, the form the
//! high-frequency index mode merges from. This is the minimal on-disk posting
//! collaborator the merge path consumes; term frequencies and positions are not
//! modelled.

use std::collections::BTreeMap;
use std::sync::Arc;

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegpatchError};
use crate::lexical::core::doc_delta::{DocId, MAX_DOC_ID};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::SegmentId;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const POSTINGS_MAGIC: u32 = 0x534F_5053; // "SPOS"
const POSTINGS_VERSION: u32 = 1;

/// Which posting family of a segment a term belongs to.
///
/// High-frequency terms are merged separately from normal postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexMode {
    /// Regular doc-id lists. Every term of the segment has one.
    Normal,
    /// Bitmap postings of terms at or above the high-frequency threshold.
    HighFrequency,
}

/// Base postings of one sealed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPostings {
    segment_id: SegmentId,
    doc_count: u32,
    normal: BTreeMap<TermKey, Vec<DocId>>,
    high_frequency: BTreeMap<TermKey, BitVec>,
}

impl SegmentPostings {
    /// Create empty postings for a segment holding `doc_count` documents.
    pub fn new(segment_id: SegmentId, doc_count: u32) -> Self {
        SegmentPostings {
            segment_id,
            doc_count,
            normal: BTreeMap::new(),
            high_frequency: BTreeMap::new(),
        }
    }

    /// Segment these postings belong to.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Number of documents in the segment.
    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Index `doc_id` under `term`. Re-adding an existing pair is a no-op.
    pub fn add_posting(&mut self, term: TermKey, doc_id: DocId) -> Result<()> {
        if doc_id >= self.doc_count || doc_id > MAX_DOC_ID {
            return Err(SegpatchError::invalid_argument(format!(
                "document {doc_id} out of range for segment {} ({} docs)",
                self.segment_id, self.doc_count
            )));
        }

        let list = self.normal.entry(term).or_default();
        if let Err(pos) = list.binary_search(&doc_id) {
            list.insert(pos, doc_id);
        }
        Ok(())
    }

    /// Index one document under each of `terms`.
    pub fn add_document(&mut self, doc_id: DocId, terms: &[TermKey]) -> Result<()> {
        for &term in terms {
            self.add_posting(term, doc_id)?;
        }
        Ok(())
    }

    /// Rebuild the high-frequency bitmaps: every term whose document frequency is
    /// at least `threshold` gets a bitmap copy. A threshold of 0 disables them.
    pub fn build_high_frequency(&mut self, threshold: usize) {
        self.high_frequency.clear();
        if threshold == 0 {
            return;
        }

        for (term, docs) in &self.normal {
            if docs.len() >= threshold {
                let mut bitmap = BitVec::from_elem(self.doc_count as usize, false);
                for &doc in docs {
                    bitmap.set(doc as usize, true);
                }
                self.high_frequency.insert(*term, bitmap);
            }
        }
    }

    /// Postings of `term` in the given mode.
    pub fn postings(&self, term: TermKey, mode: IndexMode) -> Option<Vec<DocId>> {
        match mode {
            IndexMode::Normal => self.normal.get(&term).cloned(),
            IndexMode::HighFrequency => self.high_frequency.get(&term).map(bitmap_to_docs),
        }
    }

    /// Whether `term` has postings in the given mode.
    pub fn contains(&self, term: TermKey, mode: IndexMode) -> bool {
        match mode {
            IndexMode::Normal => self.normal.contains_key(&term),
            IndexMode::HighFrequency => self.high_frequency.contains_key(&term),
        }
    }

    /// Ascending term keys of the given mode.
    pub fn terms(&self, mode: IndexMode) -> Vec<TermKey> {
        match mode {
            IndexMode::Normal => self.normal.keys().copied().collect(),
            IndexMode::HighFrequency => self.high_frequency.keys().copied().collect(),
        }
    }

    /// Number of terms in the given mode.
    pub fn term_count(&self, mode: IndexMode) -> usize {
        match mode {
            IndexMode::Normal => self.normal.len(),
            IndexMode::HighFrequency => self.high_frequency.len(),
        }
    }

    /// Replace the postings of `term` (used by the merge path to materialize output).
    pub fn set_postings(&mut self, term: TermKey, mode: IndexMode, docs: Vec<DocId>) {
        match mode {
            IndexMode::Normal => {
                if docs.is_empty() {
                    self.normal.remove(&term);
                } else {
                    self.normal.insert(term, docs);
                }
            }
            IndexMode::HighFrequency => {
                if docs.is_empty() {
                    self.high_frequency.remove(&term);
                } else {
                    let mut bitmap = BitVec::from_elem(self.doc_count as usize, false);
                    for doc in docs {
                        bitmap.set(doc as usize, true);
                    }
                    self.high_frequency.insert(term, bitmap);
                }
            }
        }
    }

    /// Write the postings to `name` in `storage`.
    pub fn write_to_storage(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let mut writer = StructWriter::new(storage.create_output(name)?);

        writer.write_u32(POSTINGS_MAGIC)?;
        writer.write_u32(POSTINGS_VERSION)?;
        writer.write_u32(self.segment_id)?;
        writer.write_u32(self.doc_count)?;

        writer.write_varint(self.normal.len() as u64)?;
        for (term, docs) in &self.normal {
            write_term_key(&mut writer, *term)?;
            writer.write_delta_compressed_u32s(docs)?;
        }

        writer.write_varint(self.high_frequency.len() as u64)?;
        for (term, bitmap) in &self.high_frequency {
            write_term_key(&mut writer, *term)?;
            let bytes = bitmap.to_bytes();
            writer.write_varint(bytes.len() as u64)?;
            writer.write_raw(&bytes)?;
        }

        let checksum = writer.checksum();
        writer.write_u32(checksum)?;
        writer.close()
    }

    /// Read postings written by [`SegmentPostings::write_to_storage`].
    pub fn read_from_storage(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(name)?)?;

        let magic = reader.read_u32()?;
        if magic != POSTINGS_MAGIC {
            return Err(SegpatchError::inconsistent(format!(
                "{name}: not a segment postings file"
            )));
        }
        let version = reader.read_u32()?;
        if version != POSTINGS_VERSION {
            return Err(SegpatchError::inconsistent(format!(
                "{name}: unsupported postings version {version}"
            )));
        }

        let segment_id = reader.read_u32()?;
        let doc_count = reader.read_u32()?;
        let mut postings = SegmentPostings::new(segment_id, doc_count);

        let normal_count = reader.read_varint()?;
        for _ in 0..normal_count {
            let term = read_term_key(&mut reader)?;
            let docs = reader.read_delta_compressed_u32s()?;
            if docs.iter().any(|&doc| doc >= doc_count) {
                return Err(SegpatchError::inconsistent(format!(
                    "{name}: posting of term {term} exceeds doc count {doc_count}"
                )));
            }
            postings.normal.insert(term, docs);
        }

        let high_frequency_count = reader.read_varint()?;
        for _ in 0..high_frequency_count {
            let term = read_term_key(&mut reader)?;
            let length = reader.read_varint()? as usize;
            let mut bitmap = BitVec::from_bytes(&reader.read_raw(length)?);
            bitmap.truncate(doc_count as usize);
            postings.high_frequency.insert(term, bitmap);
        }

        let computed = reader.checksum();
        let stored = reader.read_u32()?;
        if computed != stored {
            return Err(SegpatchError::inconsistent(format!(
                "{name}: checksum mismatch"
            )));
        }

        Ok(postings)
    }
}

fn bitmap_to_docs(bitmap: &BitVec) -> Vec<DocId> {
    bitmap
        .iter()
        .enumerate()
        .filter_map(|(doc, set)| set.then_some(doc as DocId))
        .collect()
}

fn write_term_key<W: crate::storage::StorageOutput>(
    writer: &mut StructWriter<W>,
    term: TermKey,
) -> Result<()> {
    writer.write_u64(term.key())?;
    writer.write_u8(term.is_null() as u8)
}

fn read_term_key<R: crate::storage::StorageInput>(reader: &mut StructReader<R>) -> Result<TermKey> {
    let key = reader.read_u64()?;
    match reader.read_u8()? {
        0 => Ok(TermKey::new(key)),
        1 if key == TermKey::NULL.key() => Ok(TermKey::NULL),
        flag => Err(SegpatchError::inconsistent(format!(
            "invalid null flag {flag} for key {key}"
        ))),
    }
}

/// Forward cursor over the terms of one (segment, mode).
///
/// The term dictionary is known up front; a term's postings are only decoded
/// when [`TermPostingIterator::read_postings`] is called for it.
pub trait TermPostingIterator: Send + std::fmt::Debug {
    /// Current term, `None` once exhausted.
    fn current_term(&self) -> Option<TermKey>;

    /// Decode the postings of the current term.
    fn read_postings(&mut self) -> Result<Vec<DocId>>;

    /// Move to the next term.
    fn advance(&mut self) -> Result<()>;
}

/// [`TermPostingIterator`] over in-memory [`SegmentPostings`].
#[derive(Debug)]
pub struct SegmentTermIterator {
    postings: Arc<SegmentPostings>,
    mode: IndexMode,
    terms: Vec<TermKey>,
    position: usize,
}

impl SegmentTermIterator {
    /// Iterate the terms of `postings` in the given mode.
    pub fn new(postings: Arc<SegmentPostings>, mode: IndexMode) -> Self {
        let terms = postings.terms(mode);
        SegmentTermIterator {
            postings,
            mode,
            terms,
            position: 0,
        }
    }
}

impl TermPostingIterator for SegmentTermIterator {
    fn current_term(&self) -> Option<TermKey> {
        self.terms.get(self.position).copied()
    }

    fn read_postings(&mut self) -> Result<Vec<DocId>> {
        let term = self
            .current_term()
            .ok_or_else(|| SegpatchError::inconsistent("read past the last term"))?;
        self.postings
            .postings(term, self.mode)
            .ok_or_else(|| SegpatchError::inconsistent(format!("term {term} vanished")))
    }

    fn advance(&mut self) -> Result<()> {
        if self.position < self.terms.len() {
            self.position += 1;
        }
        Ok(())
    }
}
