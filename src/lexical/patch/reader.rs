//! Sequential reader over a patch file.
//!
//! [`PatchFileReader`] is a forward-only cursor: it walks term blocks in file
//! order and, within the active term, one [`DocDelta`] at a time. Opening the
//! reader fetches the trailing meta record, the first term header and the first
//! delta, so a malformed file fails at open instead of mid-merge.

use std::mem;

use log::trace;

use crate::error::{Result, SegpatchError};
use crate::lexical::SegmentId;
use crate::lexical::config::PatchCompression;
use crate::lexical::core::doc_delta::{DOC_DELTA_SIZE, DocDelta};
use crate::lexical::core::term_key::TermKey;
use crate::lexical::patch::codec::{
    PATCH_META_SIZE, PatchMeta, TERM_HEADER_SIZE, parse_patch_file_name, wrap_input,
};
use crate::storage::structured::StructReader;
use crate::storage::{Storage, StorageInput};

/// Forward cursor over one patch file.
#[derive(Debug)]
pub struct PatchFileReader {
    reader: StructReader<Box<dyn StorageInput>>,
    name: String,
    src_segment: SegmentId,
    dst_segment: SegmentId,
    meta: PatchMeta,
    data_end: u64,
    total_items: u64,
    /// Term blocks whose header has been consumed.
    terms_started: u64,
    current_term: Option<TermKey>,
    current_doc_count: u32,
    /// Deltas of the current term not yet pulled from the stream.
    unread_in_term: u32,
    pending: Option<DocDelta>,
}

impl PatchFileReader {
    /// Open the patch file at `path`, taking source and destination segment from
    /// its file name.
    pub fn open(
        storage: &dyn Storage,
        path: &str,
        compression: PatchCompression,
    ) -> Result<Self> {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let (src, dst) = parse_patch_file_name(file_name)?;
        let input = wrap_input(storage.open_input(path)?, compression)?;
        Self::from_input(input, path, src, dst)
    }

    /// Read a patch record from an already opened (and unwrapped) stream.
    pub fn from_input(
        input: Box<dyn StorageInput>,
        name: &str,
        src_segment: SegmentId,
        dst_segment: SegmentId,
    ) -> Result<Self> {
        let mut reader = StructReader::new(input)?;
        let size = reader.size();
        if size < PATCH_META_SIZE {
            return Err(SegpatchError::inconsistent(format!(
                "{name}: {size} bytes is too short for a patch record"
            )));
        }

        reader.seek(size - PATCH_META_SIZE)?;
        let meta = PatchMeta::decode(&reader.read_raw(PATCH_META_SIZE as usize)?)?;
        reader.seek(0)?;

        let data_end = size - PATCH_META_SIZE;
        let header_bytes = meta
            .term_count()
            .checked_mul(TERM_HEADER_SIZE)
            .filter(|&bytes| bytes <= data_end)
            .ok_or_else(|| {
                SegpatchError::inconsistent(format!(
                    "{name}: meta declares {} terms but only {data_end} data bytes exist",
                    meta.term_count()
                ))
            })?;
        let delta_bytes = data_end - header_bytes;
        if delta_bytes % DOC_DELTA_SIZE as u64 != 0 {
            return Err(SegpatchError::inconsistent(format!(
                "{name}: {delta_bytes} delta bytes is not a whole number of deltas"
            )));
        }

        let mut patch_reader = PatchFileReader {
            reader,
            name: name.to_string(),
            src_segment,
            dst_segment,
            meta,
            data_end,
            total_items: delta_bytes / DOC_DELTA_SIZE as u64,
            terms_started: 0,
            current_term: None,
            current_doc_count: 0,
            unread_in_term: 0,
            pending: None,
        };
        patch_reader.load_next_term()?;
        Ok(patch_reader)
    }

    /// Source segment of the deltas.
    pub fn source_segment(&self) -> SegmentId {
        self.src_segment
    }

    /// Destination segment the deltas apply to.
    pub fn destination_segment(&self) -> SegmentId {
        self.dst_segment
    }

    /// Name the reader was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The trailing meta record.
    pub fn meta(&self) -> PatchMeta {
        self.meta
    }

    /// Total number of deltas in the file.
    pub fn total_item_count(&self) -> u64 {
        self.total_items
    }

    /// Bytes needed to hold the whole file decoded in memory.
    pub fn estimate_expand_memory(&self) -> usize {
        let terms = self.meta.term_count() as usize;
        let items = self.total_items as usize;
        terms * (mem::size_of::<TermKey>() + mem::size_of::<Vec<DocDelta>>())
            + items * mem::size_of::<DocDelta>()
    }

    /// Term whose deltas are being read, `None` once the file is exhausted.
    pub fn current_term_key(&self) -> Option<TermKey> {
        self.current_term
    }

    /// Number of deltas in the current term block.
    pub fn current_doc_count(&self) -> u32 {
        self.current_doc_count
    }

    /// Whether every term block has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.current_term.is_none()
    }

    /// Whether the current term still has a delta to return.
    pub fn has_next(&self) -> bool {
        self.pending.is_some()
    }

    /// Next delta of the current term, without consuming it.
    pub fn peek(&self) -> Option<DocDelta> {
        self.pending
    }

    /// Return the next delta of the current term, or `None` at the end of the
    /// term. The reader stays on the term until [`Self::skip_current_term`].
    pub fn next(&mut self) -> Result<Option<DocDelta>> {
        let Some(delta) = self.pending else {
            return Ok(None);
        };

        self.pending = self.read_delta(Some(delta))?;
        Ok(Some(delta))
    }

    /// Discard whatever remains of the current term and move to the next one.
    pub fn skip_current_term(&mut self) -> Result<()> {
        if self.current_term.is_none() {
            return Ok(());
        }

        if self.unread_in_term > 0 {
            let skip = self.unread_in_term as u64 * DOC_DELTA_SIZE as u64;
            let target = self.reader.position() + skip;
            self.reader.seek(target)?;
            self.unread_in_term = 0;
        }
        self.pending = None;
        self.load_next_term()
    }

    /// Read every remaining term block.
    pub fn read_all(mut self) -> Result<Vec<(TermKey, Vec<DocDelta>)>> {
        let mut terms = Vec::with_capacity(self.meta.term_count() as usize);
        while let Some(term) = self.current_term {
            let mut deltas = Vec::with_capacity(self.current_doc_count as usize);
            while let Some(delta) = self.next()? {
                deltas.push(delta);
            }
            terms.push((term, deltas));
            self.skip_current_term()?;
        }
        Ok(terms)
    }

    fn read_delta(&mut self, previous: Option<DocDelta>) -> Result<Option<DocDelta>> {
        if self.unread_in_term == 0 {
            return Ok(None);
        }

        let delta = DocDelta::from_bits(self.reader.read_u32()?);
        self.unread_in_term -= 1;
        if let Some(previous) = previous
            && delta <= previous
        {
            return Err(SegpatchError::inconsistent(format!(
                "{}: document {} follows {} in term {}",
                self.name,
                delta.doc_id(),
                previous.doc_id(),
                self.current_term.map(|t| t.to_string()).unwrap_or_default()
            )));
        }
        Ok(Some(delta))
    }

    fn load_next_term(&mut self) -> Result<()> {
        let previous = self.current_term.take();
        self.current_doc_count = 0;

        if self.terms_started == self.meta.term_count() {
            if self.reader.position() != self.data_end {
                return Err(SegpatchError::inconsistent(format!(
                    "{}: {} trailing bytes after the last declared term",
                    self.name,
                    self.data_end - self.reader.position()
                )));
            }
            trace!("{}: exhausted", self.name);
            return Ok(());
        }

        if self.reader.position() + TERM_HEADER_SIZE > self.data_end {
            return Err(SegpatchError::inconsistent(format!(
                "{}: meta declares {} terms, found {}",
                self.name,
                self.meta.term_count(),
                self.terms_started
            )));
        }

        let key = self.reader.read_u64()?;
        let doc_count = self.reader.read_u32()?;
        let is_null_block = self.terms_started == self.meta.non_null_term_count;
        self.terms_started += 1;

        let term = if is_null_block {
            if key != TermKey::NULL.key() {
                return Err(SegpatchError::inconsistent(format!(
                    "{}: null-term block carries key {key}",
                    self.name
                )));
            }
            TermKey::NULL
        } else {
            TermKey::new(key)
        };

        if let Some(previous) = previous
            && !previous.is_null()
            && !term.is_null()
            && term <= previous
        {
            return Err(SegpatchError::inconsistent(format!(
                "{}: term {term} follows {previous}",
                self.name
            )));
        }
        if doc_count == 0 {
            return Err(SegpatchError::inconsistent(format!(
                "{}: term {term} has no deltas",
                self.name
            )));
        }
        let block_end = self.reader.position() + doc_count as u64 * DOC_DELTA_SIZE as u64;
        if block_end > self.data_end {
            return Err(SegpatchError::inconsistent(format!(
                "{}: term {term} declares {doc_count} deltas past the end of data",
                self.name
            )));
        }

        self.current_term = Some(term);
        self.current_doc_count = doc_count;
        self.unread_in_term = doc_count;
        self.pending = self.read_delta(None)?;
        Ok(())
    }
}
