//! # Segpatch
//!
//! The mutation layer of a segment-structured inverted index.
//!
//! Sealed segments never rewrite their encoded postings. Instead, per-document,
//! per-term changes are recorded in one of two ways:
//!
//! - **Patch logs**: updates against a sealed segment accumulate in a
//!   [`lexical::patch::buffer::SegmentUpdateBuffer`], are dumped to compact patch
//!   files, and are replayed through [`lexical::patch::reader::PatchFileReader`]
//!   and [`lexical::patch::merger::PatchMerger`] at query or merge time.
//! - **Dynamic posting trees**: fields marked updatable keep their postings in
//!   [`lexical::dynamic::tree::DynamicPostingTree`]s that are mutated in place by
//!   one writer while readers traverse them.
//!
//! Segment consolidation goes through [`lexical::merge::term_queue::TermMergeQueue`],
//! which overlays the outstanding patches on each source segment's base postings.

pub mod cli;
pub mod error;
pub mod lexical;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::error::{Result, SegpatchError};
    pub use crate::lexical::core::doc_delta::{DocDelta, DocId};
    pub use crate::lexical::core::term_key::TermKey;
    pub use crate::lexical::modifier::IndexModifier;
    pub use crate::lexical::patch::buffer::{DumpOutcome, PatchFileInfo, UpdateOutcome};
    pub use crate::lexical::SegmentId;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
