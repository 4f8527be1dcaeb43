//! Core data structures for lexical mutation.
//!
//! - [`term_key::TermKey`]: term identity with the null sentinel
//! - [`doc_delta::DocDelta`]: packed add/remove event, ordered by document id
//! - [`posting::SegmentPostings`]: base postings of a sealed segment

pub mod doc_delta;
pub mod posting;
pub mod term_key;
