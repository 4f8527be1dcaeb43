//! Patch logs.
//!
//! Updates against sealed segments are buffered per (source segment, destination
//! segment), dumped as patch files under the destination segment's patch area and
//! composed back together by the cross-segment merger.

pub mod buffer;
pub mod codec;
pub mod index_reader;
pub mod merger;
pub mod reader;
pub mod writer;
