//! Segment consolidation.

pub mod segment_merger;
pub mod term_queue;
