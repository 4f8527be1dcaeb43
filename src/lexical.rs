//! Per-document, per-term mutation of a segmented inverted index.
//!
//! This module holds the identity primitives shared by every mutation path, the
//! patch-log subsystem for sealed segments, the build-time merge of base postings
//! with outstanding patches, and the dynamic posting trees of updatable fields.

// Identity primitives and base postings
pub mod core;

// Configuration
pub mod config;

// Patch logs for sealed segments
pub mod patch;

// Segment consolidation
pub mod merge;

// In-place postings for updatable fields
pub mod dynamic;

// Mutation routing
pub mod modifier;

/// Segment identifier. Larger ids belong to more recently produced segments.
pub type SegmentId = u32;
