//! Dynamic posting trees for updatable fields.
//!
//! Every term of an updatable field owns a [`tree::DynamicPostingTree`]; all trees
//! of one segment share a [`arena::NodeArena`] that accounts node memory and
//! defers reclamation of replaced nodes until no reader can still see them.

pub mod arena;
pub mod index;
pub mod resource;
pub mod tree;
