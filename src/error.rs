//! Error types for the segpatch library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`SegpatchError`] enum. The variants follow the failure classes of the
//! mutation layer:
//!
//! - storage failures ([`SegpatchError::Io`], [`SegpatchError::Storage`]) are
//!   terminal for the operation in progress and are never retried here;
//! - format/consistency failures ([`SegpatchError::Inconsistent`]) are raised when
//!   persisted data contradicts itself;
//! - arena exhaustion ([`SegpatchError::ResourceExhausted`]) is fatal to the
//!   owning real-time segment.
//!
//! Updates dropped while a buffer is being drained are not errors; see
//! [`crate::lexical::patch::buffer::UpdateOutcome`].
//!
//! # Examples
//!
//! ```
//! use segpatch::error::{Result, SegpatchError};
//!
//! fn check_block(doc_count: u32) -> Result<()> {
//!     if doc_count == 0 {
//!         return Err(SegpatchError::inconsistent("empty term block"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_block(0).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for segpatch operations.
#[derive(Error, Debug)]
pub enum SegpatchError {
    /// I/O errors raised by the underlying byte streams.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors (open/create/rename failures, closed storage).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Persisted data or a caller-supplied key contradicts itself.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// A memory arena ran out of quota.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with SegpatchError.
pub type Result<T> = std::result::Result<T, SegpatchError>;

impl SegpatchError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        SegpatchError::Storage(msg.into())
    }

    /// Create a new inconsistent-state error.
    pub fn inconsistent<S: Into<String>>(msg: S) -> Self {
        SegpatchError::Inconsistent(msg.into())
    }

    /// Create a new resource exhaustion error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        SegpatchError::ResourceExhausted(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        SegpatchError::Config(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        SegpatchError::InvalidArgument(msg.into())
    }

    /// Whether this error leaves the owning real-time segment unusable.
    pub fn is_fatal_to_segment(&self) -> bool {
        matches!(self, SegpatchError::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = SegpatchError::storage("disk gone");
        assert_eq!(error.to_string(), "Storage error: disk gone");

        let error = SegpatchError::inconsistent("meta mismatch");
        assert_eq!(error.to_string(), "Inconsistent state: meta mismatch");

        let error = SegpatchError::config("node_capacity must be a power of two");
        assert_eq!(
            error.to_string(),
            "Configuration error: node_capacity must be a power of two"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = SegpatchError::from(io_error);

        match error {
            SegpatchError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SegpatchError::resource_exhausted("arena").is_fatal_to_segment());
        assert!(!SegpatchError::inconsistent("x").is_fatal_to_segment());
        assert!(!SegpatchError::storage("x").is_fatal_to_segment());
    }
}
