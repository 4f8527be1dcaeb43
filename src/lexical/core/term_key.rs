//! Term identity.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegpatchError};

/// Text form of the null term.
pub const NULL_TERM_TEXT: &str = "__NULL__";

/// Identity of an indexed field value.
///
/// A 64-bit key plus a null flag. Exactly one null value exists,
/// [`TermKey::NULL`], and it stands for "the document has no value for this
/// field". Ordering compares the key first; for equal keys the null variant sorts
/// after the non-null one, so the null term is always visited last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermKey {
    key: u64,
    is_null: bool,
}

impl TermKey {
    /// The null-term sentinel.
    pub const NULL: TermKey = TermKey {
        key: u64::MAX,
        is_null: true,
    };

    /// A non-null term key.
    pub const fn new(key: u64) -> Self {
        TermKey {
            key,
            is_null: false,
        }
    }

    /// The raw 64-bit key. For the null term this is `u64::MAX`.
    pub const fn key(&self) -> u64 {
        self.key
    }

    /// Whether this is the null-term sentinel.
    pub const fn is_null(&self) -> bool {
        self.is_null
    }
}

impl Ord for TermKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.is_null.cmp(&other.is_null))
    }
}

impl PartialOrd for TermKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null {
            f.write_str(NULL_TERM_TEXT)
        } else {
            write!(f, "{}", self.key)
        }
    }
}

impl FromStr for TermKey {
    type Err = SegpatchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == NULL_TERM_TEXT {
            return Ok(TermKey::NULL);
        }
        s.parse::<u64>()
            .map(TermKey::new)
            .map_err(|e| SegpatchError::inconsistent(format!("malformed term key {s:?}: {e}")))
    }
}

impl From<u64> for TermKey {
    fn from(key: u64) -> Self {
        TermKey::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_orders_after_equal_key() {
        let max = TermKey::new(u64::MAX);
        assert!(max < TermKey::NULL);
        assert!(TermKey::new(0) < TermKey::new(1));
        assert!(TermKey::new(5) < TermKey::NULL);
    }

    #[test]
    fn test_equality_requires_null_flag() {
        assert_ne!(TermKey::new(u64::MAX), TermKey::NULL);
        assert_eq!(TermKey::new(7), TermKey::from(7));
        assert!(TermKey::NULL.is_null());
        assert_eq!(TermKey::NULL.key(), u64::MAX);
    }

    #[test]
    fn test_text_form() {
        assert_eq!(TermKey::new(42).to_string(), "42");
        assert_eq!(TermKey::NULL.to_string(), "__NULL__");
        assert_eq!("42".parse::<TermKey>().unwrap(), TermKey::new(42));
        assert_eq!("__NULL__".parse::<TermKey>().unwrap(), TermKey::NULL);
    }

    #[test]
    fn test_malformed_text_is_inconsistent() {
        for bad in ["", "abc", "-1", "18446744073709551616", "__null__"] {
            let err = bad.parse::<TermKey>().unwrap_err();
            assert!(matches!(err, SegpatchError::Inconsistent(_)), "{bad}");
        }
    }

    #[test]
    fn test_sorting_puts_null_last() {
        let mut keys = vec![
            TermKey::NULL,
            TermKey::new(300),
            TermKey::new(u64::MAX),
            TermKey::new(1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                TermKey::new(1),
                TermKey::new(300),
                TermKey::new(u64::MAX),
                TermKey::NULL
            ]
        );
    }
}
