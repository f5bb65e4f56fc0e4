//! Read-result shapes returned by engine operations.
//!
//! These structs replace the historical by-reference output parameters: a
//! read always hands back the namespace's current offset alongside the data,
//! so callers can seed their next optimistic `check_offset` from any read.

use cachet_core::{CacheValue, Offset};
use std::collections::HashMap;

/// Result of a single-value read (`get`, `read_cache`, `lock_cache`).
///
/// An absent value is a valid miss, not an error; `offset` is meaningful
/// either way.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead {
    pub value: Option<CacheValue>,
    pub offset: Offset,
}

impl CacheRead {
    /// Whether the read found a stored value.
    pub fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// Consume the read, keeping only the value.
    pub fn into_value(self) -> Option<CacheValue> {
        self.value
    }
}

/// Result of a bulk read (`get_multi`, `read_cache_page`,
/// `lock_cache_page`): the present subset of the requested names plus the
/// namespace's current offset. Absent names are omitted, never errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRead {
    pub entries: HashMap<String, CacheValue>,
    pub offset: Offset,
}

impl BulkRead {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CacheValue> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_read_valid_mirrors_presence() {
        let hit = CacheRead {
            value: Some(json!(0)),
            offset: 1,
        };
        let miss = CacheRead {
            value: None,
            offset: 1,
        };
        assert!(hit.valid());
        assert!(!miss.valid());
        assert_eq!(hit.into_value(), Some(json!(0)));
        assert_eq!(miss.into_value(), None);
    }

    #[test]
    fn test_bulk_read_accessors() {
        let mut entries = HashMap::new();
        entries.insert("p1".to_string(), json!({"a": 1}));
        let read = BulkRead { entries, offset: 2 };
        assert!(read.contains("p1"));
        assert!(!read.contains("p2"));
        assert_eq!(read.get("p1"), Some(&json!({"a": 1})));
        assert_eq!(read.len(), 1);
        assert!(!read.is_empty());
    }
}
