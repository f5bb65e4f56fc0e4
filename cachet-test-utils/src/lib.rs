//! Test infrastructure for the cachet workspace:
//! - A recording observer for asserting on emitted cache events
//! - Proptest strategies for cache values and protocol inputs
//! - Fixtures for common namespace and payload setups

// Re-export core types for convenience
pub use cachet_core::{
    CacheEvent, CacheObserver, CacheOperation, CacheValue, LockLease, Offset, ProcessId,
    Timestamp, INITIAL_OFFSET,
};

use std::cell::RefCell;

// ============================================================================
// RECORDING OBSERVER
// ============================================================================

/// Observer that keeps every event it is notified of, in arrival order.
///
/// Single-threaded by construction (`RefCell`), which matches how observers
/// are attached to a client: one `Rc` per client, inspected after the calls
/// under test.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: RefCell<Vec<CacheEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        RecordingObserver::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.borrow().clone()
    }

    /// Just the operation names, for order-of-emission assertions.
    pub fn operation_names(&self) -> Vec<&'static str> {
        self.events
            .borrow()
            .iter()
            .map(|event| event.operation.as_str())
            .collect()
    }

    pub fn last(&self) -> Option<CacheEvent> {
        self.events.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl CacheObserver for RecordingObserver {
    fn notify(&self, event: &CacheEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for protocol inputs and JSON payloads.

    use super::*;
    use proptest::prelude::*;

    // === Scalar Generators ===

    /// Generate a plausible process ID.
    pub fn arb_pid() -> impl Strategy<Value = ProcessId> {
        1u64..10_000
    }

    /// Generate an offset a live namespace could be at.
    pub fn arb_offset() -> impl Strategy<Value = Offset> {
        INITIAL_OFFSET..1_000
    }

    /// Generate a namespace name.
    pub fn arb_namespace() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    /// Generate a key or page name.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.]{0,23}"
    }

    // === Payload Generators ===

    /// Generate an arbitrary JSON value: scalars, arrays, and objects up to
    /// a few levels deep.
    pub fn arb_cache_value() -> impl Strategy<Value = CacheValue> {
        let leaf = prop_oneof![
            Just(CacheValue::Null),
            any::<bool>().prop_map(CacheValue::Bool),
            any::<i64>().prop_map(|n| serde_json::json!(n)),
            (-1.0e9f64..1.0e9).prop_map(|f| serde_json::json!(f)),
            "[ -~]{0,32}".prop_map(CacheValue::String),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(CacheValue::Array),
                prop::collection::hash_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|map| CacheValue::Object(map.into_iter().collect())),
            ]
        })
    }

    /// Generate a live lease anchored at the current clock.
    pub fn arb_lock_lease() -> impl Strategy<Value = LockLease> {
        (arb_pid(), 1u64..3_600).prop_map(|(pid, secs)| {
            LockLease::new(pid, std::time::Duration::from_secs(secs), chrono::Utc::now())
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built inputs for common cache scenarios.

    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    /// A spread of JSON shapes worth pushing through any engine.
    pub fn sample_values() -> Vec<CacheValue> {
        vec![
            json!(null),
            json!(true),
            json!(0),
            json!(-17),
            json!(3.5),
            json!(""),
            json!("plain text"),
            json!([1, 2, 3]),
            json!({"nested": {"a": [true, null]}, "n": 2.25}),
        ]
    }

    /// Namespace name unique to this call, for tests sharing a backend.
    pub fn unique_namespace(tag: &str) -> String {
        format!("{tag}_{}", Uuid::now_v7().simple())
    }

    /// A small pages map ready for a paged write.
    pub fn sample_pages() -> HashMap<String, CacheValue> {
        let mut pages = HashMap::new();
        pages.insert("page_0".to_string(), json!({"cells": [1, 2]}));
        pages.insert("page_1".to_string(), json!({"cells": [3]}));
        pages
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_recording_observer_keeps_arrival_order() {
        let observer = RecordingObserver::new();
        observer.notify(&CacheEvent::new(CacheOperation::SaveCache, "ns", json!(1)));
        observer.notify(&CacheEvent::new(CacheOperation::FlushCache, "ns", json!(2)));

        assert_eq!(observer.len(), 2);
        assert_eq!(
            observer.operation_names(),
            vec!["save_cache", "flush_cache"]
        );
        assert_eq!(
            observer.last().map(|e| e.operation),
            Some(CacheOperation::FlushCache)
        );

        observer.clear();
        assert!(observer.is_empty());
    }

    #[test]
    fn test_unique_namespaces_do_not_collide() {
        let a = fixtures::unique_namespace("t");
        let b = fixtures::unique_namespace("t");
        assert_ne!(a, b);
        assert!(a.starts_with("t_"));
    }

    proptest! {
        #[test]
        fn prop_generated_values_survive_json_round_trip(
            value in generators::arb_cache_value()
        ) {
            let raw = serde_json::to_string(&value).expect("serialize");
            let parsed: CacheValue = serde_json::from_str(&raw).expect("parse");
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn prop_generated_leases_start_live(lease in generators::arb_lock_lease()) {
            prop_assert!(!lease.is_expired(lease.acquired_at));
        }
    }
}
