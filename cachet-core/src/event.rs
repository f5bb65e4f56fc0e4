//! Post-operation notification boundary.
//!
//! The client hands a [`CacheEvent`] to every registered [`CacheObserver`]
//! after each successful mutating operation. Only the event shape is defined
//! here; dispatch, fan-out, and any broadcast bus belong to the surrounding
//! application.

use crate::{CacheValue, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

// ============================================================================
// OPERATION NAMES
// ============================================================================

/// Client operations that produce a notification.
///
/// Read and load operations only refresh the client's local mirror and are
/// deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheOperation {
    FlushCache,
    FlushCachePage,
    SaveCache,
    SaveCachePage,
    WriteCache,
    WriteCachePage,
    LockCache,
    LockCachePage,
    LockNamespace,
    UnlockNamespace,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::FlushCache => "flush_cache",
            CacheOperation::FlushCachePage => "flush_cache_page",
            CacheOperation::SaveCache => "save_cache",
            CacheOperation::SaveCachePage => "save_cache_page",
            CacheOperation::WriteCache => "write_cache",
            CacheOperation::WriteCachePage => "write_cache_page",
            CacheOperation::LockCache => "lock_cache",
            CacheOperation::LockCachePage => "lock_cache_page",
            CacheOperation::LockNamespace => "lock_namespace",
            CacheOperation::UnlockNamespace => "unlock_namespace",
        }
    }
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENT SHAPE
// ============================================================================

/// A notification describing one successful mutating client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    /// UUIDv7, timestamp-sortable.
    pub id: Uuid,
    pub operation: CacheOperation,
    pub namespace: String,
    /// Operation-specific data: the written image, the touched page names,
    /// or the resulting offset.
    pub payload: CacheValue,
    pub emitted_at: Timestamp,
}

impl CacheEvent {
    /// Build an event for `operation` on `namespace`, stamped now.
    pub fn new(operation: CacheOperation, namespace: &str, payload: CacheValue) -> Self {
        CacheEvent {
            id: Uuid::now_v7(),
            operation,
            namespace: namespace.to_string(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

/// Receiver for post-operation notifications.
///
/// Observers must not fail; what an observer does with an event is the
/// surrounding application's concern, and the client never interprets
/// observer behavior.
pub trait CacheObserver {
    fn notify(&self, event: &CacheEvent);
}

impl<T: CacheObserver + ?Sized> CacheObserver for Rc<T> {
    fn notify(&self, event: &CacheEvent) {
        (**self).notify(event);
    }
}

impl<T: CacheObserver + ?Sized> CacheObserver for Box<T> {
    fn notify(&self, event: &CacheEvent) {
        (**self).notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct Recorder {
        seen: RefCell<Vec<CacheEvent>>,
    }

    impl CacheObserver for Recorder {
        fn notify(&self, event: &CacheEvent) {
            self.seen.borrow_mut().push(event.clone());
        }
    }

    #[test]
    fn test_event_new_stamps_identity() {
        let a = CacheEvent::new(CacheOperation::WriteCache, "ns_1", json!({"x": 1}));
        let b = CacheEvent::new(CacheOperation::WriteCache, "ns_1", json!({"x": 1}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.namespace, "ns_1");
        assert_eq!(a.operation, CacheOperation::WriteCache);
        assert_eq!(a.payload, json!({"x": 1}));
    }

    #[test]
    fn test_operation_names_are_distinct() {
        let ops = [
            CacheOperation::FlushCache,
            CacheOperation::FlushCachePage,
            CacheOperation::SaveCache,
            CacheOperation::SaveCachePage,
            CacheOperation::WriteCache,
            CacheOperation::WriteCachePage,
            CacheOperation::LockCache,
            CacheOperation::LockCachePage,
            CacheOperation::LockNamespace,
            CacheOperation::UnlockNamespace,
        ];
        let mut names: Vec<&str> = ops.iter().map(|o| o.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ops.len());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = CacheEvent::new(
            CacheOperation::FlushCachePage,
            "ns_2",
            json!({"pages": ["p1", "p2"]}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_rc_observer_forwards() {
        let recorder = Rc::new(Recorder {
            seen: RefCell::new(Vec::new()),
        });
        let observer: Box<dyn CacheObserver> = Box::new(Rc::clone(&recorder));
        let event = CacheEvent::new(CacheOperation::LockNamespace, "ns_1", json!(1));
        observer.notify(&event);
        assert_eq!(recorder.seen.borrow().len(), 1);
        assert_eq!(recorder.seen.borrow()[0].operation, CacheOperation::LockNamespace);
    }
}
