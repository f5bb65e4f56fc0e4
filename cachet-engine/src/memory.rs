//! In-memory engines.
//!
//! [`SharedMemoryEngine`] is the workhorse: clones share one table, so every
//! handle in the process observes the same namespaces, offsets, and locks.
//! [`LoopbackEngine`] deliberately does not share — each instance owns a
//! private table, which makes it a null-coherency stand-in for tests that
//! want an engine-shaped object without cross-handle visibility.

use cachet_core::{CacheResult, CacheValue, Offset, ProcessId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::read::{BulkRead, CacheRead};
use crate::table::CacheTable;
use crate::CacheEngine;

// ============================================================================
// SHARED MEMORY ENGINE
// ============================================================================

/// Process-wide in-memory engine. `Clone` hands out another handle to the
/// same table, so independent components coordinate through one state.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryEngine {
    table: Arc<RwLock<CacheTable>>,
}

impl SharedMemoryEngine {
    pub fn new() -> Self {
        SharedMemoryEngine::default()
    }

    fn table_read(&self) -> RwLockReadGuard<'_, CacheTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_write(&self) -> RwLockWriteGuard<'_, CacheTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheEngine for SharedMemoryEngine {
    fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead> {
        self.table_read().get(pid, namespace, key, Utc::now())
    }

    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead> {
        self.table_read().get_multi(pid, namespace, keys, Utc::now())
    }

    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .set(pid, namespace, key, value, check_offset, Utc::now())
    }

    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .set_multi(pid, namespace, entries, check_offset, Utc::now())
    }

    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool> {
        self.table_write()
            .del(pid, namespace, key, check_offset, Utc::now())
    }

    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        self.table_write()
            .del_multi(pid, namespace, keys, check_offset, Utc::now())
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.table_write().flush_all()
    }

    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset> {
        self.table_write().flush_namespace(namespace)
    }

    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .write_cache(pid, namespace, image, check_offset, Utc::now())
    }

    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead> {
        self.table_read().read_cache(pid, namespace, Utc::now())
    }

    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead> {
        self.table_write()
            .lock_cache(pid, namespace, ttl, Utc::now())
    }

    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .write_cache_page(pid, namespace, pages, check_offset, Utc::now())
    }

    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead> {
        self.table_read()
            .read_cache_page(pid, namespace, page_names, Utc::now())
    }

    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        self.table_write()
            .flush_cache_page(pid, namespace, page_names, check_offset, Utc::now())
    }

    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead> {
        self.table_write()
            .lock_cache_page(pid, namespace, page_names, ttl, Utc::now())
    }

    fn lock_namespace(
        &self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
    ) -> CacheResult<Offset> {
        self.table_write()
            .lock_namespace(pid, namespace, ttl, Utc::now())
    }

    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset> {
        self.table_write().unlock_namespace(pid, namespace, Utc::now())
    }
}

// ============================================================================
// LOOPBACK ENGINE
// ============================================================================

/// Per-instance engine: a private table, no sharing between instances.
///
/// Offsets, locks, and entries behave exactly as in any other engine, they
/// are just invisible to everyone else. Handy where a component wants cache
/// semantics but isolation is the point.
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    table: RwLock<CacheTable>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        LoopbackEngine::default()
    }

    fn table_read(&self) -> RwLockReadGuard<'_, CacheTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_write(&self) -> RwLockWriteGuard<'_, CacheTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheEngine for LoopbackEngine {
    fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead> {
        self.table_read().get(pid, namespace, key, Utc::now())
    }

    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead> {
        self.table_read().get_multi(pid, namespace, keys, Utc::now())
    }

    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .set(pid, namespace, key, value, check_offset, Utc::now())
    }

    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .set_multi(pid, namespace, entries, check_offset, Utc::now())
    }

    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool> {
        self.table_write()
            .del(pid, namespace, key, check_offset, Utc::now())
    }

    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        self.table_write()
            .del_multi(pid, namespace, keys, check_offset, Utc::now())
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.table_write().flush_all()
    }

    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset> {
        self.table_write().flush_namespace(namespace)
    }

    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .write_cache(pid, namespace, image, check_offset, Utc::now())
    }

    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead> {
        self.table_read().read_cache(pid, namespace, Utc::now())
    }

    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead> {
        self.table_write()
            .lock_cache(pid, namespace, ttl, Utc::now())
    }

    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        self.table_write()
            .write_cache_page(pid, namespace, pages, check_offset, Utc::now())
    }

    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead> {
        self.table_read()
            .read_cache_page(pid, namespace, page_names, Utc::now())
    }

    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        self.table_write()
            .flush_cache_page(pid, namespace, page_names, check_offset, Utc::now())
    }

    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead> {
        self.table_write()
            .lock_cache_page(pid, namespace, page_names, ttl, Utc::now())
    }

    fn lock_namespace(
        &self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
    ) -> CacheResult<Offset> {
        self.table_write()
            .lock_namespace(pid, namespace, ttl, Utc::now())
    }

    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset> {
        self.table_write().unlock_namespace(pid, namespace, Utc::now())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use cachet_test_utils::fixtures;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_shared_memory_engine_passes_conformance() {
        conformance::run_all(SharedMemoryEngine::new);
    }

    #[test]
    fn test_sample_values_round_trip_through_the_engine() {
        let engine = SharedMemoryEngine::new();
        let namespace = fixtures::unique_namespace("values");
        for (i, value) in fixtures::sample_values().into_iter().enumerate() {
            let key = format!("sample_{i}");
            engine.set(1, &namespace, &key, value.clone(), 1).unwrap();
            assert_eq!(engine.get(2, &namespace, &key).unwrap().value, Some(value));
        }
    }

    #[test]
    fn test_loopback_engine_passes_conformance() {
        conformance::run_all(LoopbackEngine::new);
    }

    #[test]
    fn test_clones_share_state() {
        let engine = SharedMemoryEngine::new();
        let other = engine.clone();
        engine.set(1, "shared", "k", json!("v"), 1).unwrap();
        assert_eq!(other.get(2, "shared", "k").unwrap().value, Some(json!("v")));

        // Locks are shared too: a clone's lock blocks the original.
        other
            .lock_namespace(2, "shared", Duration::from_secs(30))
            .unwrap();
        assert!(engine.get(1, "shared", "k").is_err());
    }

    #[test]
    fn test_loopback_instances_are_isolated() {
        let a = LoopbackEngine::new();
        let b = LoopbackEngine::new();
        a.set(1, "ns", "k", json!(1), 1).unwrap();
        a.flush_namespace("ns").unwrap();
        assert_eq!(b.get(1, "ns", "k").unwrap().value, None);
        assert_eq!(b.get(1, "ns", "k").unwrap().offset, 1);
        assert_eq!(a.get(1, "ns", "k").unwrap().offset, 2);
    }

    #[test]
    fn test_concurrent_writers_land_distinct_keys() {
        let engine = SharedMemoryEngine::new();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let engine = engine.clone();
                thread::spawn(move || {
                    let key = format!("worker_{i}");
                    engine.set(i, "fanout", &key, json!(i), 1).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let keys: Vec<String> = (0..8).map(|i| format!("worker_{i}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let read = engine.get_multi(99, "fanout", &refs).unwrap();
        assert_eq!(read.len(), 8);
    }

    #[test]
    fn test_concurrent_lockers_yield_one_holder() {
        let engine = SharedMemoryEngine::new();
        let handles: Vec<_> = (1..=8u64)
            .map(|pid| {
                let engine = engine.clone();
                thread::spawn(move || {
                    engine
                        .lock_namespace(pid, "contested", Duration::from_secs(30))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
