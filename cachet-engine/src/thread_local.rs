//! Per-thread engine.
//!
//! State lives in a `thread_local!` table, so every [`ThreadLocalEngine`]
//! value on a given thread shares one store, and threads never see each
//! other. Tests get hermetic state for free from the test harness's
//! thread-per-test model; the same property makes this engine a deliberate
//! sharing-off switch in request-per-thread servers.

use cachet_core::{CacheResult, CacheValue, Offset, ProcessId};
use chrono::Utc;
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use crate::read::{BulkRead, CacheRead};
use crate::table::CacheTable;
use crate::CacheEngine;

thread_local! {
    static TABLE: RefCell<CacheTable> = RefCell::new(CacheTable::new());
}

/// Engine whose store is scoped to the calling thread.
///
/// The struct itself is stateless; construction is free and all values are
/// interchangeable within a thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalEngine;

impl ThreadLocalEngine {
    pub fn new() -> Self {
        ThreadLocalEngine
    }

    fn with_table<T>(f: impl FnOnce(&mut CacheTable) -> T) -> T {
        TABLE.with(|cell| f(&mut cell.borrow_mut()))
    }
}

impl CacheEngine for ThreadLocalEngine {
    fn ping(&self) -> CacheResult<()> {
        Ok(())
    }

    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead> {
        Self::with_table(|t| t.get(pid, namespace, key, Utc::now()))
    }

    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead> {
        Self::with_table(|t| t.get_multi(pid, namespace, keys, Utc::now()))
    }

    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        Self::with_table(|t| t.set(pid, namespace, key, value, check_offset, Utc::now()))
    }

    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        Self::with_table(|t| t.set_multi(pid, namespace, entries, check_offset, Utc::now()))
    }

    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool> {
        Self::with_table(|t| t.del(pid, namespace, key, check_offset, Utc::now()))
    }

    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        Self::with_table(|t| t.del_multi(pid, namespace, keys, check_offset, Utc::now()))
    }

    fn flush_all(&self) -> CacheResult<()> {
        Self::with_table(|t| t.flush_all())
    }

    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset> {
        Self::with_table(|t| t.flush_namespace(namespace))
    }

    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        Self::with_table(|t| t.write_cache(pid, namespace, image, check_offset, Utc::now()))
    }

    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead> {
        Self::with_table(|t| t.read_cache(pid, namespace, Utc::now()))
    }

    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead> {
        Self::with_table(|t| t.lock_cache(pid, namespace, ttl, Utc::now()))
    }

    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        Self::with_table(|t| t.write_cache_page(pid, namespace, pages, check_offset, Utc::now()))
    }

    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead> {
        Self::with_table(|t| t.read_cache_page(pid, namespace, page_names, Utc::now()))
    }

    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        Self::with_table(|t| {
            t.flush_cache_page(pid, namespace, page_names, check_offset, Utc::now())
        })
    }

    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead> {
        Self::with_table(|t| t.lock_cache_page(pid, namespace, page_names, ttl, Utc::now()))
    }

    fn lock_namespace(
        &self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
    ) -> CacheResult<Offset> {
        Self::with_table(|t| t.lock_namespace(pid, namespace, ttl, Utc::now()))
    }

    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset> {
        Self::with_table(|t| t.unlock_namespace(pid, namespace, Utc::now()))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_thread_local_engine_passes_conformance() {
        conformance::run_all(ThreadLocalEngine::new);
    }

    #[test]
    fn test_instances_on_one_thread_share_state() {
        let a = ThreadLocalEngine::new();
        let b = ThreadLocalEngine::new();
        a.flush_all().unwrap();
        a.set(1, "tl", "k", json!(42), 1).unwrap();
        assert_eq!(b.get(1, "tl", "k").unwrap().value, Some(json!(42)));
    }

    #[test]
    fn test_threads_do_not_share_state() {
        let engine = ThreadLocalEngine::new();
        engine.flush_all().unwrap();
        engine.set(1, "tl", "k", json!("here"), 1).unwrap();
        engine.flush_namespace("tl").unwrap();

        let seen = thread::spawn(move || {
            let read = engine.get(1, "tl", "k").unwrap();
            (read.value, read.offset)
        })
        .join()
        .unwrap();
        // The spawned thread starts from a pristine table.
        assert_eq!(seen, (None, 1));
        assert_eq!(engine.get(1, "tl", "k").unwrap().offset, 2);
    }
}
