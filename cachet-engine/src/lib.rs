//! Storage engines for the cachet coherency protocol.
//!
//! Every engine drives the same state machine — per-namespace offsets,
//! optimistic `check_offset` validation, and two disjoint lock tiers — over a
//! different substrate:
//!
//! - [`SharedMemoryEngine`]: one shared table behind `Arc<RwLock<_>>`; clones
//!   observe each other. The default for tests and single-process use.
//! - [`LoopbackEngine`]: a private table per instance. Useful as a stand-in
//!   where cross-process visibility is explicitly unwanted.
//! - [`ThreadLocalEngine`]: one table per OS thread.
//! - [`RedisEngine`]: namespaces mapped onto Redis keys, mutations executed
//!   as `WATCH`-guarded transactions.
//!
//! The protocol logic itself lives in [`CacheTable`]; in-memory engines wrap
//! a table directly, and the conformance battery in [`conformance`] checks
//! any [`CacheEngine`] against the contract.

pub mod conformance;
pub mod memory;
pub mod read;
pub mod redis;
pub mod table;
pub mod thread_local;

pub use memory::{LoopbackEngine, SharedMemoryEngine};
pub use read::{BulkRead, CacheRead};
pub use self::redis::{RedisConfig, RedisEngine};
pub use table::{CacheTable, NamespaceSlot};
pub use thread_local::ThreadLocalEngine;

use cachet_core::{CacheResult, CacheValue, Offset, ProcessId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ENGINE CONTRACT
// ============================================================================

/// The full coherency contract a cache backend must honor.
///
/// Callers identify themselves by `pid` on every call; lock ownership and the
/// owner-write release rule key off it. Mutations carry a `check_offset` that
/// must equal the namespace's current offset, checked before any lock state
/// is consulted. Key-level operations answer to the namespace lock; image and
/// page operations answer to the entry-lock tier; `flush_cache_page` alone
/// answers to both.
///
/// Implementations are synchronous and must be safe to share across threads.
pub trait CacheEngine: Send + Sync {
    /// Liveness probe of the underlying store.
    fn ping(&self) -> CacheResult<()>;

    // === Key Operations ===

    /// Read one key. Absent keys read as `None`; the namespace offset rides
    /// along for later optimistic writes.
    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead>;

    /// Read several keys in one pass. Absent keys are omitted from the
    /// result rather than reported as errors.
    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead>;

    /// Write one key. Leaves the offset unchanged; releases a namespace
    /// lock held by `pid`.
    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()>;

    /// Write several keys in one pass, under a single offset check.
    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()>;

    /// Delete one key; `false` means the key was not stored. Deleting
    /// nothing keeps a held namespace lock in place.
    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool>;

    /// Delete several keys; returns how many were actually removed.
    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize>;

    // === Namespace Operations ===

    /// Erase everything in every namespace, offsets included. The next
    /// writer anywhere starts from the initial offset again.
    fn flush_all(&self) -> CacheResult<()>;

    /// Erase one namespace's data and locks and bump its offset, which is
    /// returned. Succeeds regardless of lock state.
    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset>;

    // === Monolithic Image Operations ===

    /// Replace the namespace's monolithic image. Releases an image lock
    /// held by `pid`.
    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()>;

    /// Read the monolithic image, `None` when never written.
    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead>;

    /// Read the image and take (or refresh) the image lock in one step.
    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead>;

    // === Page Operations ===

    /// Write a batch of pages under a single offset check. Releases page
    /// locks held by `pid` on the written pages.
    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()>;

    /// Read the named pages; absent pages are omitted.
    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead>;

    /// Delete the named pages and return how many existed. Checked against
    /// both lock tiers; the namespace offset is not bumped.
    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize>;

    /// Read the named pages and take (or refresh) a lock on each requested
    /// name, stored or not, in one step.
    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead>;

    // === Namespace Lock Operations ===

    /// Take (or refresh) the namespace lock; returns the current offset so
    /// the holder can write without a separate read.
    fn lock_namespace(&self, pid: ProcessId, namespace: &str, ttl: Duration)
        -> CacheResult<Offset>;

    /// Release the namespace lock and return the resulting offset. A call
    /// by a PID other than the live holder flushes the namespace first.
    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset>;
}

impl<E: CacheEngine + ?Sized> CacheEngine for Arc<E> {
    fn ping(&self) -> CacheResult<()> {
        (**self).ping()
    }

    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead> {
        (**self).get(pid, namespace, key)
    }

    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead> {
        (**self).get_multi(pid, namespace, keys)
    }

    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        (**self).set(pid, namespace, key, value, check_offset)
    }

    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        (**self).set_multi(pid, namespace, entries, check_offset)
    }

    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool> {
        (**self).del(pid, namespace, key, check_offset)
    }

    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        (**self).del_multi(pid, namespace, keys, check_offset)
    }

    fn flush_all(&self) -> CacheResult<()> {
        (**self).flush_all()
    }

    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset> {
        (**self).flush_namespace(namespace)
    }

    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        (**self).write_cache(pid, namespace, image, check_offset)
    }

    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead> {
        (**self).read_cache(pid, namespace)
    }

    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead> {
        (**self).lock_cache(pid, namespace, ttl)
    }

    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        (**self).write_cache_page(pid, namespace, pages, check_offset)
    }

    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead> {
        (**self).read_cache_page(pid, namespace, page_names)
    }

    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        (**self).flush_cache_page(pid, namespace, page_names, check_offset)
    }

    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead> {
        (**self).lock_cache_page(pid, namespace, page_names, ttl)
    }

    fn lock_namespace(
        &self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
    ) -> CacheResult<Offset> {
        (**self).lock_namespace(pid, namespace, ttl)
    }

    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset> {
        (**self).unlock_namespace(pid, namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_contract_is_dyn_compatible() {
        let engine: Arc<dyn CacheEngine> = Arc::new(SharedMemoryEngine::new());
        engine.ping().unwrap();
        engine.set(1, "ns", "k", json!(true), 1).unwrap();
        assert_eq!(engine.get(1, "ns", "k").unwrap().value, Some(json!(true)));
    }

    #[test]
    fn test_arc_wrapper_shares_the_engine() {
        let engine = Arc::new(SharedMemoryEngine::new());
        let other = Arc::clone(&engine);
        engine.set(1, "ns", "k", json!(5), 1).unwrap();
        assert_eq!(other.get(2, "ns", "k").unwrap().value, Some(json!(5)));
    }
}
