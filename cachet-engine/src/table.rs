//! Protocol core: per-namespace state plus the coherency/locking state
//! machine.
//!
//! [`CacheTable`] implements the whole contract over plain in-memory state —
//! offsets, the two lock tiers, lazy expiry, owner-write release, and the
//! foreign-unlock flush. Drivers wrap it with their sharing substrate
//! (`Arc<RwLock<_>>`, a thread-local cell, a per-instance lock) and pass the
//! clock in on every call, which keeps expiry decisions testable with
//! synthetic timestamps.
//!
//! Pages are ordinary entries addressed by page name; the monolithic image
//! occupies its own slot. The two lock tiers gate disjoint operation sets,
//! with `flush_cache_page` as the single dual-tier check.

use cachet_core::{
    CacheError, CacheResult, CacheValue, LockLease, Offset, ProcessId, Timestamp, INITIAL_OFFSET,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::read::{BulkRead, CacheRead};

// ============================================================================
// NAMESPACE SLOT
// ============================================================================

/// Versioning, data, and lock state of one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceSlot {
    /// Current offset; starts at [`INITIAL_OFFSET`], bumped only by flushes.
    pub offset: Offset,
    /// Key-level entries. Paged-mode pages live here under their page names.
    pub entries: HashMap<String, CacheValue>,
    /// Monolithic image, when one has been written.
    pub image: Option<CacheValue>,
    /// Coarse tier: gates key-level operations.
    pub namespace_lock: Option<LockLease>,
    /// Fine tier, monolithic flavor: gates image operations.
    pub image_lock: Option<LockLease>,
    /// Fine tier, paged flavor: one lease per locked page name.
    pub page_locks: HashMap<String, LockLease>,
}

impl Default for NamespaceSlot {
    fn default() -> Self {
        NamespaceSlot {
            offset: INITIAL_OFFSET,
            entries: HashMap::new(),
            image: None,
            namespace_lock: None,
            image_lock: None,
            page_locks: HashMap::new(),
        }
    }
}

// ============================================================================
// CACHE TABLE
// ============================================================================

/// The coherency and locking state machine over plain data.
///
/// Not synchronized; callers provide exclusion and the current time. Every
/// operation mirrors one engine-contract operation exactly, so a driver
/// built on a `CacheTable` passes the conformance battery by construction.
#[derive(Debug, Clone, Default)]
pub struct CacheTable {
    namespaces: HashMap<String, NamespaceSlot>,
}

impl CacheTable {
    pub fn new() -> Self {
        CacheTable::default()
    }

    /// Current offset of `namespace`. A namespace with no recorded state
    /// sits at [`INITIAL_OFFSET`]; inspection never creates state.
    pub fn current_offset(&self, namespace: &str) -> Offset {
        self.namespaces
            .get(namespace)
            .map_or(INITIAL_OFFSET, |slot| slot.offset)
    }

    // === Key Operations ===

    pub fn get(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        now: Timestamp,
    ) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        self.check_namespace_gate(pid, namespace, now)?;
        let value = self
            .namespaces
            .get(namespace)
            .and_then(|slot| slot.entries.get(key).cloned());
        Ok(CacheRead {
            value,
            offset: self.current_offset(namespace),
        })
    }

    pub fn get_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        now: Timestamp,
    ) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(keys, "key")?;
        self.check_namespace_gate(pid, namespace, now)?;
        let mut entries = HashMap::new();
        if let Some(slot) = self.namespaces.get(namespace) {
            for key in keys {
                if let Some(value) = slot.entries.get(*key) {
                    entries.insert((*key).to_string(), value.clone());
                }
            }
        }
        Ok(BulkRead {
            entries,
            offset: self.current_offset(namespace),
        })
    }

    pub fn set(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        self.check_offset(namespace, check_offset)?;
        self.check_namespace_gate(pid, namespace, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        slot.entries.insert(key.to_string(), value);
        release_namespace_lock_if_owned(slot, pid);
        Ok(())
    }

    pub fn set_multi(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        for key in entries.keys() {
            check_name(key, "key")?;
        }
        self.check_offset(namespace, check_offset)?;
        self.check_namespace_gate(pid, namespace, now)?;
        let wrote = !entries.is_empty();
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        slot.entries.extend(entries);
        if wrote {
            release_namespace_lock_if_owned(slot, pid);
        }
        Ok(())
    }

    pub fn del(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<bool> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        self.check_offset(namespace, check_offset)?;
        self.check_namespace_gate(pid, namespace, now)?;
        let Some(slot) = self.namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        purge_expired(slot, now);
        let removed = slot.entries.remove(key).is_some();
        if removed {
            release_namespace_lock_if_owned(slot, pid);
        }
        Ok(removed)
    }

    pub fn del_multi(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<usize> {
        check_name(namespace, "namespace")?;
        check_names(keys, "key")?;
        self.check_offset(namespace, check_offset)?;
        self.check_namespace_gate(pid, namespace, now)?;
        let Some(slot) = self.namespaces.get_mut(namespace) else {
            return Ok(0);
        };
        purge_expired(slot, now);
        let mut removed = 0usize;
        for key in keys {
            if slot.entries.remove(*key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            release_namespace_lock_if_owned(slot, pid);
        }
        Ok(removed)
    }

    // === Namespace Operations ===

    /// Global epoch reset: every namespace's entries, image, locks, and
    /// offset history disappear; the next write anywhere starts at
    /// [`INITIAL_OFFSET`].
    pub fn flush_all(&mut self) -> CacheResult<()> {
        self.namespaces.clear();
        debug!("flushed all namespaces");
        Ok(())
    }

    /// Clear one namespace's entries, image, and locks; bump and return its
    /// offset. Ignores existing locks; always succeeds.
    pub fn flush_namespace(&mut self, namespace: &str) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        let slot = self.slot(namespace);
        flush_slot(slot);
        debug!(namespace, offset = slot.offset, "flushed namespace");
        Ok(slot.offset)
    }

    // === Monolithic Image Operations ===

    pub fn write_cache(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        self.check_offset(namespace, check_offset)?;
        self.check_image_gate(pid, namespace, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        slot.image = Some(image);
        if slot.image_lock.as_ref().map_or(false, |l| l.holder == pid) {
            slot.image_lock = None;
        }
        Ok(())
    }

    pub fn read_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        now: Timestamp,
    ) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        self.check_image_gate(pid, namespace, now)?;
        let value = self
            .namespaces
            .get(namespace)
            .and_then(|slot| slot.image.clone());
        Ok(CacheRead {
            value,
            offset: self.current_offset(namespace),
        })
    }

    /// Atomically return the current image and install (or refresh) the
    /// image lock for `pid`.
    pub fn lock_cache(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        self.check_image_gate(pid, namespace, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        if let Some(lease) = slot.image_lock.as_mut() {
            lease.refresh(ttl, now);
        } else {
            slot.image_lock = Some(LockLease::new(pid, ttl, now));
        }
        Ok(CacheRead {
            value: slot.image.clone(),
            offset: slot.offset,
        })
    }

    // === Page Operations ===

    pub fn write_cache_page(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        for name in pages.keys() {
            check_name(name, "page name")?;
        }
        self.check_offset(namespace, check_offset)?;
        let names: Vec<&str> = pages.keys().map(String::as_str).collect();
        self.check_page_gate(pid, namespace, &names, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        for (name, value) in pages {
            if slot.page_locks.get(&name).map_or(false, |l| l.holder == pid) {
                slot.page_locks.remove(&name);
            }
            slot.entries.insert(name, value);
        }
        Ok(())
    }

    pub fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        now: Timestamp,
    ) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        self.check_page_gate(pid, namespace, page_names, now)?;
        let mut entries = HashMap::new();
        if let Some(slot) = self.namespaces.get(namespace) {
            for name in page_names {
                if let Some(value) = slot.entries.get(*name) {
                    entries.insert((*name).to_string(), value.clone());
                }
            }
        }
        Ok(BulkRead {
            entries,
            offset: self.current_offset(namespace),
        })
    }

    /// Delete the named pages. The one dual-tier operation: both a foreign
    /// namespace lock and a foreign lock on any named page fail the call.
    pub fn flush_cache_page(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
        now: Timestamp,
    ) -> CacheResult<usize> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        self.check_offset(namespace, check_offset)?;
        self.check_namespace_gate(pid, namespace, now)?;
        self.check_page_gate(pid, namespace, page_names, now)?;
        let Some(slot) = self.namespaces.get_mut(namespace) else {
            return Ok(0);
        };
        purge_expired(slot, now);
        let mut removed = 0usize;
        for name in page_names {
            if slot.entries.remove(*name).is_some() {
                removed += 1;
            }
            if slot.page_locks.get(*name).map_or(false, |l| l.holder == pid) {
                slot.page_locks.remove(*name);
            }
        }
        if removed > 0 {
            release_namespace_lock_if_owned(slot, pid);
        }
        Ok(removed)
    }

    /// Atomically return the present subset of the named pages and install
    /// (or refresh) a page lock for every requested name, stored or not.
    pub fn lock_cache_page(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
        now: Timestamp,
    ) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        self.check_page_gate(pid, namespace, page_names, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        let mut entries = HashMap::new();
        for name in page_names {
            if let Some(lease) = slot.page_locks.get_mut(*name) {
                lease.refresh(ttl, now);
            } else {
                slot.page_locks
                    .insert((*name).to_string(), LockLease::new(pid, ttl, now));
            }
            if let Some(value) = slot.entries.get(*name) {
                entries.insert((*name).to_string(), value.clone());
            }
        }
        Ok(BulkRead {
            entries,
            offset: slot.offset,
        })
    }

    // === Namespace Lock Operations ===

    /// Install (or refresh) the namespace lock for `pid`; returns the
    /// current offset.
    pub fn lock_namespace(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
        now: Timestamp,
    ) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        self.check_namespace_gate(pid, namespace, now)?;
        let slot = self.slot(namespace);
        purge_expired(slot, now);
        if let Some(lease) = slot.namespace_lock.as_mut() {
            lease.refresh(ttl, now);
        } else {
            slot.namespace_lock = Some(LockLease::new(pid, ttl, now));
        }
        Ok(slot.offset)
    }

    /// Release the namespace lock.
    ///
    /// An owner call simply clears it. A call by a different PID while a
    /// live foreign lock exists still succeeds, but flushes the namespace
    /// first: the lock may have covered an in-flight write, and erasing the
    /// namespace keeps a masked write from being read as current. With no
    /// live lock the call is a no-op. Returns the resulting offset.
    pub fn unlock_namespace(
        &mut self,
        pid: ProcessId,
        namespace: &str,
        now: Timestamp,
    ) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        let Some(slot) = self.namespaces.get_mut(namespace) else {
            return Ok(INITIAL_OFFSET);
        };
        purge_expired(slot, now);
        match slot.namespace_lock.as_ref().map(|lease| lease.holder) {
            None => Ok(slot.offset),
            Some(holder) if holder == pid => {
                slot.namespace_lock = None;
                Ok(slot.offset)
            }
            Some(holder) => {
                warn!(
                    namespace,
                    holder,
                    caller = pid,
                    "unlock by foreign PID, flushing namespace"
                );
                flush_slot(slot);
                Ok(slot.offset)
            }
        }
    }

    // === Internal ===

    fn slot(&mut self, namespace: &str) -> &mut NamespaceSlot {
        self.namespaces.entry(namespace.to_string()).or_default()
    }

    fn check_offset(&self, namespace: &str, expected: Offset) -> CacheResult<()> {
        let current = self.current_offset(namespace);
        if expected != current {
            return Err(CacheError::offset_mismatch(namespace, expected, current));
        }
        Ok(())
    }

    fn check_namespace_gate(
        &self,
        pid: ProcessId,
        namespace: &str,
        now: Timestamp,
    ) -> CacheResult<()> {
        if let Some(lease) = self
            .namespaces
            .get(namespace)
            .and_then(|slot| slot.namespace_lock.as_ref())
        {
            if lease.blocks(pid, now) {
                return Err(CacheError::namespace_locked(namespace, lease.holder));
            }
        }
        Ok(())
    }

    fn check_image_gate(&self, pid: ProcessId, namespace: &str, now: Timestamp) -> CacheResult<()> {
        if let Some(lease) = self
            .namespaces
            .get(namespace)
            .and_then(|slot| slot.image_lock.as_ref())
        {
            if lease.blocks(pid, now) {
                return Err(CacheError::image_locked(namespace, lease.holder));
            }
        }
        Ok(())
    }

    fn check_page_gate(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        now: Timestamp,
    ) -> CacheResult<()> {
        let Some(slot) = self.namespaces.get(namespace) else {
            return Ok(());
        };
        let locked: Vec<String> = page_names
            .iter()
            .filter(|name| {
                slot.page_locks
                    .get(**name)
                    .map_or(false, |lease| lease.blocks(pid, now))
            })
            .map(|name| (*name).to_string())
            .collect();
        if locked.is_empty() {
            Ok(())
        } else {
            Err(CacheError::pages_locked(namespace, locked))
        }
    }
}

/// Clear data and locks, bump the offset. Shared by `flush_namespace` and
/// the foreign-unlock path.
fn flush_slot(slot: &mut NamespaceSlot) {
    slot.offset += 1;
    slot.entries.clear();
    slot.image = None;
    slot.namespace_lock = None;
    slot.image_lock = None;
    slot.page_locks.clear();
}

/// Drop leases that have expired. Mutating operations call this so stale
/// leases do not linger once a slot is touched.
fn purge_expired(slot: &mut NamespaceSlot, now: Timestamp) {
    if slot
        .namespace_lock
        .as_ref()
        .map_or(false, |l| l.is_expired(now))
    {
        slot.namespace_lock = None;
    }
    if slot.image_lock.as_ref().map_or(false, |l| l.is_expired(now)) {
        slot.image_lock = None;
    }
    slot.page_locks.retain(|_, lease| !lease.is_expired(now));
}

/// Owner-write release for the coarse tier.
fn release_namespace_lock_if_owned(slot: &mut NamespaceSlot, pid: ProcessId) {
    if slot.namespace_lock.as_ref().map_or(false, |l| l.holder == pid) {
        slot.namespace_lock = None;
    }
}

pub(crate) fn check_name(value: &str, what: &str) -> CacheResult<()> {
    if value.is_empty() {
        return Err(CacheError::bad_arguments(format!("{what} must not be empty")));
    }
    Ok(())
}

pub(crate) fn check_names(values: &[&str], what: &str) -> CacheResult<()> {
    for value in values {
        check_name(value, what)?;
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::ErrorKind;
    use chrono::Utc;
    use serde_json::json;

    const PID_A: ProcessId = 1337;
    const PID_B: ProcessId = 6900;

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_first_write_after_flush_all_sees_offset_one() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.flush_all().unwrap();
        table.set(PID_A, "ns_1", "var_4", json!(0), 1, now).unwrap();
        let read = table.get(PID_A, "ns_1", "var_4", now).unwrap();
        assert_eq!(read.value, Some(json!(0)));
        assert!(read.valid());
        assert_eq!(read.offset, 1);
    }

    #[test]
    fn test_set_with_stale_offset_is_rejected() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let err = table
            .set(PID_A, "ns_1", "var_4", json!(0), 99, now)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OffsetMismatch);
        assert_eq!(err.context.expected_offset, Some(99));
        assert_eq!(err.context.current_offset, Some(1));
        assert_eq!(table.current_offset("ns_1"), 1);
    }

    #[test]
    fn test_set_leaves_offset_unchanged() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.set(PID_A, "ns_1", "a", json!(1), 1, now).unwrap();
        table.set(PID_A, "ns_1", "b", json!(2), 1, now).unwrap();
        assert_eq!(table.current_offset("ns_1"), 1);
    }

    #[test]
    fn test_flush_namespace_increments_even_when_empty() {
        let mut table = CacheTable::new();
        assert_eq!(table.flush_namespace("ns_2").unwrap(), 2);
        assert_eq!(table.flush_namespace("ns_2").unwrap(), 3);
    }

    #[test]
    fn test_flush_all_resets_every_namespace_to_initial() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.flush_namespace("ns_1").unwrap();
        table.flush_namespace("ns_1").unwrap();
        table.set(PID_A, "ns_1", "k", json!(1), 3, now).unwrap();
        table.flush_all().unwrap();
        assert_eq!(table.current_offset("ns_1"), INITIAL_OFFSET);
        assert_eq!(table.get(PID_A, "ns_1", "k", now).unwrap().value, None);
    }

    #[test]
    fn test_del_missing_key_is_false_not_error() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        assert!(!table.del(PID_A, "ns_1", "nonexistent", 1, now).unwrap());
        let err = table
            .del(PID_A, "ns_1", "nonexistent", 99, now)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OffsetMismatch);
    }

    #[test]
    fn test_del_multi_counts_only_real_deletions() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.set(PID_A, "ns_1", "a", json!(1), 1, now).unwrap();
        table.set(PID_A, "ns_1", "b", json!(2), 1, now).unwrap();
        let removed = table
            .del_multi(PID_A, "ns_1", &["a", "b", "c"], 1, now)
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_get_multi_omits_absent_keys() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.set(PID_A, "ns_1", "a", json!(1), 1, now).unwrap();
        let read = table.get_multi(PID_A, "ns_1", &["a", "z"], now).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read.get("a"), Some(&json!(1)));
        assert!(!read.contains("z"));
        assert_eq!(read.offset, 1);
    }

    #[test]
    fn test_namespace_lock_blocks_foreign_key_ops() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let offset = table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        assert_eq!(offset, 1);

        let err = table.get(PID_B, "ns_1", "var_1", now).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockConflict);
        assert_eq!(err.holder(), Some(PID_A));
        assert!(table.set(PID_B, "ns_1", "k", json!(1), 1, now).is_err());
        assert!(table.del(PID_B, "ns_1", "k", 1, now).is_err());
        assert!(table.get_multi(PID_B, "ns_1", &["k"], now).is_err());

        // Owner passes its own lock.
        table.get(PID_A, "ns_1", "var_1", now).unwrap();
    }

    #[test]
    fn test_unlock_by_owner_releases_without_flush() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.set(PID_A, "ns_1", "k", json!(7), 1, now).unwrap();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        assert_eq!(table.unlock_namespace(PID_A, "ns_1", now).unwrap(), 1);
        let read = table.get(PID_B, "ns_1", "k", now).unwrap();
        assert_eq!(read.value, Some(json!(7)));
    }

    #[test]
    fn test_unlock_by_foreign_pid_flushes_first() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table.set(PID_A, "ns_1", "k", json!(7), 1, now).unwrap();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(60), now)
            .unwrap();
        let offset = table.unlock_namespace(PID_B, "ns_1", now).unwrap();
        assert_eq!(offset, 2);
        let read = table.get(PID_B, "ns_1", "k", now).unwrap();
        assert_eq!(read.value, None);
        assert_eq!(read.offset, 2);
    }

    #[test]
    fn test_unlock_without_lock_is_noop() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        assert_eq!(table.unlock_namespace(PID_B, "ns_1", now).unwrap(), 1);
        // Expired foreign lease counts as no lock: no flush happens.
        table
            .lock_namespace(PID_A, "ns_1", Duration::ZERO, now)
            .unwrap();
        assert_eq!(table.unlock_namespace(PID_B, "ns_1", now).unwrap(), 1);
    }

    #[test]
    fn test_owner_write_releases_namespace_lock() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(60), now)
            .unwrap();
        table.set(PID_A, "ns_1", "k", json!(1), 1, now).unwrap();
        table.get(PID_B, "ns_1", "k", now).unwrap();
    }

    #[test]
    fn test_del_that_removes_nothing_keeps_lock() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(60), now)
            .unwrap();
        assert!(!table.del(PID_A, "ns_1", "missing", 1, now).unwrap());
        assert!(table.get(PID_B, "ns_1", "missing", now).is_err());
    }

    #[test]
    fn test_lock_expiry_is_lazy() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        assert!(table.get(PID_B, "ns_1", "k", now).is_err());
        let after_expiry = now + secs(6);
        table.get(PID_B, "ns_1", "k", after_expiry).unwrap();
        table
            .set(PID_B, "ns_1", "k", json!(1), 1, after_expiry)
            .unwrap();
    }

    #[test]
    fn test_mutation_purges_expired_leases() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        let after_expiry = now + secs(6);
        table
            .set(PID_B, "ns_1", "k", json!(1), 1, after_expiry)
            .unwrap();
        let slot = table.namespaces.get("ns_1").unwrap();
        assert!(slot.namespace_lock.is_none());
    }

    #[test]
    fn test_relock_by_owner_refreshes_expiry() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        let later = now + secs(4);
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), later)
            .unwrap();
        // Past the first lease's expiry, but inside the refreshed one.
        let probe = now + secs(7);
        assert!(table.get(PID_B, "ns_1", "k", probe).is_err());
    }

    #[test]
    fn test_image_write_read_roundtrip_is_separate_from_entries() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let image = json!({"rows": [1, 2, 3]});
        table
            .write_cache(PID_A, "ns_1", image.clone(), 1, now)
            .unwrap();
        let read = table.read_cache(PID_A, "ns_1", now).unwrap();
        assert_eq!(read.value, Some(image));
        assert_eq!(read.offset, 1);
        // Key-level view does not see the image.
        assert_eq!(table.get(PID_A, "ns_1", "rows", now).unwrap().value, None);
    }

    #[test]
    fn test_image_lock_gates_image_ops_only() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .write_cache(PID_A, "ns_1", json!("img"), 1, now)
            .unwrap();
        let held = table
            .lock_cache(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        assert_eq!(held.value, Some(json!("img")));

        let err = table.read_cache(PID_B, "ns_1", now).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockConflict);
        assert!(table
            .write_cache(PID_B, "ns_1", json!("x"), 1, now)
            .is_err());
        // Key-level tier is unaffected.
        table.set(PID_B, "ns_1", "k", json!(1), 1, now).unwrap();
        table.get(PID_B, "ns_1", "k", now).unwrap();
    }

    #[test]
    fn test_owner_image_write_clears_image_lock() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_cache(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        table
            .write_cache(PID_A, "ns_1", json!("fresh"), 1, now)
            .unwrap();
        let read = table.read_cache(PID_B, "ns_1", now).unwrap();
        assert_eq!(read.value, Some(json!("fresh")));
    }

    #[test]
    fn test_page_lock_blocks_foreign_page_reads_with_context() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!({"cells": [0]}));
        table
            .write_cache_page(PID_A, "ns_1", pages, 1, now)
            .unwrap();
        table
            .lock_cache_page(PID_A, "ns_1", &["p1"], Duration::from_secs(5), now)
            .unwrap();

        let err = table
            .read_cache_page(PID_B, "ns_1", &["p1"], now)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockConflict);
        assert!(err.context.pages.contains(&"p1".to_string()));
        // A different page stays readable.
        table.read_cache_page(PID_B, "ns_1", &["p2"], now).unwrap();
        // Key-level ops ignore page locks.
        table.get(PID_B, "ns_1", "p1", now).unwrap();
    }

    #[test]
    fn test_owner_page_write_releases_named_page_locks() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_cache_page(PID_A, "ns_1", &["p1", "p2"], Duration::from_secs(5), now)
            .unwrap();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!(1));
        table
            .write_cache_page(PID_A, "ns_1", pages, 1, now)
            .unwrap();
        table.read_cache_page(PID_B, "ns_1", &["p1"], now).unwrap();
        // p2's lock survives; only written pages are released.
        assert!(table.read_cache_page(PID_B, "ns_1", &["p2"], now).is_err());
    }

    #[test]
    fn test_lock_cache_page_covers_absent_pages_too() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let held = table
            .lock_cache_page(PID_A, "ns_1", &["ghost"], Duration::from_secs(5), now)
            .unwrap();
        assert!(held.is_empty());
        assert!(table
            .read_cache_page(PID_B, "ns_1", &["ghost"], now)
            .is_err());
    }

    #[test]
    fn test_flush_cache_page_checks_both_tiers() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!(1));
        pages.insert("p2".to_string(), json!(2));
        table
            .write_cache_page(PID_A, "ns_1", pages, 1, now)
            .unwrap();

        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        let err = table
            .flush_cache_page(PID_B, "ns_1", &["p1"], 1, now)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockConflict);
        table.unlock_namespace(PID_A, "ns_1", now).unwrap();

        table
            .lock_cache_page(PID_A, "ns_1", &["p2"], Duration::from_secs(5), now)
            .unwrap();
        let err = table
            .flush_cache_page(PID_B, "ns_1", &["p1", "p2"], 1, now)
            .unwrap_err();
        assert!(err.context.pages.contains(&"p2".to_string()));

        // Owner flush removes the page, its lock, and reports the count.
        let removed = table
            .flush_cache_page(PID_A, "ns_1", &["p1", "p2", "p9"], 1, now)
            .unwrap();
        assert_eq!(removed, 2);
        table.read_cache_page(PID_B, "ns_1", &["p2"], now).unwrap();
        // Offset is untouched by a page flush.
        assert_eq!(table.current_offset("ns_1"), 1);
    }

    #[test]
    fn test_namespace_lock_does_not_gate_image_or_page_ops() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        table
            .write_cache(PID_B, "ns_1", json!("img"), 1, now)
            .unwrap();
        table.read_cache(PID_B, "ns_1", now).unwrap();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!(1));
        table
            .write_cache_page(PID_B, "ns_1", pages, 1, now)
            .unwrap();
        table.read_cache_page(PID_B, "ns_1", &["p1"], now).unwrap();
    }

    #[test]
    fn test_empty_names_are_bad_arguments() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        assert_eq!(
            table.get(PID_A, "", "k", now).unwrap_err().kind,
            ErrorKind::BadArguments
        );
        assert_eq!(
            table.set(PID_A, "ns", "", json!(1), 1, now).unwrap_err().kind,
            ErrorKind::BadArguments
        );
        assert_eq!(
            table
                .read_cache_page(PID_A, "ns", &[""], now)
                .unwrap_err()
                .kind,
            ErrorKind::BadArguments
        );
        assert_eq!(
            table.flush_namespace("").unwrap_err().kind,
            ErrorKind::BadArguments
        );
    }

    #[test]
    fn test_offset_checked_before_lock_state() {
        let mut table = CacheTable::new();
        let now = Utc::now();
        table
            .lock_namespace(PID_A, "ns_1", Duration::from_secs(5), now)
            .unwrap();
        // Both failures apply; the stale offset wins.
        let err = table
            .set(PID_B, "ns_1", "k", json!(1), 42, now)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OffsetMismatch);
    }
}
