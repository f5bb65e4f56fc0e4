//! Contract battery every engine must pass.
//!
//! [`run_all`] drives a fresh engine through each named check: offset
//! round-trips, both lock tiers, tier disjointness, owner-write release,
//! foreign-unlock flush, and lease expiry against the real clock. Driver
//! test modules call it with their constructor; the Redis driver's run is
//! `#[ignore]`d behind a live server.
//!
//! Checks assert with `expect` and panic on contract violations, so this
//! module is test support, not production surface.

use cachet_core::{codes, CacheValue, ErrorKind, ProcessId};
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crate::CacheEngine;

const PID_A: ProcessId = 1337;
const PID_B: ProcessId = 6900;

/// Canonical values every backend must carry through set/get without
/// structural loss.
static ROUND_TRIP_FIXTURES: Lazy<Vec<CacheValue>> = Lazy::new(|| {
    vec![
        json!(null),
        json!(false),
        json!(true),
        json!(0),
        json!(-1),
        json!(1.7),
        json!("foo"),
        json!([1, [2, 3], {"k": "v"}]),
        json!({"name": "grid", "dims": {"w": 4, "h": 2}, "tags": ["a"]}),
    ]
});

/// Long enough to never expire inside a check.
const HOLD: Duration = Duration::from_secs(30);
/// Short enough to expire inside a check.
const BLINK: Duration = Duration::from_millis(50);

fn wait_past(ttl: Duration) {
    std::thread::sleep(ttl + Duration::from_millis(100));
}

/// Run every check against engines produced by `factory`. Each check gets a
/// freshly constructed, freshly flushed engine, so factories may hand out
/// handles to shared state (a server, a thread-local table) without checks
/// contaminating each other.
pub fn run_all<E, F>(factory: F)
where
    E: CacheEngine,
    F: Fn() -> E,
{
    for (name, check) in checks::<E>() {
        let engine = factory();
        engine
            .flush_all()
            .unwrap_or_else(|err| panic!("{name}: flush_all failed: {err}"));
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| check(&engine))) {
            eprintln!("conformance check failed: {name}");
            std::panic::resume_unwind(payload);
        }
    }
}

fn checks<E: CacheEngine>() -> Vec<(&'static str, fn(&E))> {
    vec![
        ("ping_succeeds", ping_succeeds::<E>),
        (
            "missing_key_reads_none_at_initial_offset",
            missing_key_reads_none_at_initial_offset::<E>,
        ),
        ("set_then_get_round_trips", set_then_get_round_trips::<E>),
        (
            "fixture_values_survive_storage",
            fixture_values_survive_storage::<E>,
        ),
        ("set_rejects_stale_offset", set_rejects_stale_offset::<E>),
        ("set_does_not_bump_offset", set_does_not_bump_offset::<E>),
        (
            "get_multi_returns_present_subset",
            get_multi_returns_present_subset::<E>,
        ),
        (
            "set_multi_writes_all_under_one_check",
            set_multi_writes_all_under_one_check::<E>,
        ),
        ("del_reports_presence", del_reports_presence::<E>),
        ("del_multi_counts_removals", del_multi_counts_removals::<E>),
        (
            "flush_namespace_bumps_offset_and_clears",
            flush_namespace_bumps_offset_and_clears::<E>,
        ),
        ("flush_namespace_clears_locks", flush_namespace_clears_locks::<E>),
        ("flush_all_resets_offsets", flush_all_resets_offsets::<E>),
        ("offset_retry_cycle_recovers", offset_retry_cycle_recovers::<E>),
        (
            "namespace_lock_blocks_foreign_key_ops",
            namespace_lock_blocks_foreign_key_ops::<E>,
        ),
        (
            "namespace_lock_owner_passes",
            namespace_lock_owner_passes::<E>,
        ),
        (
            "owner_set_releases_namespace_lock",
            owner_set_releases_namespace_lock::<E>,
        ),
        (
            "noop_del_keeps_namespace_lock",
            noop_del_keeps_namespace_lock::<E>,
        ),
        (
            "lock_namespace_returns_current_offset",
            lock_namespace_returns_current_offset::<E>,
        ),
        ("relock_by_owner_succeeds", relock_by_owner_succeeds::<E>),
        (
            "unlock_by_owner_preserves_data",
            unlock_by_owner_preserves_data::<E>,
        ),
        (
            "unlock_by_foreign_pid_flushes",
            unlock_by_foreign_pid_flushes::<E>,
        ),
        ("unlock_without_lock_is_noop", unlock_without_lock_is_noop::<E>),
        ("namespace_lock_expires", namespace_lock_expires::<E>),
        (
            "image_write_read_round_trips",
            image_write_read_round_trips::<E>,
        ),
        ("missing_image_reads_none", missing_image_reads_none::<E>),
        (
            "lock_cache_returns_image_and_blocks",
            lock_cache_returns_image_and_blocks::<E>,
        ),
        (
            "owner_image_write_releases_image_lock",
            owner_image_write_releases_image_lock::<E>,
        ),
        (
            "image_lock_ignores_key_tier",
            image_lock_ignores_key_tier::<E>,
        ),
        (
            "namespace_lock_ignores_entry_tier",
            namespace_lock_ignores_entry_tier::<E>,
        ),
        (
            "page_write_read_round_trips",
            page_write_read_round_trips::<E>,
        ),
        (
            "page_lock_blocks_only_named_pages",
            page_lock_blocks_only_named_pages::<E>,
        ),
        (
            "owner_page_write_releases_page_lock",
            owner_page_write_releases_page_lock::<E>,
        ),
        ("page_lock_expires", page_lock_expires::<E>),
        (
            "flush_cache_page_counts_and_keeps_offset",
            flush_cache_page_counts_and_keeps_offset::<E>,
        ),
        (
            "flush_cache_page_honors_both_tiers",
            flush_cache_page_honors_both_tiers::<E>,
        ),
        (
            "lock_cache_page_covers_absent_pages",
            lock_cache_page_covers_absent_pages::<E>,
        ),
        (
            "empty_names_are_bad_arguments",
            empty_names_are_bad_arguments::<E>,
        ),
        (
            "image_and_entries_are_disjoint",
            image_and_entries_are_disjoint::<E>,
        ),
    ]
}

// === Basics ===

fn ping_succeeds<E: CacheEngine>(engine: &E) {
    engine.ping().expect("engine reachable");
}

fn missing_key_reads_none_at_initial_offset<E: CacheEngine>(engine: &E) {
    let read = engine.get(PID_A, "ns_1", "absent").expect("read");
    assert_eq!(read.value, None);
    assert_eq!(read.offset, 1);
    assert!(!read.valid());
}

fn set_then_get_round_trips<E: CacheEngine>(engine: &E) {
    let value = json!({"count": 3, "tags": ["a", "b"]});
    engine
        .set(PID_A, "ns_1", "var_4", value.clone(), 1)
        .expect("write at initial offset");
    let read = engine.get(PID_B, "ns_1", "var_4").expect("read");
    assert_eq!(read.value, Some(value));
    assert!(read.valid());
}

fn fixture_values_survive_storage<E: CacheEngine>(engine: &E) {
    for (i, value) in ROUND_TRIP_FIXTURES.iter().enumerate() {
        let key = format!("fixture_{i}");
        engine
            .set(PID_A, "ns_1", &key, value.clone(), 1)
            .expect("write fixture");
        let read = engine.get(PID_B, "ns_1", &key).expect("read fixture");
        assert_eq!(read.value.as_ref(), Some(value), "fixture {i} lost shape");
    }
}

fn set_rejects_stale_offset<E: CacheEngine>(engine: &E) {
    let err = engine
        .set(PID_A, "ns_1", "var_4", json!(0), 99)
        .expect_err("stale offset must fail");
    assert_eq!(err.kind, ErrorKind::OffsetMismatch);
    assert_eq!(err.code, codes::OFFSET_MISMATCH);
    assert_eq!(err.context.expected_offset, Some(99));
    assert_eq!(err.context.current_offset, Some(1));
    // The failed write left nothing behind.
    assert_eq!(engine.get(PID_A, "ns_1", "var_4").expect("read").value, None);
}

fn set_does_not_bump_offset<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "a", json!(1), 1).expect("write");
    engine.set(PID_A, "ns_1", "b", json!(2), 1).expect("write");
    assert_eq!(engine.get(PID_A, "ns_1", "a").expect("read").offset, 1);
}

fn get_multi_returns_present_subset<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "a", json!(1), 1).expect("write");
    engine.set(PID_A, "ns_1", "b", json!(2), 1).expect("write");
    let read = engine
        .get_multi(PID_A, "ns_1", &["a", "b", "z"])
        .expect("bulk read");
    assert_eq!(read.len(), 2);
    assert_eq!(read.get("a"), Some(&json!(1)));
    assert_eq!(read.get("b"), Some(&json!(2)));
    assert!(!read.contains("z"));
    assert_eq!(read.offset, 1);
}

fn set_multi_writes_all_under_one_check<E: CacheEngine>(engine: &E) {
    let mut entries = HashMap::new();
    entries.insert("x".to_string(), json!(10));
    entries.insert("y".to_string(), json!(20));
    engine
        .set_multi(PID_A, "ns_1", entries, 1)
        .expect("bulk write");
    let read = engine.get_multi(PID_A, "ns_1", &["x", "y"]).expect("read");
    assert_eq!(read.len(), 2);

    let mut stale = HashMap::new();
    stale.insert("z".to_string(), json!(30));
    let err = engine
        .set_multi(PID_A, "ns_1", stale, 99)
        .expect_err("stale bulk write");
    assert_eq!(err.kind, ErrorKind::OffsetMismatch);
    assert_eq!(engine.get(PID_A, "ns_1", "z").expect("read").value, None);
}

fn del_reports_presence<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(1), 1).expect("write");
    assert!(engine.del(PID_A, "ns_1", "k", 1).expect("delete"));
    assert!(!engine.del(PID_A, "ns_1", "k", 1).expect("second delete"));
    assert_eq!(engine.get(PID_A, "ns_1", "k").expect("read").value, None);
    // The offset check runs before the existence check.
    let err = engine
        .del(PID_A, "ns_1", "nonexistent", 99)
        .expect_err("stale delete of a missing key");
    assert_eq!(err.kind, ErrorKind::OffsetMismatch);
}

fn del_multi_counts_removals<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "a", json!(1), 1).expect("write");
    engine.set(PID_A, "ns_1", "b", json!(2), 1).expect("write");
    let removed = engine
        .del_multi(PID_A, "ns_1", &["a", "b", "c"], 1)
        .expect("bulk delete");
    assert_eq!(removed, 2);
}

// === Offsets and flushes ===

fn flush_namespace_bumps_offset_and_clears<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(1), 1).expect("write");
    assert_eq!(engine.flush_namespace("ns_1").expect("flush"), 2);
    let read = engine.get(PID_A, "ns_1", "k").expect("read");
    assert_eq!(read.value, None);
    assert_eq!(read.offset, 2);
    // A flush of an untouched namespace still advances it.
    assert_eq!(engine.flush_namespace("ns_untouched").expect("flush"), 2);
}

fn flush_namespace_clears_locks<E: CacheEngine>(engine: &E) {
    engine
        .lock_namespace(PID_A, "ns_1", HOLD)
        .expect("lock");
    engine.flush_namespace("ns_1").expect("flush ignores locks");
    engine.get(PID_B, "ns_1", "k").expect("lock is gone");
}

fn flush_all_resets_offsets<E: CacheEngine>(engine: &E) {
    engine.flush_namespace("ns_1").expect("flush");
    engine.flush_namespace("ns_1").expect("flush");
    engine.flush_namespace("ns_2").expect("flush");
    engine.flush_all().expect("global flush");
    assert_eq!(engine.get(PID_A, "ns_1", "k").expect("read").offset, 1);
    assert_eq!(engine.get(PID_A, "ns_2", "k").expect("read").offset, 1);
    engine
        .set(PID_A, "ns_1", "k", json!(1), 1)
        .expect("write restarts at the initial offset");
}

fn offset_retry_cycle_recovers<E: CacheEngine>(engine: &E) {
    engine
        .set(PID_A, "ns_1", "var_4", json!(0), 1)
        .expect("first write");
    let read = engine.get(PID_A, "ns_1", "var_4").expect("read back");
    assert_eq!(read.value, Some(json!(0)));
    assert_eq!(read.offset, 1);

    // Another process flushes the namespace out from under the writer.
    assert_eq!(engine.flush_namespace("ns_1").expect("foreign flush"), 2);

    let err = engine
        .set(PID_A, "ns_1", "var_4", json!(1), 1)
        .expect_err("stale write");
    assert_eq!(err.code, codes::OFFSET_MISMATCH);
    assert_eq!(err.context.current_offset, Some(2));

    // Refetch, observe the flush, retry at the current offset.
    let fresh = engine.get(PID_A, "ns_1", "var_4").expect("refetch");
    assert_eq!(fresh.value, None);
    engine
        .set(PID_A, "ns_1", "var_4", json!(1), fresh.offset)
        .expect("retry");
    assert_eq!(
        engine.get(PID_A, "ns_1", "var_4").expect("read").value,
        Some(json!(1))
    );
}

// === Namespace locks ===

fn namespace_lock_blocks_foreign_key_ops<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(1), 1).expect("seed");
    let offset = engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    assert_eq!(offset, 1);

    let err = engine.get(PID_B, "ns_1", "k").expect_err("foreign read");
    assert_eq!(err.kind, ErrorKind::LockConflict);
    assert_eq!(err.code, codes::NAMESPACE_LOCK);
    assert_eq!(err.holder(), Some(PID_A));

    assert_eq!(
        engine
            .set(PID_B, "ns_1", "k", json!(2), 1)
            .expect_err("foreign write")
            .code,
        codes::NAMESPACE_LOCK
    );
    assert_eq!(
        engine
            .del(PID_B, "ns_1", "k", 1)
            .expect_err("foreign delete")
            .code,
        codes::NAMESPACE_LOCK
    );
    assert_eq!(
        engine
            .get_multi(PID_B, "ns_1", &["k"])
            .expect_err("foreign bulk read")
            .code,
        codes::NAMESPACE_LOCK
    );
}

fn namespace_lock_owner_passes<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    engine.get(PID_A, "ns_1", "k").expect("owner read");
    engine
        .get_multi(PID_A, "ns_1", &["k"])
        .expect("owner bulk read");
}

fn owner_set_releases_namespace_lock<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    engine
        .set(PID_A, "ns_1", "k", json!(1), 1)
        .expect("owner write");
    engine.get(PID_B, "ns_1", "k").expect("released by the write");
}

fn noop_del_keeps_namespace_lock<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    assert!(!engine
        .del(PID_A, "ns_1", "missing", 1)
        .expect("no-op delete"));
    engine
        .get(PID_B, "ns_1", "missing")
        .expect_err("lock survives a delete that removed nothing");
}

fn lock_namespace_returns_current_offset<E: CacheEngine>(engine: &E) {
    engine.flush_namespace("ns_1").expect("flush");
    engine.flush_namespace("ns_1").expect("flush");
    let offset = engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    assert_eq!(offset, 3);
    // The returned offset is immediately writable by the holder.
    engine
        .set(PID_A, "ns_1", "k", json!(1), offset)
        .expect("write at returned offset");
}

fn relock_by_owner_succeeds<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    engine
        .lock_namespace(PID_A, "ns_1", HOLD)
        .expect("same owner relocks");
    engine
        .lock_namespace(PID_B, "ns_1", HOLD)
        .expect_err("foreign lock still blocked");
}

fn unlock_by_owner_preserves_data<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(7), 1).expect("seed");
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");
    let offset = engine.unlock_namespace(PID_A, "ns_1").expect("unlock");
    assert_eq!(offset, 1);
    assert_eq!(
        engine.get(PID_B, "ns_1", "k").expect("read").value,
        Some(json!(7))
    );
}

fn unlock_by_foreign_pid_flushes<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(7), 1).expect("seed");
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("lock");

    let offset = engine
        .unlock_namespace(PID_B, "ns_1")
        .expect("foreign unlock succeeds");
    assert_eq!(offset, 2);
    let read = engine.get(PID_B, "ns_1", "k").expect("read");
    assert_eq!(read.value, None);
    assert_eq!(read.offset, 2);
}

fn unlock_without_lock_is_noop<E: CacheEngine>(engine: &E) {
    engine.set(PID_A, "ns_1", "k", json!(1), 1).expect("seed");
    let offset = engine.unlock_namespace(PID_B, "ns_1").expect("unlock");
    assert_eq!(offset, 1);
    assert_eq!(
        engine.get(PID_B, "ns_1", "k").expect("read").value,
        Some(json!(1))
    );
}

fn namespace_lock_expires<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", BLINK).expect("lock");
    engine
        .get(PID_B, "ns_1", "k")
        .expect_err("blocked while the lease lives");
    wait_past(BLINK);
    engine.get(PID_B, "ns_1", "k").expect("lease expired");
    engine
        .set(PID_B, "ns_1", "k", json!(1), 1)
        .expect("writable after expiry");
}

// === Monolithic image ===

fn image_write_read_round_trips<E: CacheEngine>(engine: &E) {
    let image = json!({"schema": 2, "rows": [1, 2, 3]});
    engine
        .write_cache(PID_A, "ns_1", image.clone(), 1)
        .expect("write image");
    let read = engine.read_cache(PID_B, "ns_1").expect("read image");
    assert_eq!(read.value, Some(image));
    assert_eq!(read.offset, 1);
}

fn missing_image_reads_none<E: CacheEngine>(engine: &E) {
    let read = engine.read_cache(PID_A, "ns_1").expect("read");
    assert_eq!(read.value, None);
    assert_eq!(read.offset, 1);
}

fn lock_cache_returns_image_and_blocks<E: CacheEngine>(engine: &E) {
    engine
        .write_cache(PID_A, "ns_1", json!("img"), 1)
        .expect("seed image");
    let held = engine.lock_cache(PID_A, "ns_1", HOLD).expect("lock");
    assert_eq!(held.value, Some(json!("img")));
    assert_eq!(held.offset, 1);

    let err = engine.read_cache(PID_B, "ns_1").expect_err("foreign read");
    assert_eq!(err.kind, ErrorKind::LockConflict);
    assert_eq!(err.code, codes::ENTRY_LOCK);
    assert_eq!(err.holder(), Some(PID_A));
    assert_eq!(
        engine
            .write_cache(PID_B, "ns_1", json!("x"), 1)
            .expect_err("foreign write")
            .code,
        codes::ENTRY_LOCK
    );
    engine
        .lock_cache(PID_A, "ns_1", HOLD)
        .expect("owner relock refreshes");
}

fn owner_image_write_releases_image_lock<E: CacheEngine>(engine: &E) {
    engine.lock_cache(PID_A, "ns_1", HOLD).expect("lock");
    engine
        .write_cache(PID_A, "ns_1", json!("fresh"), 1)
        .expect("owner write");
    assert_eq!(
        engine.read_cache(PID_B, "ns_1").expect("released").value,
        Some(json!("fresh"))
    );
}

fn image_lock_ignores_key_tier<E: CacheEngine>(engine: &E) {
    engine.lock_cache(PID_A, "ns_1", HOLD).expect("image lock");
    engine
        .set(PID_B, "ns_1", "k", json!(1), 1)
        .expect("key write unaffected");
    engine.get(PID_B, "ns_1", "k").expect("key read unaffected");
    engine
        .del(PID_B, "ns_1", "k", 1)
        .expect("key delete unaffected");
}

fn namespace_lock_ignores_entry_tier<E: CacheEngine>(engine: &E) {
    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("ns lock");
    engine
        .write_cache(PID_B, "ns_1", json!("img"), 1)
        .expect("image write unaffected");
    engine.read_cache(PID_B, "ns_1").expect("image read unaffected");

    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!(1));
    engine
        .write_cache_page(PID_B, "ns_1", pages, 1)
        .expect("page write unaffected");
    engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect("page read unaffected");
}

// === Pages ===

fn page_write_read_round_trips<E: CacheEngine>(engine: &E) {
    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!({"cells": [0, 1]}));
    pages.insert("p2".to_string(), json!({"cells": [2]}));
    engine
        .write_cache_page(PID_A, "ns_1", pages, 1)
        .expect("write pages");

    let read = engine
        .read_cache_page(PID_B, "ns_1", &["p1", "p2", "p3"])
        .expect("read pages");
    assert_eq!(read.len(), 2);
    assert_eq!(read.get("p1"), Some(&json!({"cells": [0, 1]})));
    assert!(!read.contains("p3"));
    assert_eq!(read.offset, 1);
}

fn page_lock_blocks_only_named_pages<E: CacheEngine>(engine: &E) {
    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!(1));
    engine
        .write_cache_page(PID_A, "ns_1", pages, 1)
        .expect("seed");
    let held = engine
        .lock_cache_page(PID_A, "ns_1", &["p1"], HOLD)
        .expect("lock p1");
    assert_eq!(held.get("p1"), Some(&json!(1)));

    let err = engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect_err("foreign read of locked page");
    assert_eq!(err.kind, ErrorKind::LockConflict);
    assert_eq!(err.code, codes::ENTRY_LOCK);
    assert!(err.context.pages.contains(&"p1".to_string()));

    // A sibling page is untouched by p1's lock.
    let mut other = HashMap::new();
    other.insert("p2".to_string(), json!(2));
    engine
        .write_cache_page(PID_B, "ns_1", other, 1)
        .expect("foreign write of a different page");
    engine
        .read_cache_page(PID_B, "ns_1", &["p2"])
        .expect("foreign read of a different page");
}

fn owner_page_write_releases_page_lock<E: CacheEngine>(engine: &E) {
    engine
        .lock_cache_page(PID_A, "ns_1", &["p1", "p2"], HOLD)
        .expect("lock");
    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!("new"));
    engine
        .write_cache_page(PID_A, "ns_1", pages, 1)
        .expect("owner write");
    engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect("p1 released");
    engine
        .read_cache_page(PID_B, "ns_1", &["p2"])
        .expect_err("p2 still held");
}

fn page_lock_expires<E: CacheEngine>(engine: &E) {
    engine
        .lock_cache_page(PID_A, "ns_1", &["p1"], BLINK)
        .expect("lock");
    engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect_err("blocked while the lease lives");
    wait_past(BLINK);
    engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect("lease expired");
}

fn flush_cache_page_counts_and_keeps_offset<E: CacheEngine>(engine: &E) {
    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!(1));
    pages.insert("p2".to_string(), json!(2));
    engine
        .write_cache_page(PID_A, "ns_1", pages, 1)
        .expect("seed");

    let removed = engine
        .flush_cache_page(PID_A, "ns_1", &["p1", "p2", "p9"], 1)
        .expect("flush pages");
    assert_eq!(removed, 2);
    let read = engine
        .read_cache_page(PID_A, "ns_1", &["p1", "p2"])
        .expect("read");
    assert!(read.is_empty());
    assert_eq!(read.offset, 1);
}

fn flush_cache_page_honors_both_tiers<E: CacheEngine>(engine: &E) {
    let mut pages = HashMap::new();
    pages.insert("p1".to_string(), json!(1));
    engine
        .write_cache_page(PID_A, "ns_1", pages, 1)
        .expect("seed");

    engine.lock_namespace(PID_A, "ns_1", HOLD).expect("ns lock");
    assert_eq!(
        engine
            .flush_cache_page(PID_B, "ns_1", &["p1"], 1)
            .expect_err("namespace tier")
            .code,
        codes::NAMESPACE_LOCK
    );
    engine.unlock_namespace(PID_A, "ns_1").expect("unlock");

    engine
        .lock_cache_page(PID_A, "ns_1", &["p1"], HOLD)
        .expect("page lock");
    assert_eq!(
        engine
            .flush_cache_page(PID_B, "ns_1", &["p1"], 1)
            .expect_err("entry tier")
            .code,
        codes::ENTRY_LOCK
    );

    // The owner clears page and lock in one flush.
    assert_eq!(
        engine
            .flush_cache_page(PID_A, "ns_1", &["p1"], 1)
            .expect("owner flush"),
        1
    );
    engine
        .read_cache_page(PID_B, "ns_1", &["p1"])
        .expect("lock gone with the page");
}

fn lock_cache_page_covers_absent_pages<E: CacheEngine>(engine: &E) {
    let held = engine
        .lock_cache_page(PID_A, "ns_1", &["ghost"], HOLD)
        .expect("lock absent page");
    assert!(held.is_empty());
    engine
        .read_cache_page(PID_B, "ns_1", &["ghost"])
        .expect_err("absent page still locked");
}

// === Arguments and state shape ===

fn empty_names_are_bad_arguments<E: CacheEngine>(engine: &E) {
    assert_eq!(
        engine.get(PID_A, "", "k").expect_err("empty namespace").code,
        codes::BAD_ARGUMENTS
    );
    assert_eq!(
        engine
            .set(PID_A, "ns_1", "", json!(1), 1)
            .expect_err("empty key")
            .code,
        codes::BAD_ARGUMENTS
    );
    assert_eq!(
        engine
            .read_cache_page(PID_A, "ns_1", &[""])
            .expect_err("empty page name")
            .code,
        codes::BAD_ARGUMENTS
    );
    assert_eq!(
        engine.flush_namespace("").expect_err("empty namespace").code,
        codes::BAD_ARGUMENTS
    );
}

fn image_and_entries_are_disjoint<E: CacheEngine>(engine: &E) {
    engine
        .write_cache(PID_A, "ns_1", json!("image"), 1)
        .expect("write image");
    engine
        .set(PID_A, "ns_1", "image", json!("entry"), 1)
        .expect("write entry with a colliding name");
    assert_eq!(
        engine.read_cache(PID_A, "ns_1").expect("image").value,
        Some(json!("image"))
    );
    assert_eq!(
        engine.get(PID_A, "ns_1", "image").expect("entry").value,
        Some(json!("entry"))
    );
}
