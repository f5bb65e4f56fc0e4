//! Redis-backed engine.
//!
//! One namespace maps onto a small family of Redis keys under a configurable
//! prefix:
//!
//! ```text
//! {prefix}:{namespace}:!meta     offset + lock leases, one JSON document
//! {prefix}:{namespace}:!image    the monolithic image
//! {prefix}:{namespace}:e:{key}   one entry (pages included)
//! ```
//!
//! Every mutation runs as a `WATCH`-guarded transaction on the meta key and
//! writes the meta document back, so concurrent mutators of one namespace
//! serialize against each other and retry on interference. Reads go without
//! a transaction; the contract does not promise strict linearizability and
//! the offset in every reply lets callers detect staleness on their next
//! write.
//!
//! Names are spliced into keys verbatim. Namespaces sharing `:`-separated
//! prefixes can alias each other's key ranges; deployments pick disjoint
//! names.

use cachet_core::{
    CacheError, CacheResult, CacheValue, LockLease, Offset, ProcessId, Timestamp, INITIAL_OFFSET,
};
use chrono::Utc;
use redis::{Commands, Connection, RedisError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::read::{BulkRead, CacheRead};
use crate::table::{check_name, check_names};
use crate::CacheEngine;

/// Early-returns a domain error out of a `redis::transaction` closure. The
/// queued pipeline is never executed; the surrounding helper unwatches.
macro_rules! try_protocol {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return Ok(Some(Err(err))),
        }
    };
}

// ============================================================================
// CONFIG
// ============================================================================

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "cachet";

/// Connection settings for [`RedisEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Server URL, `redis://` or `rediss://`.
    pub url: String,
    /// Leading segment of every key this engine touches. Distinct prefixes
    /// give co-tenant engines disjoint keyspaces on one server.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RedisConfig {
            url: url.into(),
            ..RedisConfig::default()
        }
    }

    /// Settings from the environment: `REDIS_URL` for the server,
    /// `CACHET_KEY_PREFIX` for the prefix, defaults for whatever is unset.
    pub fn from_env() -> Self {
        let mut config = RedisConfig::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.url = url;
        }
        if let Ok(prefix) = std::env::var("CACHET_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        config
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.url.is_empty() {
            return Err(CacheError::bad_arguments("redis url must not be empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(CacheError::bad_arguments("key prefix must not be empty"));
        }
        if self.key_prefix.contains(':') {
            return Err(CacheError::bad_arguments(
                "key prefix must not contain ':'",
            ));
        }
        Ok(())
    }

    fn meta_key(&self, namespace: &str) -> String {
        format!("{}:{}:!meta", self.key_prefix, namespace)
    }

    fn image_key(&self, namespace: &str) -> String {
        format!("{}:{}:!image", self.key_prefix, namespace)
    }

    fn entry_key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{}:e:{}", self.key_prefix, namespace, key)
    }

    fn entry_pattern(&self, namespace: &str) -> String {
        format!("{}:{}:e:*", self.key_prefix, namespace)
    }

    fn all_keys_pattern(&self) -> String {
        format!("{}:*", self.key_prefix)
    }
}

// ============================================================================
// NAMESPACE META
// ============================================================================

/// The versioning and lock state of one namespace, stored as a single JSON
/// document so one `WATCH` covers all of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NamespaceMeta {
    offset: Offset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace_lock: Option<LockLease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_lock: Option<LockLease>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    page_locks: HashMap<String, LockLease>,
}

impl Default for NamespaceMeta {
    fn default() -> Self {
        NamespaceMeta {
            offset: INITIAL_OFFSET,
            namespace_lock: None,
            image_lock: None,
            page_locks: HashMap::new(),
        }
    }
}

impl NamespaceMeta {
    fn purge_expired(&mut self, now: Timestamp) {
        if self
            .namespace_lock
            .as_ref()
            .map_or(false, |l| l.is_expired(now))
        {
            self.namespace_lock = None;
        }
        if self.image_lock.as_ref().map_or(false, |l| l.is_expired(now)) {
            self.image_lock = None;
        }
        self.page_locks.retain(|_, lease| !lease.is_expired(now));
    }

    fn check_offset(&self, namespace: &str, expected: Offset) -> CacheResult<()> {
        if expected != self.offset {
            return Err(CacheError::offset_mismatch(namespace, expected, self.offset));
        }
        Ok(())
    }

    fn check_namespace_gate(
        &self,
        pid: ProcessId,
        namespace: &str,
        now: Timestamp,
    ) -> CacheResult<()> {
        if let Some(lease) = self.namespace_lock.as_ref() {
            if lease.blocks(pid, now) {
                return Err(CacheError::namespace_locked(namespace, lease.holder));
            }
        }
        Ok(())
    }

    fn check_image_gate(&self, pid: ProcessId, namespace: &str, now: Timestamp) -> CacheResult<()> {
        if let Some(lease) = self.image_lock.as_ref() {
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
        let locked: Vec<String> = page_names
            .iter()
            .filter(|name| {
                self.page_locks
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

    fn release_namespace_lock_if_owned(&mut self, pid: ProcessId) {
        if self
            .namespace_lock
            .as_ref()
            .map_or(false, |l| l.holder == pid)
        {
            self.namespace_lock = None;
        }
    }

    fn release_image_lock_if_owned(&mut self, pid: ProcessId) {
        if self.image_lock.as_ref().map_or(false, |l| l.holder == pid) {
            self.image_lock = None;
        }
    }

    fn release_page_lock_if_owned(&mut self, name: &str, pid: ProcessId) {
        if self
            .page_locks
            .get(name)
            .map_or(false, |l| l.holder == pid)
        {
            self.page_locks.remove(name);
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Engine persisting namespaces to a Redis server.
///
/// Holds one connection behind a mutex; callers needing more parallelism run
/// one engine per worker against the same prefix.
pub struct RedisEngine {
    config: RedisConfig,
    conn: Mutex<Connection>,
}

impl fmt::Debug for RedisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisEngine {
    /// Validate `config` and open the connection.
    pub fn connect(config: RedisConfig) -> CacheResult<Self> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CacheError::backend_unavailable("invalid redis url").with_source(e))?;
        let conn = client
            .get_connection()
            .map_err(|e| CacheError::backend_unavailable("redis connection failed").with_source(e))?;
        Ok(RedisEngine {
            config,
            conn: Mutex::new(conn),
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> CacheResult<T>) -> CacheResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

fn backend(err: RedisError) -> CacheError {
    warn!(error = %err, "redis command failed");
    CacheError::backend_unavailable("redis command failed").with_source(err)
}

fn encode<T: Serialize>(value: &T) -> CacheResult<String> {
    serde_json::to_string(value)
        .map_err(|e| CacheError::backend_unavailable("payload serialization failed").with_source(e))
}

fn decode<T: DeserializeOwned>(raw: &str) -> CacheResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| CacheError::backend_unavailable("stored payload is not valid JSON").with_source(e))
}

/// Fetch and parse the meta document; an absent key reads as a pristine
/// namespace. Redis failures travel on the outer result so transaction
/// closures can `?` them.
fn load_meta(
    con: &mut Connection,
    meta_key: &str,
) -> redis::RedisResult<CacheResult<NamespaceMeta>> {
    let raw: Option<String> = con.get(meta_key)?;
    Ok(match raw {
        None => Ok(NamespaceMeta::default()),
        Some(raw) => decode(&raw),
    })
}

fn fetch_meta(con: &mut Connection, meta_key: &str) -> CacheResult<NamespaceMeta> {
    load_meta(con, meta_key).map_err(backend)?
}

impl CacheEngine for RedisEngine {
    fn ping(&self) -> CacheResult<()> {
        self.with_conn(|con| {
            let _: String = redis::cmd("PING").query(con).map_err(backend)?;
            Ok(())
        })
    }

    fn get(&self, pid: ProcessId, namespace: &str, key: &str) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_key = self.config.entry_key(namespace, key);
        self.with_conn(|con| {
            let meta = fetch_meta(con, &meta_key)?;
            meta.check_namespace_gate(pid, namespace, now)?;
            let raw: Option<String> = con.get(&entry_key).map_err(backend)?;
            let value = raw.as_deref().map(decode::<CacheValue>).transpose()?;
            Ok(CacheRead {
                value,
                offset: meta.offset,
            })
        })
    }

    fn get_multi(&self, pid: ProcessId, namespace: &str, keys: &[&str]) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(keys, "key")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_keys: Vec<String> = keys
            .iter()
            .map(|key| self.config.entry_key(namespace, key))
            .collect();
        self.with_conn(|con| {
            let meta = fetch_meta(con, &meta_key)?;
            meta.check_namespace_gate(pid, namespace, now)?;
            let mut entries = HashMap::new();
            if !entry_keys.is_empty() {
                let raws: Vec<Option<String>> = con.mget(&entry_keys).map_err(backend)?;
                for (key, raw) in keys.iter().zip(raws) {
                    if let Some(raw) = raw {
                        entries.insert((*key).to_string(), decode(&raw)?);
                    }
                }
            }
            Ok(BulkRead {
                entries,
                offset: meta.offset,
            })
        })
    }

    fn set(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        value: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_key = self.config.entry_key(namespace, key);
        let payload = encode(&value)?;
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                meta.release_namespace_lock_if_owned(pid);
                let meta_payload = try_protocol!(encode(&meta));
                let exec: Option<()> = pipe
                    .set(&entry_key, &payload)
                    .ignore()
                    .set(&meta_key, &meta_payload)
                    .ignore()
                    .query(con)?;
                Ok(exec.map(Ok))
            })
            .map_err(backend)?
        })
    }

    fn set_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        entries: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        for key in entries.keys() {
            check_name(key, "key")?;
        }
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let payloads: Vec<(String, String)> = entries
            .iter()
            .map(|(key, value)| Ok((self.config.entry_key(namespace, key), encode(value)?)))
            .collect::<CacheResult<_>>()?;
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                if payloads.is_empty() {
                    return Ok(Some(Ok(())));
                }
                meta.release_namespace_lock_if_owned(pid);
                let meta_payload = try_protocol!(encode(&meta));
                for (entry_key, payload) in &payloads {
                    pipe.set(entry_key, payload).ignore();
                }
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(Ok))
            })
            .map_err(backend)?
        })
    }

    fn del(
        &self,
        pid: ProcessId,
        namespace: &str,
        key: &str,
        check_offset: Offset,
    ) -> CacheResult<bool> {
        check_name(namespace, "namespace")?;
        check_name(key, "key")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_key = self.config.entry_key(namespace, key);
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                let existed: bool = con.exists(&entry_key)?;
                if existed {
                    meta.release_namespace_lock_if_owned(pid);
                }
                let meta_payload = try_protocol!(encode(&meta));
                let exec: Option<()> = pipe
                    .del(&entry_key)
                    .ignore()
                    .set(&meta_key, &meta_payload)
                    .ignore()
                    .query(con)?;
                Ok(exec.map(|_| Ok(existed)))
            })
            .map_err(backend)?
        })
    }

    fn del_multi(
        &self,
        pid: ProcessId,
        namespace: &str,
        keys: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        check_name(namespace, "namespace")?;
        check_names(keys, "key")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        // Deduplicate so a key named twice counts once.
        let entry_keys: Vec<String> = keys
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|key| self.config.entry_key(namespace, key))
            .collect();
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                let removed: usize = if entry_keys.is_empty() {
                    0
                } else {
                    con.exists(&entry_keys)?
                };
                if removed > 0 {
                    meta.release_namespace_lock_if_owned(pid);
                }
                let meta_payload = try_protocol!(encode(&meta));
                if !entry_keys.is_empty() {
                    pipe.del(&entry_keys).ignore();
                }
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(removed)))
            })
            .map_err(backend)?
        })
    }

    fn flush_all(&self) -> CacheResult<()> {
        let pattern = self.config.all_keys_pattern();
        self.with_conn(|con| {
            let keys: Vec<String> = {
                let iter = con.scan_match::<_, String>(&pattern).map_err(backend)?;
                iter.collect()
            };
            if !keys.is_empty() {
                con.del::<_, ()>(&keys).map_err(backend)?;
            }
            debug!(keys = keys.len(), "flushed all namespaces");
            Ok(())
        })
    }

    fn flush_namespace(&self, namespace: &str) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        let meta_key = self.config.meta_key(namespace);
        let image_key = self.config.image_key(namespace);
        let pattern = self.config.entry_pattern(namespace);
        let offset = self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let meta = try_protocol!(load_meta(con, &meta_key)?);
                let next = NamespaceMeta {
                    offset: meta.offset + 1,
                    ..NamespaceMeta::default()
                };
                let entry_keys: Vec<String> = {
                    let iter = con.scan_match::<_, String>(&pattern)?;
                    iter.collect()
                };
                let meta_payload = try_protocol!(encode(&next));
                if !entry_keys.is_empty() {
                    pipe.del(&entry_keys).ignore();
                }
                pipe.del(&image_key)
                    .ignore()
                    .set(&meta_key, &meta_payload)
                    .ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(next.offset)))
            })
            .map_err(backend)?
        })?;
        debug!(namespace, offset, "flushed namespace");
        Ok(offset)
    }

    fn write_cache(
        &self,
        pid: ProcessId,
        namespace: &str,
        image: CacheValue,
        check_offset: Offset,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let image_key = self.config.image_key(namespace);
        let payload = encode(&image)?;
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_image_gate(pid, namespace, now));
                meta.release_image_lock_if_owned(pid);
                let meta_payload = try_protocol!(encode(&meta));
                let exec: Option<()> = pipe
                    .set(&image_key, &payload)
                    .ignore()
                    .set(&meta_key, &meta_payload)
                    .ignore()
                    .query(con)?;
                Ok(exec.map(Ok))
            })
            .map_err(backend)?
        })
    }

    fn read_cache(&self, pid: ProcessId, namespace: &str) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let image_key = self.config.image_key(namespace);
        self.with_conn(|con| {
            let meta = fetch_meta(con, &meta_key)?;
            meta.check_image_gate(pid, namespace, now)?;
            let raw: Option<String> = con.get(&image_key).map_err(backend)?;
            let value = raw.as_deref().map(decode::<CacheValue>).transpose()?;
            Ok(CacheRead {
                value,
                offset: meta.offset,
            })
        })
    }

    fn lock_cache(&self, pid: ProcessId, namespace: &str, ttl: Duration) -> CacheResult<CacheRead> {
        check_name(namespace, "namespace")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let image_key = self.config.image_key(namespace);
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_image_gate(pid, namespace, now));
                if let Some(lease) = meta.image_lock.as_mut() {
                    lease.refresh(ttl, now);
                } else {
                    meta.image_lock = Some(LockLease::new(pid, ttl, now));
                }
                let raw: Option<String> = con.get(&image_key)?;
                let value = try_protocol!(raw.as_deref().map(decode::<CacheValue>).transpose());
                let offset = meta.offset;
                let meta_payload = try_protocol!(encode(&meta));
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(CacheRead { value, offset })))
            })
            .map_err(backend)?
        })
    }

    fn write_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        pages: HashMap<String, CacheValue>,
        check_offset: Offset,
    ) -> CacheResult<()> {
        check_name(namespace, "namespace")?;
        for name in pages.keys() {
            check_name(name, "page name")?;
        }
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let payloads: Vec<(String, String, String)> = pages
            .iter()
            .map(|(name, value)| {
                Ok((
                    name.clone(),
                    self.config.entry_key(namespace, name),
                    encode(value)?,
                ))
            })
            .collect::<CacheResult<_>>()?;
        let names: Vec<&str> = payloads.iter().map(|(name, _, _)| name.as_str()).collect();
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_page_gate(pid, namespace, &names, now));
                if payloads.is_empty() {
                    return Ok(Some(Ok(())));
                }
                for (name, entry_key, payload) in &payloads {
                    meta.release_page_lock_if_owned(name, pid);
                    pipe.set(entry_key, payload).ignore();
                }
                let meta_payload = try_protocol!(encode(&meta));
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(Ok))
            })
            .map_err(backend)?
        })
    }

    fn read_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
    ) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_keys: Vec<String> = page_names
            .iter()
            .map(|name| self.config.entry_key(namespace, name))
            .collect();
        self.with_conn(|con| {
            let meta = fetch_meta(con, &meta_key)?;
            meta.check_page_gate(pid, namespace, page_names, now)?;
            let mut entries = HashMap::new();
            if !entry_keys.is_empty() {
                let raws: Vec<Option<String>> = con.mget(&entry_keys).map_err(backend)?;
                for (name, raw) in page_names.iter().zip(raws) {
                    if let Some(raw) = raw {
                        entries.insert((*name).to_string(), decode(&raw)?);
                    }
                }
            }
            Ok(BulkRead {
                entries,
                offset: meta.offset,
            })
        })
    }

    fn flush_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        check_offset: Offset,
    ) -> CacheResult<usize> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let unique: Vec<&str> = page_names
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let entry_keys: Vec<String> = unique
            .iter()
            .map(|name| self.config.entry_key(namespace, name))
            .collect();
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_offset(namespace, check_offset));
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                try_protocol!(meta.check_page_gate(pid, namespace, &unique, now));
                let removed: usize = if entry_keys.is_empty() {
                    0
                } else {
                    con.exists(&entry_keys)?
                };
                for name in &unique {
                    meta.release_page_lock_if_owned(name, pid);
                }
                if removed > 0 {
                    meta.release_namespace_lock_if_owned(pid);
                }
                let meta_payload = try_protocol!(encode(&meta));
                if !entry_keys.is_empty() {
                    pipe.del(&entry_keys).ignore();
                }
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(removed)))
            })
            .map_err(backend)?
        })
    }

    fn lock_cache_page(
        &self,
        pid: ProcessId,
        namespace: &str,
        page_names: &[&str],
        ttl: Duration,
    ) -> CacheResult<BulkRead> {
        check_name(namespace, "namespace")?;
        check_names(page_names, "page name")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let entry_keys: Vec<String> = page_names
            .iter()
            .map(|name| self.config.entry_key(namespace, name))
            .collect();
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_page_gate(pid, namespace, page_names, now));
                for name in page_names {
                    if let Some(lease) = meta.page_locks.get_mut(*name) {
                        lease.refresh(ttl, now);
                    } else {
                        meta.page_locks
                            .insert((*name).to_string(), LockLease::new(pid, ttl, now));
                    }
                }
                let mut entries = HashMap::new();
                if !entry_keys.is_empty() {
                    let raws: Vec<Option<String>> = con.mget(&entry_keys)?;
                    for (name, raw) in page_names.iter().zip(raws) {
                        if let Some(raw) = raw {
                            entries.insert((*name).to_string(), try_protocol!(decode(&raw)));
                        }
                    }
                }
                let offset = meta.offset;
                let meta_payload = try_protocol!(encode(&meta));
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(BulkRead { entries, offset })))
            })
            .map_err(backend)?
        })
    }

    fn lock_namespace(
        &self,
        pid: ProcessId,
        namespace: &str,
        ttl: Duration,
    ) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                try_protocol!(meta.check_namespace_gate(pid, namespace, now));
                if let Some(lease) = meta.namespace_lock.as_mut() {
                    lease.refresh(ttl, now);
                } else {
                    meta.namespace_lock = Some(LockLease::new(pid, ttl, now));
                }
                let offset = meta.offset;
                let meta_payload = try_protocol!(encode(&meta));
                pipe.set(&meta_key, &meta_payload).ignore();
                let exec: Option<()> = pipe.query(con)?;
                Ok(exec.map(|_| Ok(offset)))
            })
            .map_err(backend)?
        })
    }

    fn unlock_namespace(&self, pid: ProcessId, namespace: &str) -> CacheResult<Offset> {
        check_name(namespace, "namespace")?;
        let now = Utc::now();
        let meta_key = self.config.meta_key(namespace);
        let image_key = self.config.image_key(namespace);
        let pattern = self.config.entry_pattern(namespace);
        let (offset, flushed_holder) = self.with_conn(|con| {
            redis::transaction(con, &[meta_key.as_str()], |con, pipe| {
                let mut meta = try_protocol!(load_meta(con, &meta_key)?);
                meta.purge_expired(now);
                match meta.namespace_lock.as_ref().map(|lease| lease.holder) {
                    Some(holder) if holder != pid => {
                        // Foreign unlock: the lease may cover an in-flight
                        // write, so erase the namespace before releasing.
                        let next = NamespaceMeta {
                            offset: meta.offset + 1,
                            ..NamespaceMeta::default()
                        };
                        let entry_keys: Vec<String> = {
                            let iter = con.scan_match::<_, String>(&pattern)?;
                            iter.collect()
                        };
                        let meta_payload = try_protocol!(encode(&next));
                        if !entry_keys.is_empty() {
                            pipe.del(&entry_keys).ignore();
                        }
                        pipe.del(&image_key)
                            .ignore()
                            .set(&meta_key, &meta_payload)
                            .ignore();
                        let exec: Option<()> = pipe.query(con)?;
                        Ok(exec.map(|_| Ok((next.offset, Some(holder)))))
                    }
                    holder => {
                        if holder.is_some() {
                            meta.namespace_lock = None;
                        }
                        let offset = meta.offset;
                        let meta_payload = try_protocol!(encode(&meta));
                        pipe.set(&meta_key, &meta_payload).ignore();
                        let exec: Option<()> = pipe.query(con)?;
                        Ok(exec.map(|_| Ok((offset, None))))
                    }
                }
            })
            .map_err(backend)?
        })?;
        if let Some(holder) = flushed_holder {
            warn!(
                namespace,
                holder,
                caller = pid,
                "unlock by foreign PID, flushing namespace"
            );
        }
        Ok(offset)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_key_layout_is_prefix_scoped() {
        let config = RedisConfig {
            url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: "app".to_string(),
        };
        assert_eq!(config.meta_key("ns_1"), "app:ns_1:!meta");
        assert_eq!(config.image_key("ns_1"), "app:ns_1:!image");
        assert_eq!(config.entry_key("ns_1", "var_4"), "app:ns_1:e:var_4");
        assert_eq!(config.entry_pattern("ns_1"), "app:ns_1:e:*");
        assert_eq!(config.all_keys_pattern(), "app:*");
    }

    #[test]
    fn test_config_validation() {
        assert!(RedisConfig::default().validate().is_ok());

        let empty_url = RedisConfig {
            url: String::new(),
            ..RedisConfig::default()
        };
        assert_eq!(
            empty_url.validate().unwrap_err().kind,
            ErrorKind::BadArguments
        );

        let colon_prefix = RedisConfig {
            key_prefix: "a:b".to_string(),
            ..RedisConfig::default()
        };
        assert_eq!(
            colon_prefix.validate().unwrap_err().kind,
            ErrorKind::BadArguments
        );
    }

    #[test]
    fn test_pristine_meta_serializes_to_offset_only() {
        let meta = NamespaceMeta::default();
        assert_eq!(serde_json::to_value(&meta).unwrap(), json!({"offset": 1}));
    }

    #[test]
    fn test_meta_decodes_with_missing_lock_fields() {
        let meta: NamespaceMeta = serde_json::from_str(r#"{"offset":7}"#).unwrap();
        assert_eq!(meta.offset, 7);
        assert!(meta.namespace_lock.is_none());
        assert!(meta.image_lock.is_none());
        assert!(meta.page_locks.is_empty());
    }

    #[test]
    fn test_meta_round_trips_lock_state() {
        let now = Utc::now();
        let mut meta = NamespaceMeta {
            offset: 3,
            ..NamespaceMeta::default()
        };
        meta.namespace_lock = Some(LockLease::new(1337, Duration::from_secs(5), now));
        meta.page_locks
            .insert("p1".to_string(), LockLease::new(6900, Duration::from_secs(5), now));

        let raw = serde_json::to_string(&meta).unwrap();
        let parsed: NamespaceMeta = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, meta);
    }
}

#[cfg(test)]
mod integration_tests {
    //! Exercised against a live server: `cargo test -- --ignored` with
    //! `REDIS_URL` pointing at a disposable instance.

    use super::*;
    use crate::conformance;
    use cachet_core::ErrorKind;
    use serde_json::json;

    fn test_engine() -> RedisEngine {
        let mut config = RedisConfig::from_env();
        config.key_prefix = format!("cachet_test_{}", uuid::Uuid::now_v7().simple());
        RedisEngine::connect(config).expect("redis reachable")
    }

    #[test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    fn test_redis_engine_passes_conformance() {
        conformance::run_all(test_engine);
    }

    #[test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    fn test_state_survives_reconnection() {
        let engine = test_engine();
        let config = engine.config().clone();
        engine.set(1, "durable", "k", json!({"n": 1}), 1).unwrap();
        engine.flush_namespace("durable").unwrap();
        engine.set(1, "durable", "k", json!({"n": 2}), 2).unwrap();
        drop(engine);

        let revived = RedisEngine::connect(config.clone()).unwrap();
        let read = revived.get(2, "durable", "k").unwrap();
        assert_eq!(read.value, Some(json!({"n": 2})));
        assert_eq!(read.offset, 2);
        revived.flush_all().unwrap();
    }

    #[test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    fn test_lock_state_is_shared_across_engines() {
        let engine = test_engine();
        let peer = RedisEngine::connect(engine.config().clone()).unwrap();

        engine
            .lock_namespace(1337, "shared", Duration::from_secs(30))
            .unwrap();
        let err = peer.get(6900, "shared", "k").unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockConflict);
        assert_eq!(err.holder(), Some(1337));

        engine.unlock_namespace(1337, "shared").unwrap();
        peer.get(6900, "shared", "k").unwrap();
        engine.flush_all().unwrap();
    }

    #[test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    fn test_stale_offset_rejected_after_remote_flush() {
        let engine = test_engine();
        let peer = RedisEngine::connect(engine.config().clone()).unwrap();

        engine.set(1, "ns", "k", json!(1), 1).unwrap();
        peer.flush_namespace("ns").unwrap();
        let err = engine.set(1, "ns", "k", json!(2), 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OffsetMismatch);
        assert_eq!(err.context.current_offset, Some(2));
        engine.flush_all().unwrap();
    }
}
