//! The consumer-facing cache client.
//!
//! A [`CacheClient`] binds one engine, one caller PID, and one
//! [`CacheDescriptor`] (namespace plus declared strategy). Every call is
//! strategy-checked before the engine is contacted: paged calls against a
//! monolithic descriptor (and vice versa) fail with `InvalidStrategy`
//! immediately.
//!
//! The client keeps a [`Mirror`] of the last data it saw. `load_*` serves
//! from the mirror when it can, `save_*` writes the mirror back through, and
//! `write_*` pushes caller data directly; all writes use the last offset the
//! client observed, probing the engine for one when none is known. Successful
//! mutations notify attached observers with `(operation, namespace, payload)`
//! events; reads notify nobody.
//!
//! Instances are single-threaded by design, one per logical operation
//! context, and are not internally synchronized.

use cachet_core::{
    CacheError, CacheEvent, CacheObserver, CacheOperation, CacheResult, CacheStrategy, CacheValue,
    Offset, ProcessId,
};
use cachet_engine::CacheEngine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

use crate::mirror::Mirror;

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// The cache a client is bound to: which namespace, under which strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub namespace: String,
    pub strategy: CacheStrategy,
}

impl CacheDescriptor {
    pub fn new(namespace: impl Into<String>, strategy: CacheStrategy) -> Self {
        CacheDescriptor {
            namespace: namespace.into(),
            strategy,
        }
    }

    pub fn monolithic(namespace: impl Into<String>) -> Self {
        CacheDescriptor::new(namespace, CacheStrategy::Monolithic)
    }

    pub fn paged(namespace: impl Into<String>) -> Self {
        CacheDescriptor::new(namespace, CacheStrategy::Paged)
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Strategy-aware wrapper over one engine, one PID, one namespace.
pub struct CacheClient<E: CacheEngine> {
    engine: E,
    pid: ProcessId,
    descriptor: CacheDescriptor,
    mirror: RefCell<Mirror>,
    observers: Vec<Rc<dyn CacheObserver>>,
}

impl<E: CacheEngine> CacheClient<E> {
    pub fn new(engine: E, pid: ProcessId, descriptor: CacheDescriptor) -> Self {
        CacheClient {
            engine,
            pid,
            descriptor,
            mirror: RefCell::new(Mirror::new()),
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Rc<dyn CacheObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn attach_observer(&mut self, observer: Rc<dyn CacheObserver>) {
        self.observers.push(observer);
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn descriptor(&self) -> &CacheDescriptor {
        &self.descriptor
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Read-only view of the local mirror, mainly for tests and diagnostics.
    pub fn mirror(&self) -> Ref<'_, Mirror> {
        self.mirror.borrow()
    }

    pub fn ping(&self) -> CacheResult<()> {
        self.engine.ping()
    }

    // === Monolithic Operations ===

    /// Read-through image fetch: the mirrored copy if one exists, otherwise
    /// the engine's, which is mirrored for next time.
    pub fn load_cache(&self) -> CacheResult<Option<CacheValue>> {
        self.require(CacheStrategy::Monolithic, "load_cache")?;
        if let Some(image) = self.mirror.borrow().image().cloned() {
            return Ok(Some(image));
        }
        let read = self.engine.read_cache(self.pid, &self.descriptor.namespace)?;
        let mut mirror = self.mirror.borrow_mut();
        mirror.set_image(read.value.clone());
        mirror.note_offset(read.offset);
        Ok(read.value)
    }

    /// Fetch the image from the engine regardless of the mirror, refreshing
    /// the mirror with whatever comes back.
    pub fn read_cache(&self) -> CacheResult<Option<CacheValue>> {
        self.require(CacheStrategy::Monolithic, "read_cache")?;
        let read = self.engine.read_cache(self.pid, &self.descriptor.namespace)?;
        {
            let mut mirror = self.mirror.borrow_mut();
            mirror.set_image(read.value.clone());
            mirror.note_offset(read.offset);
        }
        Ok(read.value)
    }

    /// Write the mirrored image through to the engine.
    pub fn save_cache(&self) -> CacheResult<()> {
        self.require(CacheStrategy::Monolithic, "save_cache")?;
        let image = self
            .mirror
            .borrow()
            .image()
            .cloned()
            .ok_or_else(|| {
                CacheError::bad_arguments("mirror holds no image to save")
                    .with_namespace(&self.descriptor.namespace)
            })?;
        let offset = self.current_offset()?;
        self.engine
            .write_cache(self.pid, &self.descriptor.namespace, image.clone(), offset)?;
        self.emit(CacheOperation::SaveCache, image);
        Ok(())
    }

    /// Write a caller-supplied image, mirroring it on success.
    pub fn write_cache(&self, image: CacheValue) -> CacheResult<()> {
        self.require(CacheStrategy::Monolithic, "write_cache")?;
        let offset = self.current_offset()?;
        self.engine
            .write_cache(self.pid, &self.descriptor.namespace, image.clone(), offset)?;
        {
            let mut mirror = self.mirror.borrow_mut();
            mirror.set_image(Some(image.clone()));
            mirror.note_offset(offset);
        }
        self.emit(CacheOperation::WriteCache, image);
        Ok(())
    }

    /// Fetch the image and take the image lock in one step.
    pub fn lock_cache(&self, ttl: Duration) -> CacheResult<Option<CacheValue>> {
        self.require(CacheStrategy::Monolithic, "lock_cache")?;
        let read = self
            .engine
            .lock_cache(self.pid, &self.descriptor.namespace, ttl)?;
        {
            let mut mirror = self.mirror.borrow_mut();
            mirror.set_image(read.value.clone());
            mirror.note_offset(read.offset);
        }
        self.emit(
            CacheOperation::LockCache,
            read.value.clone().unwrap_or(CacheValue::Null),
        );
        Ok(read.value)
    }

    /// Flush the namespace; the mirror's data is dropped and the new offset
    /// remembered.
    pub fn flush_cache(&self) -> CacheResult<Offset> {
        self.require(CacheStrategy::Monolithic, "flush_cache")?;
        let offset = self.engine.flush_namespace(&self.descriptor.namespace)?;
        {
            let mut mirror = self.mirror.borrow_mut();
            mirror.clear_data();
            mirror.note_offset(offset);
        }
        self.emit(CacheOperation::FlushCache, json!({ "offset": offset }));
        Ok(offset)
    }

    // === Paged Operations ===

    /// Read-through page fetch: mirrored pages are served locally, only the
    /// missing names go to the engine, and the replies merge into the mirror.
    pub fn load_cache_page(&self, names: &[&str]) -> CacheResult<HashMap<String, CacheValue>> {
        self.require(CacheStrategy::Paged, "load_cache_page")?;
        let missing: Vec<&str> = {
            let mirror = self.mirror.borrow();
            names
                .iter()
                .copied()
                .filter(|name| mirror.page(name).is_none())
                .collect()
        };
        if !missing.is_empty() {
            let read = self
                .engine
                .read_cache_page(self.pid, &self.descriptor.namespace, &missing)?;
            self.mirror.borrow_mut().absorb_page_read(&missing, &read);
        }
        let mirror = self.mirror.borrow();
        Ok(names
            .iter()
            .filter_map(|name| {
                mirror
                    .page(name)
                    .map(|value| ((*name).to_string(), value.clone()))
            })
            .collect())
    }

    /// Fetch pages from the engine regardless of the mirror.
    pub fn read_cache_page(&self, names: &[&str]) -> CacheResult<HashMap<String, CacheValue>> {
        self.require(CacheStrategy::Paged, "read_cache_page")?;
        let read = self
            .engine
            .read_cache_page(self.pid, &self.descriptor.namespace, names)?;
        self.mirror.borrow_mut().absorb_page_read(names, &read);
        Ok(read.entries)
    }

    /// Write the named mirrored pages through to the engine. Every named
    /// page must be mirrored; a partial mirror is a caller error.
    pub fn save_cache_page(&self, names: &[&str]) -> CacheResult<()> {
        self.require(CacheStrategy::Paged, "save_cache_page")?;
        let pages = self
            .mirror
            .borrow()
            .pages_if_complete(names)
            .ok_or_else(|| {
                CacheError::bad_arguments("one or more pages are not mirrored")
                    .with_namespace(&self.descriptor.namespace)
            })?;
        let offset = self.current_offset()?;
        self.engine
            .write_cache_page(self.pid, &self.descriptor.namespace, pages.clone(), offset)?;
        self.emit(CacheOperation::SaveCachePage, pages_payload(&pages));
        Ok(())
    }

    /// Write caller-supplied pages, mirroring them on success.
    pub fn write_cache_page(&self, pages: HashMap<String, CacheValue>) -> CacheResult<()> {
        self.require(CacheStrategy::Paged, "write_cache_page")?;
        let offset = self.current_offset()?;
        self.engine.write_cache_page(
            self.pid,
            &self.descriptor.namespace,
            pages.clone(),
            offset,
        )?;
        {
            let mut mirror = self.mirror.borrow_mut();
            mirror.stash_pages(&pages);
            mirror.note_offset(offset);
        }
        self.emit(CacheOperation::WriteCachePage, pages_payload(&pages));
        Ok(())
    }

    /// Fetch the named pages and take a lock on each in one step.
    pub fn lock_cache_page(
        &self,
        names: &[&str],
        ttl: Duration,
    ) -> CacheResult<HashMap<String, CacheValue>> {
        self.require(CacheStrategy::Paged, "lock_cache_page")?;
        let read = self
            .engine
            .lock_cache_page(self.pid, &self.descriptor.namespace, names, ttl)?;
        self.mirror.borrow_mut().absorb_page_read(names, &read);
        self.emit(CacheOperation::LockCachePage, pages_payload(&read.entries));
        Ok(read.entries)
    }

    /// Delete the named pages; returns how many existed.
    pub fn flush_cache_page(&self, names: &[&str]) -> CacheResult<usize> {
        self.require(CacheStrategy::Paged, "flush_cache_page")?;
        let offset = self.current_offset()?;
        let removed =
            self.engine
                .flush_cache_page(self.pid, &self.descriptor.namespace, names, offset)?;
        self.mirror.borrow_mut().drop_pages(names);
        self.emit(CacheOperation::FlushCachePage, json!({ "removed": removed }));
        Ok(removed)
    }

    // === Namespace Operations ===

    /// Take the namespace lock; valid under either strategy.
    pub fn lock_namespace(&self, ttl: Duration) -> CacheResult<Offset> {
        let offset = self
            .engine
            .lock_namespace(self.pid, &self.descriptor.namespace, ttl)?;
        self.mirror.borrow_mut().note_offset(offset);
        self.emit(CacheOperation::LockNamespace, json!({ "offset": offset }));
        Ok(offset)
    }

    /// Release the namespace lock. If the engine reports an offset other
    /// than the mirrored one, the namespace was flushed behind our back and
    /// the mirrored data is dropped as stale.
    pub fn unlock_namespace(&self) -> CacheResult<Offset> {
        let offset = self
            .engine
            .unlock_namespace(self.pid, &self.descriptor.namespace)?;
        {
            let mut mirror = self.mirror.borrow_mut();
            if mirror.offset() != Some(offset) {
                mirror.clear_data();
            }
            mirror.note_offset(offset);
        }
        self.emit(CacheOperation::UnlockNamespace, json!({ "offset": offset }));
        Ok(offset)
    }

    // === Internal ===

    fn require(&self, required: CacheStrategy, operation: &str) -> CacheResult<()> {
        if self.descriptor.strategy != required {
            return Err(
                CacheError::invalid_strategy(self.descriptor.strategy, operation)
                    .with_namespace(&self.descriptor.namespace),
            );
        }
        Ok(())
    }

    /// The offset to write at: the mirrored one, or a probe of the engine
    /// when this client has not seen a reply yet.
    fn current_offset(&self) -> CacheResult<Offset> {
        if let Some(offset) = self.mirror.borrow().offset() {
            return Ok(offset);
        }
        let offset = match self.descriptor.strategy {
            CacheStrategy::Monolithic => {
                self.engine
                    .read_cache(self.pid, &self.descriptor.namespace)?
                    .offset
            }
            CacheStrategy::Paged => {
                self.engine
                    .read_cache_page(self.pid, &self.descriptor.namespace, &[])?
                    .offset
            }
        };
        debug!(
            namespace = %self.descriptor.namespace,
            offset,
            "probed namespace offset"
        );
        self.mirror.borrow_mut().note_offset(offset);
        Ok(offset)
    }

    fn emit(&self, operation: CacheOperation, payload: CacheValue) {
        if self.observers.is_empty() {
            return;
        }
        let event = CacheEvent::new(operation, &self.descriptor.namespace, payload);
        for observer in &self.observers {
            observer.notify(&event);
        }
    }
}

fn pages_payload(pages: &HashMap<String, CacheValue>) -> CacheValue {
    CacheValue::Object(
        pages
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    )
}

// =============================================================================
// TESTS
// =============================================================================
