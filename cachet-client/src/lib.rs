//! Consumer-side API for cachet.
//!
//! A [`CacheClient`] wraps any [`cachet_engine::CacheEngine`] with the
//! strategy discipline and local mirroring consumers work against:
//!
//! - A [`CacheDescriptor`] declares the namespace and whether its data is one
//!   monolithic image or named pages; calls of the other family are rejected
//!   before the engine is contacted.
//! - A [`Mirror`] holds the last data and offset the client observed, backing
//!   the `load_*` (read-through) and `save_*` (write-back) operations.
//! - Registered [`cachet_core::CacheObserver`]s are notified after every
//!   successful mutating operation.
//!
//! Clients are deliberately not `Sync`: one client per logical operation
//! context, sharing an engine handle underneath.

pub mod client;
pub mod mirror;

pub use client::{CacheClient, CacheDescriptor};
pub use mirror::Mirror;
