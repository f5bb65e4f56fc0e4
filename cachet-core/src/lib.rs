//! Cachet Core - Protocol Data Types
//!
//! Pure data types shared by every cachet crate: identity aliases, the
//! tagged error type, lock leases, cache strategies, and the notification
//! event shape. No engine or policy logic lives here.

pub mod error;
pub mod event;
pub mod lock;
pub mod strategy;

pub use error::{codes, CacheError, CacheResult, ErrorContext, ErrorKind};
pub use event::{CacheEvent, CacheObserver, CacheOperation};
pub use lock::LockLease;
pub use strategy::CacheStrategy;

use chrono::{DateTime, Utc};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Caller-supplied identity of a logical execution context.
///
/// Purely a lock-ownership token. It is never inferred from the operating
/// system, so ownership stays fully deterministic under test.
pub type ProcessId = u64;

/// Per-namespace version counter, monotonically increasing.
///
/// Flush operations increment it; plain writes leave it alone. A namespace
/// nobody has touched since the last full flush sits at [`INITIAL_OFFSET`].
pub type Offset = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// A cached value: null, boolean, integer, float, string, or arbitrarily
/// nested maps/sequences. Values round-trip structurally through every
/// driver.
pub type CacheValue = serde_json::Value;

/// Effective offset of a namespace that has never been written or flushed.
/// Offsets are never 0 or negative.
pub const INITIAL_OFFSET: Offset = 1;
