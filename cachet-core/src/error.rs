//! Error types for cachet operations

use crate::strategy::CacheStrategy;
use crate::{Offset, ProcessId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// NUMERIC FAMILY CODES
// ============================================================================

/// Numeric error codes preserved from the historical operation families.
///
/// The [`ErrorKind`](crate::ErrorKind) is canonical; the code travels with
/// the error as plain data so callers keyed to the old numbering keep
/// working. Both lock tiers share one kind but report different codes.
pub mod codes {
    /// Stale `check_offset` on a mutating call.
    pub const OFFSET_MISMATCH: u16 = 1;
    /// Strategy mismatch between a client call and the declared entity.
    pub const INVALID_STRATEGY: u16 = 2;
    /// Namespace-tier lock conflict (key-level operations).
    pub const NAMESPACE_LOCK: u16 = 3;
    /// Image/page-tier lock conflict (monolithic and paged operations).
    pub const ENTRY_LOCK: u16 = 4;
    /// Backend probe or connection failure.
    pub const BACKEND_UNAVAILABLE: u16 = 5;
    /// Malformed call shape.
    pub const BAD_ARGUMENTS: u16 = 6;
}

// ============================================================================
// ERROR KIND
// ============================================================================

/// Closed set of failure categories crossing the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The caller's optimistic-concurrency token is stale; re-read and
    /// retry. Never auto-retried internally.
    OffsetMismatch,
    /// Namespace, image, or page exclusively held by a different PID.
    LockConflict,
    /// Paged call against a monolithic entity or vice versa; a programming
    /// error, never retried.
    InvalidStrategy,
    /// The backing store cannot be reached; reported by a driver's activity
    /// probe at setup/driver-selection time.
    BackendUnavailable,
    /// Malformed call shape (empty namespace, missing payload, ...).
    BadArguments,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::OffsetMismatch => "OffsetMismatch",
            ErrorKind::LockConflict => "LockConflict",
            ErrorKind::InvalidStrategy => "InvalidStrategy",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::BadArguments => "BadArguments",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERROR CONTEXT
// ============================================================================

/// Structured context attached to a failure.
///
/// Only the fields relevant to the failing operation are populated: a
/// namespace-lock conflict carries `namespace` and `holder`, a page-lock
/// conflict additionally lists the conflicting `pages`, an offset mismatch
/// carries both offsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub namespace: Option<String>,
    pub key: Option<String>,
    /// Conflicting page names for page-tier lock failures.
    pub pages: Vec<String>,
    /// PID currently holding the conflicting lock.
    pub holder: Option<ProcessId>,
    pub expected_offset: Option<Offset>,
    pub current_offset: Option<Offset>,
}

// ============================================================================
// CACHE ERROR
// ============================================================================

/// The single error type for every cachet operation.
///
/// Carries a closed [`ErrorKind`], the numeric family code, a human-readable
/// message, structured [`ErrorContext`], and an optional wrapped cause, so a
/// failure crossing client → engine → backend-client keeps its full causal
/// chain. A valid cache miss is never an error; it is reported as an absent
/// value on the read result.
#[derive(Debug, Error)]
#[error("{kind} (code {code}): {message}")]
pub struct CacheError {
    pub kind: ErrorKind,
    pub code: u16,
    pub message: String,
    pub context: ErrorContext,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CacheError {
    /// Stale `check_offset` against the namespace's current offset.
    pub fn offset_mismatch(namespace: &str, expected: Offset, current: Offset) -> Self {
        CacheError {
            kind: ErrorKind::OffsetMismatch,
            code: codes::OFFSET_MISMATCH,
            message: format!(
                "offset check failed for {namespace}: expected {expected}, current {current}"
            ),
            context: ErrorContext {
                namespace: Some(namespace.to_string()),
                expected_offset: Some(expected),
                current_offset: Some(current),
                ..ErrorContext::default()
            },
            source: None,
        }
    }

    /// Key-level operation against a namespace locked by a different PID.
    pub fn namespace_locked(namespace: &str, holder: ProcessId) -> Self {
        CacheError {
            kind: ErrorKind::LockConflict,
            code: codes::NAMESPACE_LOCK,
            message: format!("namespace {namespace} is locked by PID {holder}"),
            context: ErrorContext {
                namespace: Some(namespace.to_string()),
                holder: Some(holder),
                ..ErrorContext::default()
            },
            source: None,
        }
    }

    /// Monolithic operation against an image locked by a different PID.
    pub fn image_locked(namespace: &str, holder: ProcessId) -> Self {
        CacheError {
            kind: ErrorKind::LockConflict,
            code: codes::ENTRY_LOCK,
            message: format!("cache image of {namespace} is locked by PID {holder}"),
            context: ErrorContext {
                namespace: Some(namespace.to_string()),
                holder: Some(holder),
                ..ErrorContext::default()
            },
            source: None,
        }
    }

    /// Paged operation against pages held by a different PID. `pages` lists
    /// every conflicting page name.
    pub fn pages_locked(namespace: &str, pages: Vec<String>) -> Self {
        CacheError {
            kind: ErrorKind::LockConflict,
            code: codes::ENTRY_LOCK,
            message: format!("pages [{}] of {namespace} are locked", pages.join(", ")),
            context: ErrorContext {
                namespace: Some(namespace.to_string()),
                pages,
                ..ErrorContext::default()
            },
            source: None,
        }
    }

    /// Client call whose shape does not match the entity's declared strategy.
    pub fn invalid_strategy(declared: CacheStrategy, operation: &str) -> Self {
        CacheError {
            kind: ErrorKind::InvalidStrategy,
            code: codes::INVALID_STRATEGY,
            message: format!("{operation} is not valid for a {declared} entity"),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Backing store unreachable or unusable.
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        CacheError {
            kind: ErrorKind::BackendUnavailable,
            code: codes::BACKEND_UNAVAILABLE,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Malformed call shape.
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        CacheError {
            kind: ErrorKind::BadArguments,
            code: codes::BAD_ARGUMENTS,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Attach the namespace the failure occurred in.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.context.namespace = Some(namespace.to_string());
        self
    }

    /// Attach the key the failure occurred on.
    pub fn with_key(mut self, key: &str) -> Self {
        self.context.key = Some(key.to_string());
        self
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// PID holding the conflicting lock, when known.
    pub fn holder(&self) -> Option<ProcessId> {
        self.context.holder
    }
}

/// Result type alias for cachet operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_mismatch_display_and_code() {
        let err = CacheError::offset_mismatch("ns_1", 1, 3);
        assert_eq!(err.kind, ErrorKind::OffsetMismatch);
        assert_eq!(err.code, codes::OFFSET_MISMATCH);
        let msg = format!("{}", err);
        assert!(msg.contains("OffsetMismatch"));
        assert!(msg.contains("code 1"));
        assert!(msg.contains("ns_1"));
        assert_eq!(err.context.expected_offset, Some(1));
        assert_eq!(err.context.current_offset, Some(3));
    }

    #[test]
    fn test_lock_conflict_codes_differ_by_tier() {
        let ns = CacheError::namespace_locked("ns_1", 1337);
        let img = CacheError::image_locked("ns_1", 1337);
        assert_eq!(ns.kind, ErrorKind::LockConflict);
        assert_eq!(img.kind, ErrorKind::LockConflict);
        assert_eq!(ns.code, codes::NAMESPACE_LOCK);
        assert_eq!(img.code, codes::ENTRY_LOCK);
        assert_eq!(ns.holder(), Some(1337));
    }

    #[test]
    fn test_pages_locked_context_lists_pages() {
        let err = CacheError::pages_locked("ns_1", vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(err.kind, ErrorKind::LockConflict);
        assert_eq!(err.code, codes::ENTRY_LOCK);
        assert!(err.context.pages.contains(&"p1".to_string()));
        assert!(err.context.pages.contains(&"p2".to_string()));
        let msg = format!("{}", err);
        assert!(msg.contains("p1"));
        assert!(msg.contains("p2"));
    }

    #[test]
    fn test_invalid_strategy_display() {
        let err = CacheError::invalid_strategy(CacheStrategy::Monolithic, "read_cache_page");
        assert_eq!(err.kind, ErrorKind::InvalidStrategy);
        assert_eq!(err.code, codes::INVALID_STRATEGY);
        let msg = format!("{}", err);
        assert!(msg.contains("read_cache_page"));
        assert!(msg.contains("Monolithic"));
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = CacheError::backend_unavailable("redis unreachable").with_source(io);
        assert_eq!(err.kind, ErrorKind::BackendUnavailable);
        assert!(std::error::Error::source(&err).is_some());
        assert!(format!("{}", err).contains("redis unreachable"));
    }

    #[test]
    fn test_bad_arguments_with_context() {
        let err = CacheError::bad_arguments("key must not be empty")
            .with_namespace("ns_1")
            .with_key("");
        assert_eq!(err.kind, ErrorKind::BadArguments);
        assert_eq!(err.code, codes::BAD_ARGUMENTS);
        assert_eq!(err.context.namespace.as_deref(), Some("ns_1"));
        assert_eq!(err.context.key.as_deref(), Some(""));
    }

    #[test]
    fn test_kind_display_matches_as_str() {
        for kind in [
            ErrorKind::OffsetMismatch,
            ErrorKind::LockConflict,
            ErrorKind::InvalidStrategy,
            ErrorKind::BackendUnavailable,
            ErrorKind::BadArguments,
        ] {
            assert_eq!(format!("{}", kind), kind.as_str());
        }
    }
}
