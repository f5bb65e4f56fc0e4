//! Lock leases shared by the namespace and image/page lock tiers.
//!
//! A lease is cooperative data, not an OS primitive: drivers store it next
//! to the namespace state and compare ownership and expiry when an access is
//! attempted. Expiry is lazy; nothing sweeps leases in the background.
//!
//! A lease leaves the world in exactly three ways: it expires, its owner
//! unlocks it, or its owner writes/deletes inside the locked scope.

use crate::{ProcessId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An exclusive lease on a namespace, a monolithic image, or a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    /// PID that installed the lease.
    pub holder: ProcessId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockLease {
    /// Create a lease owned by `holder`, expiring `ttl` after `now`.
    pub fn new(holder: ProcessId, ttl: Duration, now: Timestamp) -> Self {
        LockLease {
            holder,
            acquired_at: now,
            expires_at: expiry_after(now, ttl),
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether this lease blocks an access by `pid`: live and foreign.
    pub fn blocks(&self, pid: ProcessId, now: Timestamp) -> bool {
        !self.is_expired(now) && self.holder != pid
    }

    /// Whether `pid` holds this lease and it is still live.
    pub fn is_held_by(&self, pid: ProcessId, now: Timestamp) -> bool {
        !self.is_expired(now) && self.holder == pid
    }

    /// Push the expiry out to `ttl` after `now`, keeping the original
    /// acquisition time. Same-owner re-lock path.
    pub fn refresh(&mut self, ttl: Duration, now: Timestamp) {
        self.expires_at = expiry_after(now, ttl);
    }

    /// Remaining duration until expiry, `None` once expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

/// Expiry `ttl` after `now`, saturating at the far end of the calendar. A
/// caller-supplied duration must never panic the lease math.
fn expiry_after(now: Timestamp, ttl: Duration) -> Timestamp {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn fresh_lease_blocks_exactly_foreign_pids(
            holder in 1u64..10_000,
            other in 1u64..10_000,
            secs in 1u64..3_600,
        ) {
            let now = Utc::now();
            let lease = LockLease::new(holder, Duration::from_secs(secs), now);
            prop_assert!(!lease.is_expired(now));
            prop_assert!(lease.is_held_by(holder, now));
            prop_assert_eq!(lease.blocks(other, now), other != holder);
        }

        #[test]
        fn no_ttl_panics_the_lease_math(secs in any::<u64>(), nanos in 0u32..1_000_000_000) {
            let now = Utc::now();
            let ttl = Duration::new(secs, nanos);
            let lease = LockLease::new(1, ttl, now);
            prop_assert!(lease.expires_at >= now);

            let mut refreshed = lease.clone();
            refreshed.refresh(ttl, now);
            prop_assert_eq!(refreshed.expires_at, lease.expires_at);
            prop_assert_eq!(refreshed.acquired_at, lease.acquired_at);
        }

        #[test]
        fn past_the_ttl_the_lease_stops_blocking(secs in 1i64..3_600) {
            let now = Utc::now();
            let lease = LockLease::new(1, Duration::from_secs(secs as u64), now);
            let after = now + chrono::Duration::seconds(secs);
            prop_assert!(lease.is_expired(after));
            prop_assert!(!lease.blocks(2, after));
            prop_assert_eq!(lease.remaining(after), None);
        }
    }
}
