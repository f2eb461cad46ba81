//! Pure lease transitions for a single instance slot.
//!
//! The slot is `Option<Lease>`; callers serialize access to it (one mutex per
//! instance) and pass `now` explicitly so expiry is deterministic in tests.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::LeaseError;

/// Time-bounded exclusive right to run cycles for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub instance_id: String,
    pub holder_id: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
    pub expires_at: Instant,
    pub reason: String,
}

impl Lease {
    /// Expired at exactly `expires_at`; there is no grace period.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// A granted lease, with a flag recording whether an expired one was taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub lease: Lease,
    pub expired_lock_reclaimed: bool,
    pub previous_holder: Option<String>,
}

/// Acquire (or renew) the slot for `holder_id`.
///
/// - Empty slot: grant.
/// - Live lease, same holder: renew from `now`.
/// - Live lease, other holder: `Conflict`.
/// - Expired lease: reclaim, reporting `expired_lock_reclaimed`.
pub fn acquire(
    slot: &mut Option<Lease>,
    instance_id: &str,
    holder_id: &str,
    ttl: Duration,
    reason: &str,
    now: Instant,
) -> Result<LeaseGrant, LeaseError> {
    let mut expired_lock_reclaimed = false;
    let mut previous_holder = None;

    if let Some(existing) = slot.as_ref() {
        if !existing.is_expired(now) && existing.holder_id != holder_id {
            return Err(LeaseError::Conflict {
                instance_id: instance_id.to_string(),
                holder_id: existing.holder_id.clone(),
                remaining: existing.remaining(now),
            });
        }
        if existing.is_expired(now) {
            expired_lock_reclaimed = true;
            previous_holder = Some(existing.holder_id.clone());
        }
    }

    let lease = Lease {
        instance_id: instance_id.to_string(),
        holder_id: holder_id.to_string(),
        acquired_at: now,
        ttl,
        expires_at: now + ttl,
        reason: reason.to_string(),
    };
    *slot = Some(lease.clone());

    Ok(LeaseGrant {
        lease,
        expired_lock_reclaimed,
        previous_holder,
    })
}

/// Release the slot. Returns the removed lease, or `None` when refused.
///
/// `force_if_expired` only evicts a lease that has actually expired; a live
/// lease owned by someone else is never removed.
pub fn release(
    slot: &mut Option<Lease>,
    holder_id: &str,
    force_if_expired: bool,
    now: Instant,
) -> Option<Lease> {
    let allowed = match slot.as_ref() {
        Some(existing) => {
            existing.holder_id == holder_id || (force_if_expired && existing.is_expired(now))
        }
        None => false,
    };
    if allowed { slot.take() } else { None }
}

/// Extend a live lease owned by `holder_id` by its TTL from `now`.
pub fn heartbeat(
    slot: &mut Option<Lease>,
    instance_id: &str,
    holder_id: &str,
    now: Instant,
) -> Result<Lease, LeaseError> {
    let Some(existing) = slot.as_mut() else {
        return Err(LeaseError::NotHeld {
            instance_id: instance_id.to_string(),
            holder_id: holder_id.to_string(),
        });
    };
    if existing.holder_id != holder_id {
        return Err(LeaseError::NotHeld {
            instance_id: instance_id.to_string(),
            holder_id: holder_id.to_string(),
        });
    }
    if existing.is_expired(now) {
        return Err(LeaseError::Expired {
            instance_id: instance_id.to_string(),
        });
    }
    existing.expires_at = now + existing.ttl;
    Ok(existing.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_holder_conflicts_while_lease_is_live() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "a", TTL, "cycle", now).expect("first acquire");

        let err = acquire(&mut slot, "i1", "b", TTL, "cycle", now + Duration::from_secs(10))
            .unwrap_err();
        match err {
            LeaseError::Conflict {
                holder_id,
                remaining,
                ..
            } => {
                assert_eq!(holder_id, "a");
                assert_eq!(remaining, Duration::from_secs(20));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn expired_lease_is_reclaimed_and_flagged() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "a", TTL, "cycle", now).expect("first acquire");

        let grant = acquire(&mut slot, "i1", "b", TTL, "takeover", now + TTL).expect("reclaim");
        assert!(grant.expired_lock_reclaimed);
        assert_eq!(grant.previous_holder.as_deref(), Some("a"));
        assert_eq!(slot.as_ref().map(|l| l.holder_id.as_str()), Some("b"));
    }

    #[test]
    fn same_holder_renews_without_reclaim_flag() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "a", TTL, "cycle", now).expect("first");
        let grant =
            acquire(&mut slot, "i1", "a", TTL, "cycle", now + Duration::from_secs(5)).expect("renew");
        assert!(!grant.expired_lock_reclaimed);
        assert_eq!(grant.lease.expires_at, now + Duration::from_secs(35));
    }

    #[test]
    fn force_release_never_evicts_live_holder() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "Y", TTL, "cycle", now).expect("acquire");

        assert!(release(&mut slot, "X", true, now + Duration::from_secs(1)).is_none());
        assert!(slot.is_some());

        let removed = release(&mut slot, "X", true, now + TTL).expect("expired force release");
        assert_eq!(removed.holder_id, "Y");
        assert!(slot.is_none());
    }

    #[test]
    fn holder_releases_own_lease() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "a", TTL, "cycle", now).expect("acquire");
        assert!(release(&mut slot, "b", false, now).is_none());
        assert!(release(&mut slot, "a", false, now).is_some());
    }

    #[test]
    fn heartbeat_extends_and_rejects_wrong_or_expired_holder() {
        let now = Instant::now();
        let mut slot = None;
        acquire(&mut slot, "i1", "a", TTL, "cycle", now).expect("acquire");

        let later = now + Duration::from_secs(20);
        let lease = heartbeat(&mut slot, "i1", "a", later).expect("heartbeat");
        assert_eq!(lease.expires_at, later + TTL);

        assert!(matches!(
            heartbeat(&mut slot, "i1", "b", later),
            Err(LeaseError::NotHeld { .. })
        ));
        assert!(matches!(
            heartbeat(&mut slot, "i1", "a", later + TTL),
            Err(LeaseError::Expired { .. })
        ));
    }
}
