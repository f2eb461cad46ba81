//! Lease manager: one mutex per instance, no cross-instance locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::lease::{self, Lease, LeaseGrant};
use crate::error::LeaseError;

type Slot = Arc<Mutex<Option<Lease>>>;

#[derive(Default)]
pub struct LeaseManager {
    slots: RwLock<HashMap<String, Slot>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(instance_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    pub fn acquire(
        &self,
        instance_id: &str,
        holder_id: &str,
        ttl: Duration,
        reason: &str,
    ) -> Result<LeaseGrant, LeaseError> {
        let slot = self.slot(instance_id);
        let mut guard = slot.lock();
        let grant = lease::acquire(&mut guard, instance_id, holder_id, ttl, reason, Instant::now())?;
        drop(guard);

        if grant.expired_lock_reclaimed {
            warn!(
                instance = instance_id,
                holder = holder_id,
                previous_holder = ?grant.previous_holder,
                reason,
                "reclaimed expired lease"
            );
        } else {
            debug!(instance = instance_id, holder = holder_id, reason, "lease acquired");
        }
        Ok(grant)
    }

    /// Release a lease. `actor_id` and `reason` are for the log only.
    pub fn release(
        &self,
        instance_id: &str,
        holder_id: &str,
        force_if_expired: bool,
        actor_id: &str,
        reason: &str,
    ) -> bool {
        let slot = self.slot(instance_id);
        let removed = lease::release(&mut slot.lock(), holder_id, force_if_expired, Instant::now());
        match &removed {
            Some(lease) if lease.holder_id != holder_id => info!(
                instance = instance_id,
                evicted = %lease.holder_id,
                actor = actor_id,
                reason,
                "force-released expired lease"
            ),
            Some(_) => debug!(instance = instance_id, holder = holder_id, actor = actor_id, "lease released"),
            None => debug!(
                instance = instance_id,
                holder = holder_id,
                actor = actor_id,
                force_if_expired,
                "lease release refused"
            ),
        }
        removed.is_some()
    }

    pub fn heartbeat(&self, instance_id: &str, holder_id: &str) -> Result<Lease, LeaseError> {
        let slot = self.slot(instance_id);
        lease::heartbeat(&mut slot.lock(), instance_id, holder_id, Instant::now())
    }

    pub fn current(&self, instance_id: &str) -> Option<Lease> {
        self.slots
            .read()
            .get(instance_id)
            .and_then(|slot| slot.lock().clone())
    }

    /// Drop the slot entirely (instance deregistered).
    pub fn forget(&self, instance_id: &str) {
        self.slots.write().remove(instance_id);
    }
}
