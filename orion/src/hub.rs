//! Multi-instance hub: instance registry, the executor slot, and snapshots.
//!
//! The hub is written by cycles and the command handler and read by the
//! supervisor. Every mutation that must survive a restart is persisted
//! through the injected [`StateStore`] while the hub lock is held, so the
//! on-disk order of snapshots matches the in-memory order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::ClockPair;
use crate::core::progress;
use crate::core::stall::InstanceProbe;
use crate::core::types::{CyclePhase, DeployOutcome, ExecutorKind};
use crate::error::{HubError, PersistenceError};
use crate::io::store::StateStore;

/// Live state of one orchestrator instance. Monotonic times only.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorInstance {
    pub instance_id: String,
    pub display_name: String,
    pub registered_at: Instant,
    /// The instance loop is alive.
    pub running: bool,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub phase: CyclePhase,
    pub iteration: u64,
    pub active_flows: u32,
    pub last_cycle_started_at: Option<Instant>,
    pub last_cycle_finished_at: Option<Instant>,
    pub last_progress_at: Option<Instant>,
    pub last_outcome: Option<DeployOutcome>,
    pub last_artifact_fingerprint: Option<String>,
    pub last_deploy_fingerprint: Option<String>,
}

impl OrchestratorInstance {
    fn new(instance_id: &str, display_name: &str, now: Instant) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            display_name: display_name.to_string(),
            registered_at: now,
            running: false,
            paused: false,
            pause_reason: None,
            phase: CyclePhase::Idle,
            iteration: 0,
            active_flows: 0,
            last_cycle_started_at: None,
            last_cycle_finished_at: None,
            last_progress_at: None,
            last_outcome: None,
            last_artifact_fingerprint: None,
            last_deploy_fingerprint: None,
        }
    }

    /// Restored instances come back idle and not running; their loops are
    /// started again by the runtime.
    fn from_snapshot(snapshot: InstanceSnapshot, clock: &ClockPair) -> Self {
        let instant = |wall: Option<DateTime<Utc>>| wall.map(|wall| clock.to_instant(wall));
        Self {
            registered_at: clock.to_instant(snapshot.registered_at),
            last_cycle_started_at: instant(snapshot.last_cycle_started_at),
            last_cycle_finished_at: instant(snapshot.last_cycle_finished_at),
            last_progress_at: instant(snapshot.last_progress_at),
            instance_id: snapshot.instance_id,
            display_name: snapshot.display_name,
            running: false,
            paused: snapshot.paused,
            pause_reason: snapshot.pause_reason,
            phase: CyclePhase::Idle,
            iteration: snapshot.iteration,
            active_flows: 0,
            last_outcome: snapshot.last_outcome,
            last_artifact_fingerprint: snapshot.last_artifact_fingerprint,
            last_deploy_fingerprint: snapshot.last_deploy_fingerprint,
        }
    }

    fn apply_finish(&mut self, finish: &CycleFinish, now: Instant) {
        self.active_flows = self.active_flows.saturating_sub(1);
        self.phase = CyclePhase::Idle;
        self.last_cycle_finished_at = Some(now);
        if finish.dispatched {
            self.iteration += 1;
        }
        let class = progress::classify(finish.outcome);
        self.last_progress_at = progress::advance(
            self.last_progress_at,
            finish.started_at,
            finish.dispatched,
            class,
        );
        self.last_outcome = Some(finish.outcome);
        if let Some(fingerprint) = &finish.artifact_fingerprint {
            self.last_artifact_fingerprint = Some(fingerprint.clone());
            if finish.outcome == DeployOutcome::Deployed {
                self.last_deploy_fingerprint = Some(fingerprint.clone());
            }
        }
    }
}

/// Persisted and published view of an instance (wall-clock times).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub display_name: String,
    pub registered_at: DateTime<Utc>,
    pub running: bool,
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    pub phase: CyclePhase,
    pub iteration: u64,
    pub active_flows: u32,
    #[serde(default)]
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_outcome: Option<DeployOutcome>,
    #[serde(default)]
    pub last_artifact_fingerprint: Option<String>,
    #[serde(default)]
    pub last_deploy_fingerprint: Option<String>,
    /// Set when this instance holds the executor slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
    #[serde(default)]
    pub in_executor_conflict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub instances: Vec<InstanceSnapshot>,
    pub active_executor: Option<String>,
    pub executor_conflict: bool,
}

/// What a cycle learns from the hub when it starts.
#[derive(Debug, Clone)]
pub struct CycleTicket {
    /// Iteration number this cycle will be recorded under.
    pub iteration: u64,
    pub started_at: Instant,
    pub last_outcome: Option<DeployOutcome>,
    pub last_deploy_fingerprint: Option<String>,
}

/// How a cycle ended, as reported back to the hub.
#[derive(Debug, Clone)]
pub struct CycleFinish {
    pub started_at: Instant,
    pub dispatched: bool,
    pub outcome: DeployOutcome,
    pub artifact_fingerprint: Option<String>,
}

impl CycleFinish {
    /// The same cycle downgraded to blocked (nothing persisted, no progress).
    fn blocked(&self) -> Self {
        Self {
            outcome: DeployOutcome::Blocked,
            artifact_fingerprint: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictResolution {
    /// Instance that holds the executor slot afterwards.
    pub kept: Option<String>,
    pub stood_down: Vec<String>,
}

#[derive(Debug, Clone)]
struct ExecutorClaim {
    instance_id: String,
    kind: ExecutorKind,
}

#[derive(Debug, Clone)]
struct Conflict {
    active: String,
    rejected: BTreeMap<String, ExecutorKind>,
}

impl Conflict {
    fn involves(&self, instance_id: &str) -> bool {
        self.active == instance_id || self.rejected.contains_key(instance_id)
    }
}

#[derive(Default)]
struct HubState {
    instances: BTreeMap<String, OrchestratorInstance>,
    executor: Option<ExecutorClaim>,
    conflict: Option<Conflict>,
}

impl HubState {
    fn get_mut(&mut self, instance_id: &str) -> Result<&mut OrchestratorInstance, HubError> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| HubError::UnknownInstance(instance_id.to_string()))
    }

    /// The claim counts only while its instance loop is running.
    fn live_executor(&self) -> Option<&ExecutorClaim> {
        self.executor.as_ref().filter(|claim| {
            self.instances
                .get(&claim.instance_id)
                .is_some_and(|instance| instance.running)
        })
    }

    fn snapshot(&self, instance: &OrchestratorInstance, clock: &ClockPair) -> InstanceSnapshot {
        let wall = |instant: Option<Instant>| instant.map(|instant| clock.to_wall(instant));
        InstanceSnapshot {
            instance_id: instance.instance_id.clone(),
            display_name: instance.display_name.clone(),
            registered_at: clock.to_wall(instance.registered_at),
            running: instance.running,
            paused: instance.paused,
            pause_reason: instance.pause_reason.clone(),
            phase: instance.phase,
            iteration: instance.iteration,
            active_flows: instance.active_flows,
            last_cycle_started_at: wall(instance.last_cycle_started_at),
            last_cycle_finished_at: wall(instance.last_cycle_finished_at),
            last_progress_at: wall(instance.last_progress_at),
            last_outcome: instance.last_outcome,
            last_artifact_fingerprint: instance.last_artifact_fingerprint.clone(),
            last_deploy_fingerprint: instance.last_deploy_fingerprint.clone(),
            executor: self
                .executor
                .as_ref()
                .filter(|claim| claim.instance_id == instance.instance_id)
                .map(|claim| claim.kind),
            in_executor_conflict: self
                .conflict
                .as_ref()
                .is_some_and(|conflict| conflict.involves(&instance.instance_id)),
        }
    }
}

pub struct Hub {
    store: Arc<dyn StateStore>,
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            state: Mutex::new(HubState::default()),
        }
    }

    /// Rebuild the registry from persisted snapshots.
    pub fn restore(store: Arc<dyn StateStore>) -> Result<Self, PersistenceError> {
        let clock = ClockPair::now();
        let mut state = HubState::default();
        for snapshot in store.load_instances()? {
            let instance = OrchestratorInstance::from_snapshot(snapshot, &clock);
            state.instances.insert(instance.instance_id.clone(), instance);
        }
        if !state.instances.is_empty() {
            info!(instances = state.instances.len(), "restored hub instances");
        }
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Register an instance. Re-registering returns the existing instance.
    pub fn register(
        &self,
        instance_id: &str,
        display_name: &str,
    ) -> Result<OrchestratorInstance, HubError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.instances.get(instance_id) {
            debug!(instance = instance_id, "instance already registered");
            return Ok(existing.clone());
        }
        let clock = ClockPair::now();
        let instance = OrchestratorInstance::new(instance_id, display_name, clock.instant);
        self.store.save_instance(&state.snapshot(&instance, &clock))?;
        state
            .instances
            .insert(instance_id.to_string(), instance.clone());
        info!(instance = instance_id, display_name, "instance registered");
        Ok(instance)
    }

    pub fn deregister(&self, instance_id: &str) -> Result<OrchestratorInstance, HubError> {
        let mut state = self.state.lock();
        let removed = state
            .instances
            .remove(instance_id)
            .ok_or_else(|| HubError::UnknownInstance(instance_id.to_string()))?;
        if state
            .executor
            .as_ref()
            .is_some_and(|claim| claim.instance_id == instance_id)
        {
            state.executor = None;
        }
        if let Some(conflict) = &mut state.conflict {
            conflict.rejected.remove(instance_id);
            if conflict.active == instance_id || conflict.rejected.is_empty() {
                state.conflict = None;
            }
        }
        self.store.remove_instance(instance_id)?;
        info!(instance = instance_id, "instance deregistered");
        Ok(removed)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.state.lock().instances.contains_key(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<OrchestratorInstance> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.state.lock().instances.keys().cloned().collect()
    }

    pub fn status(&self) -> HubStatus {
        let state = self.state.lock();
        let clock = ClockPair::now();
        HubStatus {
            instances: state
                .instances
                .values()
                .map(|instance| state.snapshot(instance, &clock))
                .collect(),
            active_executor: state
                .live_executor()
                .map(|claim| claim.instance_id.clone()),
            executor_conflict: state.conflict.is_some(),
        }
    }

    pub fn active_executor(&self) -> Option<String> {
        self.state
            .lock()
            .live_executor()
            .map(|claim| claim.instance_id.clone())
    }

    pub fn is_active_executor(&self, instance_id: &str) -> bool {
        self.active_executor().as_deref() == Some(instance_id)
    }

    pub fn executor_conflict(&self) -> bool {
        self.state.lock().conflict.is_some()
    }

    /// Instances that stood down in the current conflict.
    pub fn conflict_rejected(&self) -> Vec<String> {
        self.state
            .lock()
            .conflict
            .as_ref()
            .map(|conflict| conflict.rejected.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Claim the executor slot.
    ///
    /// Re-claiming by the current holder is a no-op. A claim while another
    /// instance holds a live claim is refused, the conflict is recorded, and
    /// the caller must stand down.
    pub fn claim_executor(&self, instance_id: &str, kind: ExecutorKind) -> Result<(), HubError> {
        let mut state = self.state.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(HubError::UnknownInstance(instance_id.to_string()));
        }
        if let Some(claim) = state.live_executor() {
            if claim.instance_id == instance_id {
                return Ok(());
            }
            let active = claim.instance_id.clone();
            if state
                .conflict
                .as_ref()
                .is_none_or(|conflict| conflict.active != active)
            {
                state.conflict = Some(Conflict {
                    active: active.clone(),
                    rejected: BTreeMap::new(),
                });
            }
            if let Some(conflict) = &mut state.conflict {
                conflict.rejected.insert(instance_id.to_string(), kind);
            }
            warn!(
                active = %active,
                rejected = instance_id,
                kind = ?kind,
                "second active executor refused"
            );
            return Err(HubError::ExecutorConflict {
                active,
                rejected: instance_id.to_string(),
            });
        }
        if let Some(stale) = state
            .executor
            .as_ref()
            .filter(|claim| claim.instance_id != instance_id)
        {
            info!(previous = %stale.instance_id, instance = instance_id, "replacing stopped executor");
        }
        state.executor = Some(ExecutorClaim {
            instance_id: instance_id.to_string(),
            kind,
        });
        info!(instance = instance_id, kind = ?kind, "executor claimed");
        Ok(())
    }

    pub fn release_executor(&self, instance_id: &str) -> bool {
        let mut state = self.state.lock();
        let held = state
            .executor
            .as_ref()
            .is_some_and(|claim| claim.instance_id == instance_id);
        if held {
            state.executor = None;
            info!(instance = instance_id, "executor released");
        }
        held
    }

    /// Clear the conflict. `keep` names the instance that should hold the
    /// slot afterwards; by default the current executor keeps it.
    pub fn resolve_conflict(&self, keep: Option<&str>) -> Result<ConflictResolution, HubError> {
        let mut state = self.state.lock();
        let Some(conflict) = state.conflict.take() else {
            return Ok(ConflictResolution {
                kept: state.executor.as_ref().map(|claim| claim.instance_id.clone()),
                stood_down: Vec::new(),
            });
        };

        let keep = keep.unwrap_or(conflict.active.as_str()).to_string();
        if !state.instances.contains_key(&keep) {
            state.conflict = Some(conflict);
            return Err(HubError::UnknownInstance(keep));
        }

        let mut stood_down: Vec<String> = conflict
            .rejected
            .keys()
            .filter(|id| **id != keep)
            .cloned()
            .collect();
        if keep != conflict.active {
            let kind = conflict
                .rejected
                .get(&keep)
                .copied()
                .or_else(|| state.executor.as_ref().map(|claim| claim.kind))
                .unwrap_or_default();
            stood_down.insert(0, conflict.active.clone());
            state.executor = Some(ExecutorClaim {
                instance_id: keep.clone(),
                kind,
            });
        }
        info!(kept = %keep, stood_down = ?stood_down, "executor conflict resolved");
        Ok(ConflictResolution {
            kept: Some(keep),
            stood_down,
        })
    }

    /// Mark the instance loop alive or stopped.
    pub fn set_running(&self, instance_id: &str, running: bool) -> Result<(), HubError> {
        let mut state = self.state.lock();
        let instance = state.get_mut(instance_id)?;
        if instance.running == running {
            return Ok(());
        }
        instance.running = running;
        let instance = instance.clone();
        self.persist(&state, &instance);
        Ok(())
    }

    pub fn set_paused(
        &self,
        instance_id: &str,
        paused: bool,
        reason: Option<String>,
    ) -> Result<OrchestratorInstance, HubError> {
        let mut state = self.state.lock();
        let clock = ClockPair::now();
        let mut next = state.get_mut(instance_id)?.clone();
        next.paused = paused;
        next.pause_reason = if paused { reason } else { None };
        self.store.save_instance(&state.snapshot(&next, &clock))?;
        state.instances.insert(instance_id.to_string(), next.clone());
        info!(instance = instance_id, paused, reason = ?next.pause_reason, "pause state changed");
        Ok(next)
    }

    pub fn set_phase(&self, instance_id: &str, phase: CyclePhase) {
        if let Some(instance) = self.state.lock().instances.get_mut(instance_id) {
            instance.phase = phase;
        }
    }

    /// Record a cycle start and hand back what the cycle needs.
    pub fn cycle_started(&self, instance_id: &str) -> Result<CycleTicket, HubError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let instance = state.get_mut(instance_id)?;
        instance.active_flows += 1;
        instance.phase = CyclePhase::Dispatching;
        instance.last_cycle_started_at = Some(now);
        Ok(CycleTicket {
            iteration: instance.iteration + 1,
            started_at: now,
            last_outcome: instance.last_outcome,
            last_deploy_fingerprint: instance.last_deploy_fingerprint.clone(),
        })
    }

    /// Apply a finished cycle and persist the snapshot.
    ///
    /// If the snapshot cannot be written, the cycle is applied as blocked
    /// instead (no progress credit) and the error is returned.
    pub fn cycle_finished(
        &self,
        instance_id: &str,
        finish: &CycleFinish,
    ) -> Result<OrchestratorInstance, HubError> {
        let mut state = self.state.lock();
        let clock = ClockPair::now();
        let mut next = state.get_mut(instance_id)?.clone();
        next.apply_finish(finish, clock.instant);

        let saved = self.store.save_instance(&state.snapshot(&next, &clock));
        let instance = state.get_mut(instance_id)?;
        match saved {
            Ok(()) => {
                *instance = next;
                Ok(instance.clone())
            }
            Err(err) => {
                instance.apply_finish(&finish.blocked(), clock.instant);
                warn!(instance = instance_id, err = %err, "instance snapshot write failed");
                Err(HubError::Persistence(err))
            }
        }
    }

    /// A cancelled cycle returns to idle without touching progress.
    pub fn cycle_cancelled(&self, instance_id: &str) -> Result<(), HubError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let instance = state.get_mut(instance_id)?;
        instance.active_flows = instance.active_flows.saturating_sub(1);
        instance.phase = CyclePhase::Idle;
        instance.last_cycle_finished_at = Some(now);
        let instance = instance.clone();
        self.persist(&state, &instance);
        Ok(())
    }

    /// Supervisor view. `lease_expired` is filled in by the caller.
    pub fn probes(&self) -> Vec<InstanceProbe> {
        let state = self.state.lock();
        state
            .instances
            .values()
            .map(|instance| InstanceProbe {
                instance_id: instance.instance_id.clone(),
                running: instance.running,
                paused: instance.paused,
                pause_reason: instance.pause_reason.clone(),
                in_executor_conflict: state
                    .conflict
                    .as_ref()
                    .is_some_and(|conflict| conflict.involves(&instance.instance_id)),
                lease_expired: None,
                last_progress_at: instance.last_progress_at,
                registered_at: instance.registered_at,
            })
            .collect()
    }

    /// Best-effort snapshot write for bookkeeping-only changes.
    fn persist(&self, state: &HubState, instance: &OrchestratorInstance) {
        let snapshot = state.snapshot(instance, &ClockPair::now());
        if let Err(err) = self.store.save_instance(&snapshot) {
            warn!(instance = %instance.instance_id, err = %err, "instance snapshot write failed");
        }
    }
}
