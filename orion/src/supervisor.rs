//! Guardian: stall detection and automatic recovery.
//!
//! Every tick the supervisor probes each instance, classifies stalls, and
//! submits recovery commands through the queue. It never touches instances
//! directly. Recoveries are rate limited per instance by a cooldown and per
//! (instance, stall class) by a circuit breaker; an opened circuit and an
//! executor conflict each raise exactly one critical command for an operator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::ClockPair;
use crate::core::breaker::{BreakerConfig, CircuitBreaker};
use crate::core::stall::{self, InstanceProbe};
use crate::core::types::{Action, CommandRequest, CommandStatus, RiskLevel, StallClass, StallReason};
use crate::error::{CommandError, PersistenceError};
use crate::hub::Hub;
use crate::io::config::SupervisorConfig;
use crate::io::sink::{DashboardSink, DashboardSnapshot, DashboardUpdate};
use crate::io::store::StateStore;
use crate::lease::LeaseManager;
use crate::queue::CommandQueue;

/// `requested_by` of every command the supervisor submits.
pub const GUARDIAN: &str = "guardian";

/// Persisted cooldown, circuit and escalation bookkeeping (`supervisor.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    #[serde(default)]
    pub recoveries: Vec<RecoveryRecord>,
    #[serde(default)]
    pub circuits: Vec<CircuitRecord>,
    #[serde(default)]
    pub escalations: Vec<EscalationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub instance_id: String,
    pub class: StallClass,
    pub request_id: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub progress_at_issue: Option<DateTime<Utc>>,
    /// Already counted as a success or a failure.
    #[serde(default)]
    pub judged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub instance_id: String,
    pub class: StallClass,
    #[serde(default)]
    pub failures: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub instance_id: String,
    pub class: StallClass,
    pub request_id: String,
}

/// What one tick observed and submitted.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub stalls: Vec<(String, StallReason)>,
    /// Request ids of recovery commands submitted this tick.
    pub recoveries: Vec<String>,
    /// Request ids of critical commands submitted this tick.
    pub escalations: Vec<String>,
}

#[derive(Debug, Clone)]
struct Recovery {
    class: StallClass,
    request_id: String,
    issued_at: Instant,
    progress_at_issue: Option<Instant>,
    judged: bool,
}

impl Recovery {
    fn progressed(&self, probe: &InstanceProbe) -> bool {
        probe
            .last_progress_at
            .is_some_and(|at| self.progress_at_issue.is_none_or(|before| at > before))
    }
}

type CircuitKey = (String, StallClass);

#[derive(Default)]
struct GuardianState {
    /// Latest recovery per instance; its `issued_at` drives the cooldown.
    recoveries: HashMap<String, Recovery>,
    circuits: BTreeMap<CircuitKey, CircuitBreaker>,
    /// Open critical commands, at most one per (instance, class).
    escalations: BTreeMap<CircuitKey, String>,
}

impl GuardianState {
    fn from_snapshot(snapshot: SupervisorSnapshot, breaker: BreakerConfig, clock: &ClockPair) -> Self {
        let mut state = Self::default();
        for record in snapshot.recoveries {
            state.recoveries.insert(
                record.instance_id,
                Recovery {
                    class: record.class,
                    request_id: record.request_id,
                    issued_at: clock.to_instant(record.issued_at),
                    progress_at_issue: record.progress_at_issue.map(|at| clock.to_instant(at)),
                    judged: record.judged,
                },
            );
        }
        for record in snapshot.circuits {
            let failures = record
                .failures
                .into_iter()
                .map(|at| clock.to_instant(at))
                .collect();
            let open_until = record.open_until.map(|at| clock.to_deadline(at));
            state.circuits.insert(
                (record.instance_id, record.class),
                CircuitBreaker::restore(breaker, failures, open_until),
            );
        }
        for record in snapshot.escalations {
            state
                .escalations
                .insert((record.instance_id, record.class), record.request_id);
        }
        state
    }

    fn to_snapshot(&self, clock: &ClockPair) -> SupervisorSnapshot {
        let mut recoveries: Vec<RecoveryRecord> = self
            .recoveries
            .iter()
            .map(|(instance_id, recovery)| RecoveryRecord {
                instance_id: instance_id.clone(),
                class: recovery.class,
                request_id: recovery.request_id.clone(),
                issued_at: clock.to_wall(recovery.issued_at),
                progress_at_issue: recovery.progress_at_issue.map(|at| clock.to_wall(at)),
                judged: recovery.judged,
            })
            .collect();
        recoveries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        SupervisorSnapshot {
            recoveries,
            circuits: self
                .circuits
                .iter()
                .map(|((instance_id, class), breaker)| CircuitRecord {
                    instance_id: instance_id.clone(),
                    class: *class,
                    failures: breaker.failures().map(|at| clock.to_wall(*at)).collect(),
                    open_until: breaker.open_until().map(|at| clock.to_wall(at)),
                })
                .collect(),
            escalations: self
                .escalations
                .iter()
                .map(|((instance_id, class), request_id)| EscalationRecord {
                    instance_id: instance_id.clone(),
                    class: *class,
                    request_id: request_id.clone(),
                })
                .collect(),
        }
    }

    fn breaker(&mut self, instance_id: &str, class: StallClass, config: BreakerConfig) -> &mut CircuitBreaker {
        self.circuits
            .entry((instance_id.to_string(), class))
            .or_insert_with(|| CircuitBreaker::new(config))
    }

    /// Forget bookkeeping of deregistered instances.
    fn retain_instances(&mut self, known: &HashSet<&str>) {
        self.recoveries.retain(|id, _| known.contains(id.as_str()));
        self.circuits.retain(|(id, _), _| known.contains(id.as_str()));
        self.escalations.retain(|(id, _), _| known.contains(id.as_str()));
    }

    /// Drop escalations the operator has dealt with. An approved `Escalate`
    /// closes its circuit.
    fn settle_escalations(&mut self, queue: &CommandQueue) {
        let mut closed = Vec::new();
        for (key, request_id) in &self.escalations {
            match queue.get(request_id) {
                Some(command) if !command.status.is_terminal() => {}
                Some(command) => {
                    let acknowledged = command.status == CommandStatus::Succeeded
                        && matches!(command.action, Action::Escalate { .. });
                    closed.push((key.clone(), acknowledged));
                }
                None => closed.push((key.clone(), false)),
            }
        }
        for (key, acknowledged) in closed {
            self.escalations.remove(&key);
            if acknowledged && let Some(breaker) = self.circuits.get_mut(&key) {
                breaker.reset();
                info!(instance = %key.0, class = key.1.as_str(), "circuit closed by operator");
            }
        }
    }

    fn open_circuits(&self, now: Instant) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|(_, breaker)| breaker.is_open(now))
            .map(|((instance_id, class), _)| format!("{instance_id}/{}", class.as_str()))
            .collect()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    hub: Arc<Hub>,
    leases: Arc<LeaseManager>,
    queue: CommandQueue,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn DashboardSink>,
    state: Mutex<GuardianState>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        queue: CommandQueue,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn DashboardSink>,
    ) -> Self {
        Self {
            config,
            hub,
            leases,
            queue,
            store,
            sink,
            state: Mutex::new(GuardianState::default()),
        }
    }

    /// Build a supervisor that honours cooldowns and circuits persisted by a
    /// previous process.
    pub fn restore(
        config: SupervisorConfig,
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        queue: CommandQueue,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn DashboardSink>,
    ) -> Result<Self, PersistenceError> {
        let snapshot = store.load_supervisor()?.unwrap_or_default();
        let state = GuardianState::from_snapshot(snapshot, config.breaker(), &ClockPair::now());
        let supervisor = Self::new(config, hub, leases, queue, store, sink);
        *supervisor.state.lock() = state;
        Ok(supervisor)
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.state.lock().to_snapshot(&ClockPair::now())
    }

    /// Tick until `shutdown` fires. Missed ticks are skipped.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.config.interval_secs, "supervisor started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        info!("supervisor stopped");
    }

    /// One supervision pass. Must be called inside a tokio runtime.
    #[instrument(skip_all)]
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let threshold = self.config.stuck_threshold();
        let mut report = TickReport::default();

        let mut probes = self.hub.probes();
        for probe in &mut probes {
            probe.lease_expired = self
                .leases
                .current(&probe.instance_id)
                .map(|lease| lease.is_expired(now));
        }
        let rejected = self.hub.conflict_rejected();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let known: HashSet<&str> = probes.iter().map(|probe| probe.instance_id.as_str()).collect();
        state.retain_instances(&known);
        state.settle_escalations(&self.queue);

        for probe in &probes {
            self.settle_recovery(state, probe, now, &mut report);
            let Some(reason) = stall::classify(probe, now, threshold) else {
                continue;
            };
            report.stalls.push((probe.instance_id.clone(), reason.clone()));
            if reason.class() == StallClass::ExecutorConflict {
                // Raise the decision once, on the instance that stood down.
                if rejected.contains(&probe.instance_id)
                    && let Some((action, _)) = stall::recovery_for(&reason)
                {
                    self.escalate(state, &probe.instance_id, reason.class(), action, &mut report);
                }
                continue;
            }
            self.recover(state, probe, &reason, now, &mut report);
        }

        let open_circuits = state.open_circuits(now);
        let snapshot = state.to_snapshot(&ClockPair::now());
        drop(guard);

        let pruned = self.queue.prune(now);
        if pruned > 0 {
            debug!(pruned, "pruned command records");
        }
        if let Err(err) = self.store.save_supervisor(&snapshot) {
            warn!(err = %err, "supervisor snapshot write failed");
        }
        self.sink.publish(&DashboardUpdate::Status(DashboardSnapshot {
            hub: self.hub.status(),
            queue_depth: self.queue.depth(),
            pending_decisions: self.queue.pending_decisions().len(),
            stalls: report
                .stalls
                .iter()
                .map(|(instance_id, reason)| (instance_id.clone(), reason.to_string()))
                .collect(),
            open_circuits,
        }));
        report
    }

    /// Judge the latest recovery once its effect is known.
    fn settle_recovery(
        &self,
        state: &mut GuardianState,
        probe: &InstanceProbe,
        now: Instant,
        report: &mut TickReport,
    ) {
        let instance_id = probe.instance_id.as_str();
        let Some(recovery) = state.recoveries.get_mut(instance_id) else {
            return;
        };
        if recovery.judged {
            return;
        }
        let class = recovery.class;
        if recovery.progressed(probe) {
            recovery.judged = true;
            state.breaker(instance_id, class, self.config.breaker()).record_success();
            debug!(instance = instance_id, class = class.as_str(), "recovery produced progress");
            return;
        }
        let failed = self
            .queue
            .get(&recovery.request_id)
            .is_some_and(|command| command.status == CommandStatus::Failed);
        if failed {
            recovery.judged = true;
            self.record_failure(state, instance_id, class, now, report);
        }
    }

    fn recover(
        &self,
        state: &mut GuardianState,
        probe: &InstanceProbe,
        reason: &StallReason,
        now: Instant,
        report: &mut TickReport,
    ) {
        let instance_id = probe.instance_id.as_str();
        let Some((action, risk)) = stall::recovery_for(reason) else {
            debug!(instance = instance_id, reason = %reason, "stall needs no recovery");
            return;
        };
        let class = reason.class();
        if let Some(previous) = state.recoveries.get_mut(instance_id) {
            let since = now.saturating_duration_since(previous.issued_at);
            if since <= self.config.cooldown() {
                debug!(instance = instance_id, since_secs = since.as_secs(), "recovery cooling down");
                return;
            }
            // Cooldown elapsed and the instance is still stalled.
            if !previous.judged {
                previous.judged = true;
                let previous_class = previous.class;
                self.record_failure(state, instance_id, previous_class, now, report);
            }
        }
        if state.breaker(instance_id, class, self.config.breaker()).is_open(now) {
            debug!(instance = instance_id, class = class.as_str(), "circuit open, recovery blocked");
            return;
        }

        let request = CommandRequest::new(instance_id, action, risk).requested_by(GUARDIAN);
        match self.queue.submit(request) {
            Ok(outcome) => {
                let request_id = outcome.request_id().to_string();
                info!(instance = instance_id, reason = %reason, request_id = %request_id, "recovery submitted");
                state.recoveries.insert(
                    instance_id.to_string(),
                    Recovery {
                        class,
                        request_id: request_id.clone(),
                        issued_at: now,
                        progress_at_issue: probe.last_progress_at,
                        judged: false,
                    },
                );
                report.recoveries.push(request_id);
            }
            Err(err @ CommandError::Debounced { .. }) => {
                debug!(instance = instance_id, err = %err, "recovery debounced");
            }
            Err(err) => warn!(instance = instance_id, err = %err, "recovery submission failed"),
        }
    }

    fn record_failure(
        &self,
        state: &mut GuardianState,
        instance_id: &str,
        class: StallClass,
        now: Instant,
        report: &mut TickReport,
    ) {
        let config = self.config.breaker();
        let tripped = state.breaker(instance_id, class, config).record_failure(now);
        if !tripped {
            debug!(instance = instance_id, class = class.as_str(), "recovery failed");
            return;
        }
        warn!(
            instance = instance_id,
            class = class.as_str(),
            open_secs = config.open_for.as_secs(),
            "recovery circuit opened"
        );
        let action = Action::Escalate {
            class,
            detail: format!(
                "{} failed recoveries within {}s",
                config.trigger_count,
                config.window.as_secs()
            ),
        };
        self.escalate(state, instance_id, class, action, report);
    }

    fn escalate(
        &self,
        state: &mut GuardianState,
        instance_id: &str,
        class: StallClass,
        action: Action,
        report: &mut TickReport,
    ) {
        let key = (instance_id.to_string(), class);
        if state.escalations.contains_key(&key) {
            debug!(instance = instance_id, class = class.as_str(), "escalation already open");
            return;
        }
        let request = CommandRequest::new(instance_id, action, RiskLevel::Critical).requested_by(GUARDIAN);
        match self.queue.submit(request) {
            Ok(outcome) => {
                let request_id = outcome.request_id().to_string();
                warn!(
                    instance = instance_id,
                    class = class.as_str(),
                    request_id = %request_id,
                    "escalated for operator decision"
                );
                state.escalations.insert(key, request_id.clone());
                report.escalations.push(request_id);
            }
            Err(err) => warn!(instance = instance_id, err = %err, "escalation submission failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::advance;

    use super::*;
    use crate::core::policy::{PolicyConfig, PolicyGate};
    use crate::core::types::{DeployOutcome, ExecutorKind};
    use crate::hub::CycleFinish;
    use crate::io::config::QueueConfig;
    use crate::io::store::MemoryStore;
    use crate::test_support::{RecordingHandler, RecordingSink};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            interval_secs: 10,
            stuck_threshold_secs: 120,
            cooldown_secs: 300,
            circuit_trigger_count: 3,
            circuit_window_secs: 3600,
            circuit_open_secs: 1800,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        queue: CommandQueue,
        handler: Arc<RecordingHandler>,
        sink: Arc<RecordingSink>,
        supervisor: Supervisor,
    }

    impl Fixture {
        fn restart_supervisor(&self) -> Supervisor {
            Supervisor::restore(
                config(),
                self.hub.clone(),
                self.leases.clone(),
                self.queue.clone(),
                self.store.clone(),
                self.sink.clone(),
            )
            .expect("restore")
        }

        async fn settle(&self, report: &TickReport) {
            for request_id in &report.recoveries {
                self.queue.wait(request_id).await.expect("wait");
            }
        }
    }

    fn fixture_with(handler: RecordingHandler) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(store.clone()));
        hub.register("a", "A").expect("register");
        hub.set_running("a", true).expect("running");
        let leases = Arc::new(LeaseManager::new());
        let handler = Arc::new(handler);
        let queue = CommandQueue::new(
            QueueConfig::default(),
            PolicyGate::new(PolicyConfig::default()).expect("policy"),
            store.clone(),
            hub.clone(),
            handler.clone(),
        );
        let sink = Arc::new(RecordingSink::new());
        let supervisor = Supervisor::new(
            config(),
            hub.clone(),
            leases.clone(),
            queue.clone(),
            store.clone(),
            sink.clone(),
        );
        Fixture {
            store,
            hub,
            leases,
            queue,
            handler,
            sink,
            supervisor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingHandler::new())
    }

    fn failures(supervisor: &Supervisor, class: StallClass) -> usize {
        supervisor
            .snapshot()
            .circuits
            .iter()
            .find(|circuit| circuit.instance_id == "a" && circuit.class == class)
            .map_or(0, |circuit| circuit.failures.len())
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_instance_is_left_alone() {
        let f = fixture();
        advance(Duration::from_secs(60)).await;
        let report = f.supervisor.tick();
        assert!(report.stalls.is_empty());
        assert!(report.recoveries.is_empty());
        assert_eq!(f.sink.statuses().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_storm_is_held_to_one_command_per_cooldown() {
        let f = fixture();
        advance(Duration::from_secs(121)).await;
        let report = f.supervisor.tick();
        assert_eq!(
            report.stalls,
            vec![(
                "a".to_string(),
                StallReason::NoProgress { elapsed_secs: 121 }
            )]
        );
        assert_eq!(report.recoveries.len(), 1);
        f.settle(&report).await;

        for _ in 0..29 {
            advance(Duration::from_secs(10)).await;
            let report = f.supervisor.tick();
            assert_eq!(report.stalls.len(), 1);
            assert!(report.recoveries.is_empty());
        }
        assert_eq!(f.handler.count(), 1);
        assert_eq!(f.handler.handled()[0].requested_by, GUARDIAN);
        assert_eq!(f.handler.handled()[0].action.name(), "nudge");

        advance(Duration::from_secs(11)).await;
        let report = f.supervisor.tick();
        assert_eq!(report.recoveries.len(), 1);
        f.settle(&report).await;
        assert_eq!(f.handler.count(), 2);
        // The first nudge did not help.
        assert_eq!(failures(&f.supervisor, StallClass::NoProgress), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_after_recovery_counts_as_success() {
        let f = fixture();
        advance(Duration::from_secs(121)).await;
        let report = f.supervisor.tick();
        f.settle(&report).await;

        let ticket = f.hub.cycle_started("a").expect("start");
        f.hub
            .cycle_finished(
                "a",
                &CycleFinish {
                    started_at: ticket.started_at,
                    dispatched: true,
                    outcome: DeployOutcome::Deployed,
                    artifact_fingerprint: Some("fp".to_string()),
                },
            )
            .expect("finish");

        advance(Duration::from_secs(10)).await;
        let report = f.supervisor.tick();
        assert!(report.stalls.is_empty());
        assert_eq!(failures(&f.supervisor, StallClass::NoProgress), 0);
        assert!(f.supervisor.snapshot().recoveries[0].judged);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_command_counts_immediately() {
        let f = fixture_with(RecordingHandler::new().failing("nudge"));
        advance(Duration::from_secs(121)).await;
        let report = f.supervisor.tick();
        f.settle(&report).await;

        advance(Duration::from_secs(10)).await;
        let report = f.supervisor.tick();
        assert!(report.recoveries.is_empty());
        assert_eq!(failures(&f.supervisor, StallClass::NoProgress), 1);

        // Once the cooldown is over the same failure is not counted twice.
        advance(Duration::from_secs(300)).await;
        let report = f.supervisor.tick();
        assert_eq!(report.recoveries.len(), 1);
        assert_eq!(failures(&f.supervisor, StallClass::NoProgress), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_escalates_once_and_closes_on_acknowledgement() {
        let f = fixture();
        advance(Duration::from_secs(121)).await;
        let first = f.supervisor.tick();
        assert_eq!(first.recoveries.len(), 1);
        f.settle(&first).await;
        for _ in 0..2 {
            advance(Duration::from_secs(301)).await;
            let report = f.supervisor.tick();
            assert_eq!(report.recoveries.len(), 1);
            f.settle(&report).await;
        }

        advance(Duration::from_secs(301)).await;
        let tripped = f.supervisor.tick();
        assert!(tripped.recoveries.is_empty());
        assert_eq!(tripped.escalations.len(), 1);
        let pending = f.queue.pending_decisions();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            pending[0].action,
            Action::Escalate {
                class: StallClass::NoProgress,
                ..
            }
        ));
        assert_eq!(pending[0].risk_level, RiskLevel::Critical);

        advance(Duration::from_secs(301)).await;
        let blocked = f.supervisor.tick();
        assert!(blocked.recoveries.is_empty());
        assert!(blocked.escalations.is_empty());
        assert_eq!(f.queue.pending_decisions().len(), 1);
        let status = f.sink.statuses().pop().expect("status");
        assert_eq!(status.open_circuits, vec!["a/no_progress".to_string()]);

        let escalation = &tripped.escalations[0];
        f.queue.approve(escalation, "operator").expect("approve");
        f.queue.wait(escalation).await.expect("wait");

        advance(Duration::from_secs(10)).await;
        let resumed = f.supervisor.tick();
        assert_eq!(resumed.recoveries.len(), 1);
        assert_eq!(failures(&f.supervisor, StallClass::NoProgress), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_instance_is_reported_but_not_recovered() {
        let f = fixture();
        f.hub
            .set_paused("a", true, Some("maintenance".to_string()))
            .expect("pause");
        advance(Duration::from_secs(600)).await;
        let report = f.supervisor.tick();
        assert_eq!(
            report.stalls[0].1,
            StallReason::Paused {
                reason: Some("maintenance".to_string())
            }
        );
        assert!(report.recoveries.is_empty());
        assert_eq!(f.queue.recent(10).len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn executor_conflict_raises_a_single_pending_decision() {
        let f = fixture();
        f.hub.register("b", "B").expect("register");
        f.hub.set_running("b", true).expect("running");
        f.hub
            .claim_executor("a", ExecutorKind::PolicyLoop)
            .expect("claim");
        assert!(f.hub.claim_executor("b", ExecutorKind::HubLoop).is_err());

        let report = f.supervisor.tick();
        assert_eq!(report.stalls.len(), 2);
        assert!(
            report
                .stalls
                .iter()
                .all(|(_, reason)| *reason == StallReason::ExecutorConflict)
        );
        assert_eq!(report.escalations.len(), 1);
        for _ in 0..5 {
            advance(Duration::from_secs(10)).await;
            assert!(f.supervisor.tick().escalations.is_empty());
        }

        let pending = f.queue.pending_decisions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_instance, "b");
        assert_eq!(pending[0].action, Action::ResolveConflict { keep: None });
        assert_eq!(pending[0].requested_by, GUARDIAN);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_and_dead_loop_get_restarts() {
        let f = fixture();
        f.hub.register("b", "B").expect("register");
        f.leases
            .acquire("a", "stale-holder", Duration::from_secs(30), "cycle")
            .expect("acquire");
        advance(Duration::from_secs(121)).await;

        let report = f.supervisor.tick();
        let reasons: Vec<&StallReason> = report.stalls.iter().map(|(_, reason)| reason).collect();
        assert_eq!(reasons, vec![&StallReason::LeaseExpired, &StallReason::Unknown]);
        assert_eq!(report.recoveries.len(), 2);
        f.settle(&report).await;
        let handled = f.handler.handled();
        assert!(handled.iter().all(|command| command.action.name() == "restart_cycle"));
        assert!(handled.iter().all(|command| command.risk_level == RiskLevel::Medium));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_survives_a_supervisor_restart() {
        let f = fixture();
        advance(Duration::from_secs(121)).await;
        let report = f.supervisor.tick();
        f.settle(&report).await;
        let persisted = f.store.load_supervisor().expect("load").expect("snapshot");
        assert_eq!(persisted.recoveries.len(), 1);

        let restarted = f.restart_supervisor();
        advance(Duration::from_secs(60)).await;
        let report = restarted.tick();
        assert_eq!(report.stalls.len(), 1);
        assert!(report.recoveries.is_empty());
        assert_eq!(f.handler.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistered_instances_are_forgotten() {
        let f = fixture();
        advance(Duration::from_secs(121)).await;
        let report = f.supervisor.tick();
        f.settle(&report).await;
        f.hub.deregister("a").expect("deregister");

        f.supervisor.tick();
        assert_eq!(f.supervisor.snapshot(), SupervisorSnapshot::default());
    }
}
