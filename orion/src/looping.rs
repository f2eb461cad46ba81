//! Per-instance cycle loop.
//!
//! Every started instance owns one loop task. The loop runs a cycle whenever
//! it is woken (nudge, restart, resume) and, while its instance holds the
//! hub's executor slot, on every interval tick. Wakes that arrive during a
//! cycle collapse into a single follow-up cycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cycle::{CycleError, CycleOutcome, CycleRunner};
use crate::error::HubError;
use crate::hub::Hub;

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Pause between self-driven cycles.
    pub interval: Duration,
    /// Wait after a lease conflict before listening for work again.
    pub conflict_backoff: Duration,
}

/// Owner's handle to a running instance loop.
pub struct LoopHandle {
    holder_id: String,
    wake: Arc<Notify>,
    stop: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Lease holder id used by this loop's cycles.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cancel the in-flight cycle, if any. Returns whether one was running.
    pub fn cancel_cycle(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit. An in-flight cycle is cancelled.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            warn!(holder = %self.holder_id, err = %err, "instance loop task failed");
        }
    }
}

/// Start the loop for `instance_id`.
///
/// The instance is marked running before this returns, so an executor claim
/// made right after counts as live.
pub fn spawn(
    instance_id: &str,
    hub: Arc<Hub>,
    runner: Arc<CycleRunner>,
    settings: LoopSettings,
) -> Result<LoopHandle, HubError> {
    hub.set_running(instance_id, true)?;
    let holder_id = format!("{instance_id}/{}", Uuid::now_v7());
    let wake = Arc::new(Notify::new());
    let stop = CancellationToken::new();
    let current = Arc::new(Mutex::new(None));
    let instance_loop = InstanceLoop {
        instance_id: instance_id.to_string(),
        holder_id: holder_id.clone(),
        hub,
        runner,
        settings,
        wake: wake.clone(),
        stop: stop.clone(),
        current: current.clone(),
    };
    let task = tokio::spawn(instance_loop.run());
    Ok(LoopHandle {
        holder_id,
        wake,
        stop,
        current,
        task,
    })
}

struct InstanceLoop {
    instance_id: String,
    holder_id: String,
    hub: Arc<Hub>,
    runner: Arc<CycleRunner>,
    settings: LoopSettings,
    wake: Arc<Notify>,
    stop: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl InstanceLoop {
    #[instrument(skip_all, fields(instance = %self.instance_id))]
    async fn run(self) {
        info!(holder = %self.holder_id, "instance loop started");
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First self-driven cycle one interval from now; starters wake the loop.
        ticker.reset();

        loop {
            let self_driving = self.hub.is_active_executor(&self.instance_id);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.wake.notified() => debug!("woken"),
                _ = ticker.tick(), if self_driving => debug!("interval tick"),
            }
            if !self.cycle_once().await {
                break;
            }
        }

        self.hub.release_executor(&self.instance_id);
        if let Err(err) = self.hub.set_running(&self.instance_id, false) {
            debug!(err = %err, "instance gone before its loop stopped");
        }
        info!("instance loop stopped");
    }

    /// Run one cycle. Returns `false` when the loop should exit.
    async fn cycle_once(&self) -> bool {
        let token = self.stop.child_token();
        *self.current.lock() = Some(token.clone());
        let result = self
            .runner
            .run_cycle(&self.instance_id, &self.holder_id, &token)
            .await;
        *self.current.lock() = None;

        match result {
            Ok(CycleOutcome::Finished(report)) => debug!(
                iteration = report.iteration,
                outcome = report.result.deploy_outcome.as_str(),
                "cycle finished"
            ),
            Ok(CycleOutcome::SkippedPaused) => debug!("paused, cycle skipped"),
            Ok(CycleOutcome::Cancelled) => debug!("cycle cancelled"),
            Err(CycleError::Lease(err)) if err.is_retryable() => {
                warn!(
                    err = %err,
                    backoff_ms = self.settings.conflict_backoff.as_millis() as u64,
                    "lease held elsewhere, backing off"
                );
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = sleep(self.settings.conflict_backoff) => {}
                }
            }
            Err(CycleError::Hub(HubError::UnknownInstance(_))) => {
                warn!("instance deregistered, stopping loop");
                return false;
            }
            Err(err) => warn!(err = %err, "cycle could not start"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentToolkit, CapabilityConfig};
    use crate::core::types::{AgentRole, CyclePhase, ExecutorKind};
    use crate::core::veto::VetoThresholds;
    use crate::cycle::{AgentSet, CycleSettings};
    use crate::io::store::MemoryStore;
    use crate::lease::LeaseManager;
    use crate::test_support::{RecordingSink, ScriptedDeployer, ScriptedGenerator, ScriptedReply};

    const SETTINGS: LoopSettings = LoopSettings {
        interval: Duration::from_secs(60),
        conflict_backoff: Duration::from_secs(5),
    };

    struct Fixture {
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        runner: Arc<CycleRunner>,
    }

    fn fixture(generator: ScriptedGenerator) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(store.clone()));
        hub.register("a", "A").expect("register");
        let leases = Arc::new(LeaseManager::new());
        let agents = AgentSet::new(
            Arc::new(generator),
            Arc::new(AgentToolkit::new().expect("toolkit")),
            CapabilityConfig {
                timeout: Duration::from_secs(600),
                retry_backoff: Duration::from_millis(100),
            },
        );
        let runner = Arc::new(CycleRunner::new(
            hub.clone(),
            leases.clone(),
            agents,
            Arc::new(ScriptedDeployer::new()),
            store,
            Arc::new(RecordingSink::new()),
            CycleSettings {
                thresholds: VetoThresholds {
                    ui_score: 70.0,
                    test_pass_rate: 0.8,
                },
                lease_ttl: Duration::from_secs(60),
            },
        ));
        Fixture { hub, leases, runner }
    }

    fn iteration(hub: &Hub) -> u64 {
        hub.get("a").expect("instance").iteration
    }

    #[tokio::test(start_paused = true)]
    async fn active_executor_cycles_on_every_tick() {
        let f = fixture(ScriptedGenerator::healthy());
        let handle = spawn("a", f.hub.clone(), f.runner.clone(), SETTINGS).expect("spawn");
        f.hub
            .claim_executor("a", ExecutorKind::PolicyLoop)
            .expect("claim");

        sleep(Duration::from_secs(150)).await;
        assert_eq!(iteration(&f.hub), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_loop_runs_only_when_woken() {
        let f = fixture(ScriptedGenerator::healthy());
        let handle = spawn("a", f.hub.clone(), f.runner.clone(), SETTINGS).expect("spawn");
        assert!(f.hub.get("a").expect("instance").running);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(iteration(&f.hub), 0);

        handle.wake();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(iteration(&f.hub), 1);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cycle_returns_to_idle_without_iteration() {
        let generator = ScriptedGenerator::healthy();
        generator.push(AgentRole::Coder, ScriptedReply::Hang);
        let f = fixture(generator);
        let handle = spawn("a", f.hub.clone(), f.runner.clone(), SETTINGS).expect("spawn");

        handle.wake();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").phase, CyclePhase::Dispatching);

        assert!(handle.cancel_cycle());
        sleep(Duration::from_secs(1)).await;
        let instance = f.hub.get("a").expect("instance");
        assert_eq!(instance.phase, CyclePhase::Idle);
        assert_eq!(instance.iteration, 0);
        assert!(instance.last_cycle_finished_at.is_some());
        assert!(f.leases.current("a").is_none());
        assert!(!handle.cancel_cycle());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_conflict_backs_off_without_cycling() {
        let f = fixture(ScriptedGenerator::healthy());
        f.leases
            .acquire("a", "someone-else", Duration::from_secs(600), "manual")
            .expect("acquire");
        let handle = spawn("a", f.hub.clone(), f.runner.clone(), SETTINGS).expect("spawn");

        handle.wake();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(iteration(&f.hub), 0);
        assert!(handle.is_alive());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_releases_executor_and_marks_stopped() {
        let f = fixture(ScriptedGenerator::healthy());
        let handle = spawn("a", f.hub.clone(), f.runner.clone(), SETTINGS).expect("spawn");
        f.hub
            .claim_executor("a", ExecutorKind::PolicyLoop)
            .expect("claim");
        assert_eq!(f.hub.active_executor().as_deref(), Some("a"));

        handle.stop().await;
        assert!(!f.hub.get("a").expect("instance").running);
        assert_eq!(f.hub.active_executor(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn spawning_unknown_instance_fails() {
        let f = fixture(ScriptedGenerator::healthy());
        let err = spawn("ghost", f.hub.clone(), f.runner.clone(), SETTINGS)
            .err()
            .expect("unknown instance");
        assert!(matches!(err, HubError::UnknownInstance(_)));
    }
}
