//! Applies queued commands to instances and their loops.
//!
//! The driver is the only [`CommandHandler`] wired into the queue, so every
//! recovery, pause and screen action passes through the audited path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::core::types::{Action, Command, ExecutorKind};
use crate::cycle::CycleRunner;
use crate::error::HubError;
use crate::hub::Hub;
use crate::io::screen::ScreenAction;
use crate::lease::LeaseManager;
use crate::looping::{self, LoopHandle, LoopSettings};
use crate::queue::CommandHandler;

pub struct InstanceDriver {
    hub: Arc<Hub>,
    leases: Arc<LeaseManager>,
    runner: Arc<CycleRunner>,
    screen: Arc<dyn ScreenAction>,
    settings: LoopSettings,
    loops: Mutex<HashMap<String, LoopHandle>>,
}

impl InstanceDriver {
    pub fn new(
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        runner: Arc<CycleRunner>,
        screen: Arc<dyn ScreenAction>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            hub,
            leases,
            runner,
            screen,
            settings,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Start the instance loop unless one is alive. Returns `true` when a
    /// new loop was spawned.
    pub fn ensure_loop(&self, instance_id: &str) -> Result<bool, HubError> {
        let mut loops = self.loops.lock();
        if loops.get(instance_id).is_some_and(LoopHandle::is_alive) {
            return Ok(false);
        }
        let handle = looping::spawn(
            instance_id,
            self.hub.clone(),
            self.runner.clone(),
            self.settings,
        )?;
        loops.insert(instance_id.to_string(), handle);
        Ok(true)
    }

    pub fn is_loop_alive(&self, instance_id: &str) -> bool {
        self.loops
            .lock()
            .get(instance_id)
            .is_some_and(LoopHandle::is_alive)
    }

    /// Ensure the loop exists and ask it for a cycle.
    fn wake(&self, instance_id: &str) -> Result<bool, HubError> {
        let started = self.ensure_loop(instance_id)?;
        if let Some(handle) = self.loops.lock().get(instance_id) {
            handle.wake();
        }
        Ok(started)
    }

    fn wake_if_alive(&self, instance_id: &str) {
        if let Some(handle) = self
            .loops
            .lock()
            .get(instance_id)
            .filter(|handle| handle.is_alive())
        {
            handle.wake();
        }
    }

    /// Run the instance loop as the hub's executor.
    ///
    /// On a conflict the loop keeps running on demand and the error is
    /// returned; the conflict stays recorded on the hub until resolved.
    pub fn start_executor(&self, instance_id: &str, kind: ExecutorKind) -> Result<(), HubError> {
        self.ensure_loop(instance_id)?;
        self.hub.claim_executor(instance_id, kind)?;
        self.wake_if_alive(instance_id);
        Ok(())
    }

    /// Give up the executor slot. The loop keeps serving on-demand cycles.
    pub fn stop_executor(&self, instance_id: &str) -> bool {
        self.hub.release_executor(instance_id)
    }

    /// Stop one instance loop and wait for it.
    pub async fn stop_loop(&self, instance_id: &str) {
        let handle = self.loops.lock().remove(instance_id);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Stop every loop.
    pub async fn shutdown(&self) {
        let handles: Vec<LoopHandle> = self.loops.lock().drain().map(|(_, handle)| handle).collect();
        debug!(loops = handles.len(), "stopping instance loops");
        join_all(handles.into_iter().map(LoopHandle::stop)).await;
    }
}

#[async_trait]
impl CommandHandler for InstanceDriver {
    #[instrument(skip_all, fields(
        instance = %command.target_instance,
        action = %command.action.name(),
        request_id = %command.request_id,
    ))]
    async fn handle(&self, command: &Command) -> Result<String> {
        let instance_id = command.target_instance.as_str();
        match &command.action {
            Action::Nudge { reason } => {
                let started = self.wake(instance_id)?;
                info!(reason = %reason, started, "instance nudged");
                Ok(if started {
                    "loop started and woken".to_string()
                } else {
                    "woken".to_string()
                })
            }
            Action::RestartCycle { reason } => {
                let cancelled = self
                    .loops
                    .lock()
                    .get(instance_id)
                    .is_some_and(LoopHandle::cancel_cycle);
                let released = self.leases.release(
                    instance_id,
                    &command.requested_by,
                    true,
                    &command.requested_by,
                    reason,
                );
                let started = self.wake(instance_id)?;
                info!(reason = %reason, cancelled, released, started, "cycle restarted");
                Ok(format!(
                    "restarted (cycle_cancelled={cancelled}, expired_lease_released={released}, loop_started={started})"
                ))
            }
            Action::Pause { reason } => {
                self.hub.set_paused(instance_id, true, Some(reason.clone()))?;
                let cancelled = self
                    .loops
                    .lock()
                    .get(instance_id)
                    .is_some_and(LoopHandle::cancel_cycle);
                info!(reason = %reason, cancelled, "instance paused");
                Ok(if cancelled {
                    "paused; in-flight cycle cancelled".to_string()
                } else {
                    "paused".to_string()
                })
            }
            Action::Resume => {
                self.hub.set_paused(instance_id, false, None)?;
                self.wake_if_alive(instance_id);
                Ok("resumed".to_string())
            }
            Action::Screen { name, args } => self.screen.perform(name, args).await,
            Action::ResolveConflict { keep } => {
                let resolution = self.hub.resolve_conflict(keep.as_deref())?;
                if let Some(kept) = &resolution.kept {
                    self.wake_if_alive(kept);
                }
                Ok(format!(
                    "kept {}; stood down [{}]",
                    resolution.kept.as_deref().unwrap_or("none"),
                    resolution.stood_down.join(", ")
                ))
            }
            Action::Escalate { class, detail } => {
                info!(class = class.as_str(), detail = %detail, "escalation acknowledged");
                Ok(format!("acknowledged {} escalation", class.as_str()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tokio::time::sleep;

    use super::*;
    use crate::agents::{AgentToolkit, CapabilityConfig};
    use crate::core::types::{AgentRole, CommandStatus, CyclePhase, Decision, RiskLevel, StallClass};
    use crate::core::veto::VetoThresholds;
    use crate::cycle::{AgentSet, CycleSettings};
    use crate::io::store::MemoryStore;
    use crate::test_support::{
        RecordingScreen, RecordingSink, ScriptedDeployer, ScriptedGenerator, ScriptedReply,
    };

    struct Fixture {
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        screen: Arc<RecordingScreen>,
        driver: InstanceDriver,
    }

    fn fixture(generator: ScriptedGenerator) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(store.clone()));
        hub.register("a", "A").expect("register");
        hub.register("b", "B").expect("register");
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
        let screen = Arc::new(RecordingScreen::new());
        let driver = InstanceDriver::new(
            hub.clone(),
            leases.clone(),
            runner,
            screen.clone(),
            LoopSettings {
                interval: Duration::from_secs(60),
                conflict_backoff: Duration::from_secs(5),
            },
        );
        Fixture {
            hub,
            leases,
            screen,
            driver,
        }
    }

    fn command(target: &str, action: Action) -> Command {
        let now = Utc::now();
        Command {
            request_id: "req".to_string(),
            idempotency_key: "key".to_string(),
            target_instance: target.to_string(),
            action,
            risk_level: RiskLevel::Low,
            status: CommandStatus::Dispatched,
            decision: Decision::AutoApproved,
            decision_reason: "test".to_string(),
            requested_by: "guardian".to_string(),
            created_at: now,
            updated_at: now,
            outcome: None,
            error: None,
            duplicates: 0,
            resolved_by: None,
        }
    }

    fn nudge() -> Action {
        Action::Nudge {
            reason: "no_progress".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_starts_a_stopped_instance_and_runs_a_cycle() {
        let f = fixture(ScriptedGenerator::healthy());
        assert!(!f.driver.is_loop_alive("a"));

        let outcome = f.driver.handle(&command("a", nudge())).await.expect("nudge");
        assert_eq!(outcome, "loop started and woken");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").iteration, 1);

        let outcome = f.driver.handle(&command("a", nudge())).await.expect("nudge");
        assert_eq!(outcome, "woken");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").iteration, 2);
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_hung_cycle_and_drops_expired_lease() {
        let generator = ScriptedGenerator::healthy();
        generator.push(AgentRole::Coder, ScriptedReply::Hang);
        let f = fixture(generator);
        f.driver.handle(&command("a", nudge())).await.expect("nudge");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").iteration, 0);

        // The hung cycle's lease has outlived its ttl.
        sleep(Duration::from_secs(120)).await;
        let restart = Action::RestartCycle {
            reason: "lease_expired".to_string(),
        };
        let outcome = f.driver.handle(&command("a", restart)).await.expect("restart");
        assert!(outcome.contains("cycle_cancelled=true"), "{outcome}");

        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").iteration, 1);
        assert!(f.leases.current("a").is_none());
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_never_evicts_a_live_foreign_lease() {
        let f = fixture(ScriptedGenerator::healthy());
        f.leases
            .acquire("b", "operator-session", Duration::from_secs(600), "manual")
            .expect("acquire");
        let restart = Action::RestartCycle {
            reason: "unknown".to_string(),
        };
        let outcome = f.driver.handle(&command("b", restart)).await.expect("restart");
        assert!(outcome.contains("expired_lease_released=false"), "{outcome}");
        assert_eq!(
            f.leases.current("b").expect("lease").holder_id,
            "operator-session"
        );
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_toggle_the_instance() {
        let f = fixture(ScriptedGenerator::healthy());
        let pause = Action::Pause {
            reason: "maintenance".to_string(),
        };
        f.driver.handle(&command("a", pause)).await.expect("pause");
        let instance = f.hub.get("a").expect("instance");
        assert!(instance.paused);
        assert_eq!(instance.pause_reason.as_deref(), Some("maintenance"));

        f.driver.handle(&command("a", nudge())).await.expect("nudge");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").iteration, 0);

        f.driver.handle(&command("a", Action::Resume)).await.expect("resume");
        sleep(Duration::from_secs(1)).await;
        let instance = f.hub.get("a").expect("instance");
        assert!(!instance.paused);
        assert_eq!(instance.iteration, 1);
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_cancels_the_cycle_in_flight() {
        let generator = ScriptedGenerator::healthy();
        generator.push(AgentRole::Coder, ScriptedReply::Hang);
        let f = fixture(generator);
        f.driver.handle(&command("a", nudge())).await.expect("nudge");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(f.hub.get("a").expect("instance").phase, CyclePhase::Dispatching);

        let pause = Action::Pause {
            reason: "maintenance".to_string(),
        };
        let outcome = f.driver.handle(&command("a", pause)).await.expect("pause");
        assert_eq!(outcome, "paused; in-flight cycle cancelled");

        sleep(Duration::from_secs(30)).await;
        let instance = f.hub.get("a").expect("instance");
        assert!(instance.paused);
        assert_eq!(instance.phase, CyclePhase::Idle);
        assert_eq!(instance.iteration, 0);
        assert!(instance.last_progress_at.is_none());
        assert!(f.leases.current("a").is_none());
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn screen_actions_reach_the_adapter() {
        let f = fixture(ScriptedGenerator::healthy());
        let action = Action::Screen {
            name: "open_url".to_string(),
            args: json!({"url": "https://example.com"}),
        };
        let outcome = f.driver.handle(&command("a", action)).await.expect("screen");
        assert_eq!(outcome, "performed open_url");
        assert_eq!(f.screen.calls()[0].0, "open_url");
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_conflict_hands_the_slot_to_the_kept_instance() {
        let f = fixture(ScriptedGenerator::healthy());
        f.driver
            .start_executor("a", ExecutorKind::PolicyLoop)
            .expect("first executor");
        let err = f
            .driver
            .start_executor("b", ExecutorKind::HubLoop)
            .expect_err("second executor");
        assert!(matches!(err, HubError::ExecutorConflict { .. }));
        assert!(f.driver.is_loop_alive("b"));
        assert!(f.hub.executor_conflict());

        let resolve = Action::ResolveConflict {
            keep: Some("b".to_string()),
        };
        let outcome = f.driver.handle(&command("b", resolve)).await.expect("resolve");
        assert_eq!(outcome, "kept b; stood down [a]");
        assert!(!f.hub.executor_conflict());
        assert_eq!(f.hub.active_executor().as_deref(), Some("b"));
        f.driver.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn escalations_are_acknowledged() {
        let f = fixture(ScriptedGenerator::healthy());
        let action = Action::Escalate {
            class: StallClass::NoProgress,
            detail: "3 failed recoveries".to_string(),
        };
        let outcome = f.driver.handle(&command("a", action)).await.expect("escalate");
        assert_eq!(outcome, "acknowledged no_progress escalation");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_instance_is_an_error() {
        let f = fixture(ScriptedGenerator::healthy());
        assert!(f.driver.handle(&command("ghost", nudge())).await.is_err());
    }
}
