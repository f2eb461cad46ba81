//! Operator control surface and runtime assembly.
//!
//! [`Runtime::build`] wires the hub, lease manager, queue, instance driver and
//! supervisor around one [`StateStore`] and one set of [`Adapters`].
//! [`ControlPlane`] is the cloneable handle the CLI and the HTTP server use;
//! pause and resume go through the command queue so they are audited like
//! every other action.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::{AgentToolkit, CapabilityConfig};
use crate::core::lease::{Lease, LeaseGrant};
use crate::core::policy::PolicyGate;
use crate::core::types::{Action, Command, CommandRequest, ExecutorKind, RiskLevel};
use crate::cycle::{AgentSet, CycleRunner, CycleSettings};
use crate::driver::InstanceDriver;
use crate::error::{ControlError, HubError};
use crate::hub::{Hub, HubStatus, InstanceSnapshot, OrchestratorInstance};
use crate::io::config::{InstanceConfig, OrionConfig};
use crate::io::deploy::{CommandDeployer, Deployer};
use crate::io::generate::{CommandGenerator, Generator};
use crate::io::screen::{CommandScreenAction, DisabledScreen, ScreenAction};
use crate::io::sink::DashboardSink;
use crate::io::store::StateStore;
use crate::lease::LeaseManager;
use crate::looping::LoopSettings;
use crate::queue::{CommandQueue, SubmitOutcome};
use crate::supervisor::Supervisor;

/// External collaborators injected into the runtime.
#[derive(Clone)]
pub struct Adapters {
    pub generator: Arc<dyn Generator>,
    pub deployer: Arc<dyn Deployer>,
    pub screen: Arc<dyn ScreenAction>,
    pub sink: Arc<dyn DashboardSink>,
}

impl Adapters {
    /// Process-backed adapters from the `[generator]`, `[deployer]` and
    /// `[screen]` sections. An empty screen command disables screen actions.
    pub fn from_config(config: &OrionConfig, sink: Arc<dyn DashboardSink>) -> Result<Self> {
        let limit = config.cycle.output_limit_bytes;
        let generator = CommandGenerator::new(&config.generator, config.cycle.agent_timeout(), limit)
            .context("configure generator")?;
        let deployer = CommandDeployer::new(&config.deployer, config.cycle.deploy_timeout(), limit)
            .context("configure deployer")?;
        let screen: Arc<dyn ScreenAction> = if config.screen.is_configured() {
            Arc::new(
                CommandScreenAction::new(&config.screen, config.queue.command_deadline(), limit)
                    .context("configure screen")?,
            )
        } else {
            Arc::new(DisabledScreen)
        };
        Ok(Self {
            generator: Arc::new(generator),
            deployer: Arc::new(deployer),
            screen,
            sink,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub hub: HubStatus,
    pub queue_depth: usize,
    pub pending_decisions: Vec<Command>,
}

#[derive(Clone)]
pub struct ControlPlane {
    hub: Arc<Hub>,
    leases: Arc<LeaseManager>,
    queue: CommandQueue,
    driver: Arc<InstanceDriver>,
    lease_ttl: Duration,
}

impl ControlPlane {
    fn require(&self, instance_id: &str) -> Result<(), HubError> {
        if self.hub.contains(instance_id) {
            Ok(())
        } else {
            Err(HubError::UnknownInstance(instance_id.to_string()))
        }
    }

    /// Register an instance. It runs cycles on demand until it is started as
    /// the executor.
    pub fn register_instance(
        &self,
        instance_id: &str,
        display_name: Option<&str>,
    ) -> Result<OrchestratorInstance, ControlError> {
        Ok(self
            .hub
            .register(instance_id, display_name.unwrap_or(instance_id))?)
    }

    /// Stop the instance loop, drop its lease slot, and remove it from the hub.
    pub async fn deregister_instance(
        &self,
        instance_id: &str,
    ) -> Result<OrchestratorInstance, ControlError> {
        self.require(instance_id)?;
        self.driver.stop_loop(instance_id).await;
        self.queue.close_lane(instance_id);
        self.leases.forget(instance_id);
        Ok(self.hub.deregister(instance_id)?)
    }

    pub fn get_status(&self) -> ControlStatus {
        ControlStatus {
            hub: self.hub.status(),
            queue_depth: self.queue.depth(),
            pending_decisions: self.queue.pending_decisions(),
        }
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<InstanceSnapshot> {
        self.hub
            .status()
            .instances
            .into_iter()
            .find(|instance| instance.instance_id == instance_id)
    }

    pub fn submit_command(&self, request: CommandRequest) -> Result<SubmitOutcome, ControlError> {
        Ok(self.queue.submit(request)?)
    }

    pub fn get_command(&self, request_id: &str) -> Option<Command> {
        self.queue.get(request_id)
    }

    pub fn recent_commands(&self, limit: usize) -> Vec<Command> {
        self.queue.recent(limit)
    }

    pub async fn wait_command(&self, request_id: &str) -> Result<Command, ControlError> {
        Ok(self.queue.wait(request_id).await?)
    }

    pub fn approve_command(&self, request_id: &str, actor: &str) -> Result<Command, ControlError> {
        Ok(self.queue.approve(request_id, actor)?)
    }

    pub fn reject_command(
        &self,
        request_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Command, ControlError> {
        Ok(self.queue.reject(request_id, actor, reason)?)
    }

    pub fn pause(
        &self,
        instance_id: &str,
        reason: &str,
        requested_by: &str,
    ) -> Result<SubmitOutcome, ControlError> {
        let action = Action::Pause {
            reason: reason.to_string(),
        };
        self.submit_command(
            CommandRequest::new(instance_id, action, RiskLevel::Medium).requested_by(requested_by),
        )
    }

    pub fn resume(&self, instance_id: &str, requested_by: &str) -> Result<SubmitOutcome, ControlError> {
        self.submit_command(
            CommandRequest::new(instance_id, Action::Resume, RiskLevel::Low).requested_by(requested_by),
        )
    }

    /// Acquire the instance lease for an external holder. `ttl` defaults to
    /// the configured lease ttl.
    pub fn acquire_lease(
        &self,
        instance_id: &str,
        holder_id: &str,
        ttl: Option<Duration>,
        reason: &str,
    ) -> Result<LeaseGrant, ControlError> {
        self.require(instance_id)?;
        let ttl = ttl.unwrap_or(self.lease_ttl);
        Ok(self.leases.acquire(instance_id, holder_id, ttl, reason)?)
    }

    pub fn release_lease(
        &self,
        instance_id: &str,
        holder_id: &str,
        force_if_expired: bool,
        actor_id: &str,
        reason: &str,
    ) -> Result<bool, ControlError> {
        self.require(instance_id)?;
        Ok(self
            .leases
            .release(instance_id, holder_id, force_if_expired, actor_id, reason))
    }

    pub fn heartbeat_lease(&self, instance_id: &str, holder_id: &str) -> Result<Lease, ControlError> {
        self.require(instance_id)?;
        Ok(self.leases.heartbeat(instance_id, holder_id)?)
    }

    /// Drive the instance as the hub's executor (`hub_loop` when started by an operator).
    pub fn start_executor(&self, instance_id: &str, kind: ExecutorKind) -> Result<(), ControlError> {
        Ok(self.driver.start_executor(instance_id, kind)?)
    }

    pub fn stop_executor(&self, instance_id: &str) -> Result<bool, ControlError> {
        self.require(instance_id)?;
        Ok(self.driver.stop_executor(instance_id))
    }
}

/// All long-lived components of one Orion process.
pub struct Runtime {
    control: ControlPlane,
    supervisor: Arc<Supervisor>,
    instances: Vec<InstanceConfig>,
    shutdown: CancellationToken,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Wire every component, restoring hub and supervisor state from `store`.
    pub fn build(config: &OrionConfig, store: Arc<dyn StateStore>, adapters: Adapters) -> Result<Self> {
        config.validate()?;
        let hub = Arc::new(Hub::restore(store.clone()).context("restore instances")?);
        let leases = Arc::new(LeaseManager::new());
        let agents = AgentSet::new(
            adapters.generator,
            Arc::new(AgentToolkit::new()?),
            CapabilityConfig {
                timeout: config.cycle.agent_timeout(),
                retry_backoff: config.cycle.retry_backoff(),
            },
        );
        let runner = Arc::new(CycleRunner::new(
            hub.clone(),
            leases.clone(),
            agents,
            adapters.deployer,
            store.clone(),
            adapters.sink.clone(),
            CycleSettings {
                thresholds: config.cycle.thresholds(),
                lease_ttl: config.lease.ttl(),
            },
        ));
        let driver = Arc::new(InstanceDriver::new(
            hub.clone(),
            leases.clone(),
            runner,
            adapters.screen,
            LoopSettings {
                interval: config.cycle.interval(),
                conflict_backoff: config.lease.conflict_backoff(),
            },
        ));
        let policy = PolicyGate::new(config.policy.clone()).context("compile policy")?;
        let queue = CommandQueue::new(
            config.queue.clone(),
            policy,
            store.clone(),
            hub.clone(),
            driver.clone(),
        );
        let supervisor = Supervisor::restore(
            config.supervisor.clone(),
            hub.clone(),
            leases.clone(),
            queue.clone(),
            store,
            adapters.sink,
        )
        .context("restore supervisor state")?;

        Ok(Self {
            control: ControlPlane {
                hub,
                leases,
                queue,
                driver,
                lease_ttl: config.lease.ttl(),
            },
            supervisor: Arc::new(supervisor),
            instances: config.instances.clone(),
            shutdown: CancellationToken::new(),
            supervisor_task: Mutex::new(None),
        })
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Restore the command queue, start configured instances, and spawn the
    /// supervisor. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let control = &self.control;
        let interrupted = control.queue.restore().context("restore command queue")?;
        if interrupted > 0 {
            warn!(interrupted, "commands interrupted by restart marked failed");
        }

        for instance in &self.instances {
            control
                .hub
                .register(&instance.id, instance.display_name())
                .with_context(|| format!("register instance {}", instance.id))?;
            match instance.executor {
                Some(kind) => match control.driver.start_executor(&instance.id, kind) {
                    Ok(()) => {}
                    Err(err @ HubError::ExecutorConflict { .. }) => {
                        warn!(instance = %instance.id, err = %err, "configured executor stood down");
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("start instance {}", instance.id));
                    }
                },
                None => {
                    control
                        .driver
                        .ensure_loop(&instance.id)
                        .with_context(|| format!("start instance {}", instance.id))?;
                }
            }
        }

        let task = tokio::spawn(self.supervisor.clone().run(self.shutdown.child_token()));
        *self.supervisor_task.lock() = Some(task);
        info!(instances = self.instances.len(), "orion runtime started");
        Ok(())
    }

    /// Stop the supervisor and every instance loop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.supervisor_task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(err = %err, "supervisor task failed");
        }
        self.control.driver.shutdown().await;
        info!("orion runtime stopped");
    }
}
