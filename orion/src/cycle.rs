//! One improvement cycle for one instance.
//!
//! `IDLE -> DISPATCHING -> AGGREGATING -> DECIDING -> (DEPLOYING | SKIPPING | BLOCKED) -> IDLE`
//!
//! Code generation, UI analysis and test generation run as spawned tasks and
//! are joined together; the security review runs afterwards on the generated
//! code. Agent failures become failed sub-results and never abort the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agents::{AgentCapability, AgentInput, AgentToolkit, CapabilityConfig};
use crate::core::progress;
use crate::core::types::{AgentMessage, AgentRole, CyclePhase, DeployOutcome, ProgressClass};
use crate::core::veto::{self, BlockReason, SubResults, Verdict, VetoThresholds};
use crate::error::{CapabilityError, FailureKind, HubError, LeaseError};
use crate::hub::{CycleFinish, CycleTicket, Hub};
use crate::io::cycle_log::CycleRecord;
use crate::io::deploy::{DeployRequest, Deployer};
use crate::io::generate::Generator;
use crate::io::sink::{DashboardSink, DashboardUpdate};
use crate::io::store::StateStore;
use crate::lease::LeaseManager;

/// What a finished cycle produced.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    /// Absent only when the cycle never reached aggregation.
    pub sub_results: Option<SubResults>,
    /// A quality or security gate refused the artifact.
    pub veto: bool,
    pub deploy_outcome: DeployOutcome,
    pub progress_class: ProgressClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    pub artifact_fingerprint: Option<String>,
    pub phase_trace: Vec<CyclePhase>,
}

impl CycleResult {
    fn downgrade(&mut self, reason: BlockReason) {
        self.deploy_outcome = DeployOutcome::Blocked;
        self.progress_class = ProgressClass::Blocked;
        self.block_reason = Some(reason);
        if self.phase_trace.last() != Some(&CyclePhase::Blocked) {
            self.phase_trace.push(CyclePhase::Blocked);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: String,
    pub instance_id: String,
    pub iteration: u64,
    pub result: CycleResult,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Finished(Box<CycleReport>),
    /// The instance is paused; nothing ran and progress is untouched.
    SkippedPaused,
    /// Cancelled during dispatch or aggregation; results were discarded.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// The four agent capabilities a cycle dispatches.
#[derive(Clone)]
pub struct AgentSet {
    coder: AgentCapability,
    ui_reviewer: AgentCapability,
    tester: AgentCapability,
    security_reviewer: AgentCapability,
}

impl AgentSet {
    pub fn new(
        generator: Arc<dyn Generator>,
        toolkit: Arc<AgentToolkit>,
        config: CapabilityConfig,
    ) -> Self {
        let capability = |role| AgentCapability::new(role, generator.clone(), toolkit.clone(), config);
        Self {
            coder: capability(AgentRole::Coder),
            ui_reviewer: capability(AgentRole::UiReviewer),
            tester: capability(AgentRole::Tester),
            security_reviewer: capability(AgentRole::SecurityReviewer),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub thresholds: VetoThresholds,
    pub lease_ttl: Duration,
}

enum Drive {
    Done {
        result: CycleResult,
        deploy_log: Option<String>,
    },
    Cancelled,
}

pub struct CycleRunner {
    hub: Arc<Hub>,
    leases: Arc<LeaseManager>,
    agents: AgentSet,
    deployer: Arc<dyn Deployer>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn DashboardSink>,
    settings: CycleSettings,
}

impl CycleRunner {
    pub fn new(
        hub: Arc<Hub>,
        leases: Arc<LeaseManager>,
        agents: AgentSet,
        deployer: Arc<dyn Deployer>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn DashboardSink>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            hub,
            leases,
            agents,
            deployer,
            store,
            sink,
            settings,
        }
    }

    /// Run one cycle under the instance lease held by `holder_id`.
    ///
    /// A lease conflict is returned to the caller, which should back off.
    #[instrument(skip_all, fields(instance = %instance_id, holder = %holder_id))]
    pub async fn run_cycle(
        &self,
        instance_id: &str,
        holder_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let instance = self
            .hub
            .get(instance_id)
            .ok_or_else(|| HubError::UnknownInstance(instance_id.to_string()))?;
        if instance.paused {
            debug!(reason = ?instance.pause_reason, "instance paused, cycle skipped");
            return Ok(CycleOutcome::SkippedPaused);
        }

        self.leases
            .acquire(instance_id, holder_id, self.settings.lease_ttl, "cycle")?;
        let ticket = match self.hub.cycle_started(instance_id) {
            Ok(ticket) => ticket,
            Err(err) => {
                self.release(instance_id, holder_id);
                return Err(err.into());
            }
        };
        let cycle_id = Uuid::now_v7().to_string();
        let started_wall = Utc::now();
        debug!(cycle_id = %cycle_id, iteration = ticket.iteration, "cycle started");

        let (mut result, deploy_log) = match self.drive(instance_id, holder_id, &ticket, cancel).await {
            Drive::Done { result, deploy_log } => (result, deploy_log),
            Drive::Cancelled => {
                if let Err(err) = self.hub.cycle_cancelled(instance_id) {
                    warn!(err = %err, "cancelled cycle could not be recorded");
                }
                self.release(instance_id, holder_id);
                info!(cycle_id = %cycle_id, "cycle cancelled");
                return Ok(CycleOutcome::Cancelled);
            }
        };

        let mut record = CycleRecord {
            cycle_id: cycle_id.clone(),
            instance_id: instance_id.to_string(),
            iteration: ticket.iteration,
            started_at: started_wall,
            finished_at: Utc::now(),
            duration_ms: ticket.started_at.elapsed().as_millis() as u64,
            result: result.clone(),
            deploy_log,
        };
        if let Err(err) = self.store.write_cycle(&record) {
            warn!(err = %err, "cycle record write failed");
            result.downgrade(BlockReason::Persistence {
                error: err.to_string(),
            });
        }

        let finish = CycleFinish {
            started_at: ticket.started_at,
            dispatched: true,
            outcome: result.deploy_outcome,
            artifact_fingerprint: result.artifact_fingerprint.clone(),
        };
        match self.hub.cycle_finished(instance_id, &finish) {
            Ok(_) => {}
            Err(HubError::Persistence(err)) => {
                result.downgrade(BlockReason::Persistence {
                    error: err.to_string(),
                });
            }
            Err(err) => warn!(err = %err, "cycle finished for an instance the hub no longer knows"),
        }
        self.release(instance_id, holder_id);

        if record.result.deploy_outcome != result.deploy_outcome {
            record.result = result.clone();
            if let Err(err) = self.store.write_cycle(&record) {
                debug!(err = %err, "blocked cycle record not rewritten");
            }
        }
        self.sink.publish(&DashboardUpdate::Cycle(record));

        info!(
            cycle_id = %cycle_id,
            iteration = ticket.iteration,
            outcome = result.deploy_outcome.as_str(),
            reason = ?result.block_reason,
            "cycle finished"
        );
        Ok(CycleOutcome::Finished(Box::new(CycleReport {
            cycle_id,
            instance_id: instance_id.to_string(),
            iteration: ticket.iteration,
            result,
        })))
    }

    async fn drive(
        &self,
        instance_id: &str,
        holder_id: &str,
        ticket: &CycleTicket,
        cancel: &CancellationToken,
    ) -> Drive {
        let mut trace = vec![CyclePhase::Dispatching];
        let input = AgentInput {
            instance_id: instance_id.to_string(),
            iteration: ticket.iteration,
            last_outcome: ticket.last_outcome,
            upstream: None,
        };

        let independent = [
            &self.agents.coder,
            &self.agents.ui_reviewer,
            &self.agents.tester,
        ];
        let roles = independent.map(AgentCapability::role);
        let handles = independent.map(|capability| spawn_agent(capability, &input));
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Drive::Cancelled,
            joined = join_all(handles) => joined,
        };
        let messages: Vec<AgentMessage> = roles
            .into_iter()
            .zip(joined)
            .map(|(role, joined)| collect_message(role, joined))
            .collect();
        let Ok([code, ui, tests]) = <[AgentMessage; 3]>::try_from(messages) else {
            return Drive::Done {
                result: blocked_early(trace, "dispatch returned too few results"),
                deploy_log: None,
            };
        };

        if self.pause_requested(instance_id) {
            debug!("paused during dispatch, results discarded");
            return Drive::Cancelled;
        }
        // Renew so the review phase gets a full ttl of its own.
        if let Err(err) = self.leases.heartbeat(instance_id, holder_id) {
            return Drive::Done {
                result: blocked_early(trace, &format!("lease lost after dispatch: {err}")),
                deploy_log: None,
            };
        }

        self.enter(instance_id, &mut trace, CyclePhase::Aggregating);
        let review_input = AgentInput {
            upstream: Some(code.clone()),
            ..input
        };
        let review = spawn_agent(&self.agents.security_reviewer, &review_input);
        let security = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Drive::Cancelled,
            joined = review => collect_message(AgentRole::SecurityReviewer, joined),
        };

        if self.pause_requested(instance_id) {
            debug!("paused during review, results discarded");
            return Drive::Cancelled;
        }

        self.enter(instance_id, &mut trace, CyclePhase::Deciding);
        let results = SubResults {
            code,
            ui,
            tests,
            security,
        };
        let fingerprint = results.code.artifact().map(progress::fingerprint);
        let verdict = veto::decide(&results, &self.settings.thresholds);

        let mut deploy_log = None;
        let (outcome, block_reason, veto) = match verdict {
            Verdict::Block(reason) => (DeployOutcome::Blocked, Some(reason), true),
            Verdict::Approve { artifact } => {
                let fingerprint = progress::fingerprint(&artifact);
                if let Err(err) = self.leases.heartbeat(instance_id, holder_id) {
                    let reason = BlockReason::Internal {
                        error: format!("lease lost before deploy: {err}"),
                    };
                    (DeployOutcome::Blocked, Some(reason), false)
                } else if ticket.last_deploy_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                    self.enter(instance_id, &mut trace, CyclePhase::Skipping);
                    debug!(fingerprint = %fingerprint, "artifact unchanged, deploy skipped");
                    (DeployOutcome::SkippedUnchanged, None, false)
                } else {
                    self.enter(instance_id, &mut trace, CyclePhase::Deploying);
                    let request = DeployRequest {
                        instance_id: instance_id.to_string(),
                        iteration: ticket.iteration,
                        artifact,
                        fingerprint,
                    };
                    match self.deployer.deploy(&request).await {
                        Ok(receipt) if receipt.succeeded() => {
                            deploy_log = Some(receipt.log);
                            (DeployOutcome::Deployed, None, false)
                        }
                        Ok(receipt) => {
                            let reason = BlockReason::DeployFailed {
                                error: format!("deploy ended {:?}", receipt.status),
                            };
                            deploy_log = Some(receipt.log);
                            (DeployOutcome::Blocked, Some(reason), false)
                        }
                        Err(err) => {
                            let reason = BlockReason::DeployFailed {
                                error: format!("{err:#}"),
                            };
                            (DeployOutcome::Blocked, Some(reason), false)
                        }
                    }
                }
            }
        };
        if outcome == DeployOutcome::Blocked {
            self.enter(instance_id, &mut trace, CyclePhase::Blocked);
        }

        Drive::Done {
            result: CycleResult {
                sub_results: Some(results),
                veto,
                deploy_outcome: outcome,
                progress_class: progress::classify(outcome),
                block_reason,
                artifact_fingerprint: fingerprint,
                phase_trace: trace,
            },
            deploy_log,
        }
    }

    fn enter(&self, instance_id: &str, trace: &mut Vec<CyclePhase>, phase: CyclePhase) {
        trace.push(phase);
        self.hub.set_phase(instance_id, phase);
    }

    fn pause_requested(&self, instance_id: &str) -> bool {
        self.hub.get(instance_id).is_some_and(|instance| instance.paused)
    }

    fn release(&self, instance_id: &str, holder_id: &str) {
        self.leases
            .release(instance_id, holder_id, false, holder_id, "cycle finished");
    }
}

fn spawn_agent(capability: &AgentCapability, input: &AgentInput) -> JoinHandle<AgentMessage> {
    let capability = capability.clone();
    let input = input.clone();
    tokio::spawn(async move { capability.run(&input).await })
}

/// A panicked agent task becomes a failed sub-result like any other failure.
fn collect_message(role: AgentRole, joined: Result<AgentMessage, tokio::task::JoinError>) -> AgentMessage {
    joined.unwrap_or_else(|err| {
        warn!(role = %role, err = %err, "agent task failed");
        AgentMessage::failure(CapabilityError {
            role,
            kind: FailureKind::Backend,
            message: format!("agent task failed: {err}"),
            attempts: 1,
        })
    })
}

fn blocked_early(mut trace: Vec<CyclePhase>, error: &str) -> CycleResult {
    trace.push(CyclePhase::Blocked);
    CycleResult {
        sub_results: None,
        veto: false,
        deploy_outcome: DeployOutcome::Blocked,
        progress_class: ProgressClass::Blocked,
        block_reason: Some(BlockReason::Internal {
            error: error.to_string(),
        }),
        artifact_fingerprint: None,
        phase_trace: trace,
    }
}
