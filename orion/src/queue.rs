//! Command queue: idempotency cache, debounce, policy gate, per-target lanes.
//!
//! Every status transition is appended to the audit log. Commands for one
//! target run one at a time on that target's lane task, in submission order
//! (or approval order for `manual_required` commands); lanes for different
//! targets run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::ClockPair;
use crate::core::idempotency;
use crate::core::policy::PolicyGate;
use crate::core::types::{Command, CommandRequest, CommandStatus, Decision};
use crate::error::{CommandError, PersistenceError};
use crate::hub::Hub;
use crate::io::config::QueueConfig;
use crate::io::store::StateStore;

/// Executes dispatched commands. The returned text becomes the outcome.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted {
        request_id: String,
        decision: Decision,
    },
    Deduplicated {
        original_request_id: String,
    },
}

impl SubmitOutcome {
    /// The request id whose result the caller should await.
    pub fn request_id(&self) -> &str {
        match self {
            SubmitOutcome::Accepted { request_id, .. } => request_id,
            SubmitOutcome::Deduplicated {
                original_request_id,
            } => original_request_id,
        }
    }
}

struct Entry {
    command: Command,
    created: Instant,
    status: watch::Sender<CommandStatus>,
}

struct KeyEntry {
    request_id: String,
    accepted_at: Instant,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<String, Entry>,
    order: VecDeque<String>,
    keys: HashMap<String, KeyEntry>,
    signatures: HashMap<String, Instant>,
    lanes: HashMap<String, mpsc::UnboundedSender<String>>,
}

impl QueueState {
    fn insert(&mut self, command: Command, created: Instant) {
        let (status, _) = watch::channel(command.status);
        self.order.push_back(command.request_id.clone());
        self.records.insert(
            command.request_id.clone(),
            Entry {
                command,
                created,
                status,
            },
        );
    }
}

struct Inner {
    config: QueueConfig,
    policy: PolicyGate,
    store: Arc<dyn StateStore>,
    hub: Arc<Hub>,
    handler: Arc<dyn CommandHandler>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<Inner>,
}

impl CommandQueue {
    pub fn new(
        config: QueueConfig,
        policy: PolicyGate,
        store: Arc<dyn StateStore>,
        hub: Arc<Hub>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                store,
                hub,
                handler,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Submit a command. Must be called inside a tokio runtime.
    ///
    /// Order of checks: target, idempotency window, debounce, policy.
    #[instrument(skip_all, fields(instance = %request.target_instance, action = %request.action.name()))]
    pub fn submit(&self, request: CommandRequest) -> Result<SubmitOutcome, CommandError> {
        let inner = &self.inner;
        if !inner.hub.contains(&request.target_instance) {
            return Err(CommandError::UnknownTarget(request.target_instance));
        }
        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| idempotency::derive_key(&request.target_instance, &request.action));
        let signature = idempotency::action_signature(&request.target_instance, &request.action);
        let now = Instant::now();

        let mut state = inner.state.lock();
        let wall = Utc::now();

        let original = state
            .keys
            .get(&key)
            .filter(|seen| now.duration_since(seen.accepted_at) < inner.config.idempotency_window())
            .map(|seen| seen.request_id.clone());
        if let Some(original_request_id) = original {
            let mut audit = Vec::with_capacity(2);
            let mut decision = Decision::AutoApproved;
            if let Some(entry) = state.records.get_mut(&original_request_id) {
                entry.command.duplicates += 1;
                entry.command.updated_at = wall;
                decision = entry.command.decision;
                audit.push(entry.command.clone());
            }
            let duplicate = Command {
                request_id: Uuid::now_v7().to_string(),
                idempotency_key: key,
                target_instance: request.target_instance,
                action: request.action,
                risk_level: request.risk_level,
                status: CommandStatus::SkippedDuplicate,
                decision,
                decision_reason: format!("duplicate of {original_request_id}"),
                requested_by: request.requested_by,
                created_at: wall,
                updated_at: wall,
                outcome: None,
                error: None,
                duplicates: 0,
                resolved_by: None,
            };
            audit.push(duplicate.clone());
            state.insert(duplicate, now);
            drop(state);

            for record in &audit {
                inner.audit(record);
            }
            debug!(original = %original_request_id, "duplicate submission collapsed");
            return Ok(SubmitOutcome::Deduplicated {
                original_request_id,
            });
        }

        if let Some(last) = state.signatures.get(&signature) {
            let elapsed = now.duration_since(*last);
            let debounce = inner.config.debounce();
            if elapsed < debounce {
                debug!(%signature, ?elapsed, "submission debounced");
                return Err(CommandError::Debounced {
                    signature,
                    elapsed,
                    retry_after: debounce - elapsed,
                });
            }
        }

        let verdict = inner.policy.evaluate(&request.action, request.risk_level);
        let request_id = Uuid::now_v7().to_string();
        let denied = verdict.decision == Decision::Denied;
        let command = Command {
            request_id: request_id.clone(),
            idempotency_key: key.clone(),
            target_instance: request.target_instance.clone(),
            action: request.action,
            risk_level: request.risk_level,
            status: if denied {
                CommandStatus::Failed
            } else {
                CommandStatus::Queued
            },
            decision: verdict.decision,
            decision_reason: verdict.reason.clone(),
            requested_by: request.requested_by,
            created_at: wall,
            updated_at: wall,
            outcome: None,
            error: denied.then(|| format!("denied: {}", verdict.reason)),
            duplicates: 0,
            resolved_by: None,
        };
        let target = command.target_instance.clone();
        state.insert(command.clone(), now);
        if !denied {
            state.keys.insert(
                key.clone(),
                KeyEntry {
                    request_id: request_id.clone(),
                    accepted_at: now,
                },
            );
            state.signatures.insert(signature.clone(), now);
        }
        drop(state);

        // The lane only sees the command once its first record is durable.
        if let Err(err) = inner.store.append_command(&command) {
            inner.abandon(&request_id, &key, &signature, now, &err);
            return Err(err.into());
        }
        if denied {
            warn!(request_id = %request_id, reason = %verdict.reason, "command denied");
            return Err(CommandError::Denied {
                request_id,
                reason: verdict.reason,
            });
        }
        if verdict.decision == Decision::AutoApproved {
            let mut state = inner.state.lock();
            inner.enqueue(&mut state, &target, request_id.clone());
        }

        info!(
            request_id = %request_id,
            decision = ?verdict.decision,
            reason = %verdict.reason,
            "command accepted"
        );
        Ok(SubmitOutcome::Accepted {
            request_id,
            decision: verdict.decision,
        })
    }

    /// Approve a `manual_required` command; it joins its lane now.
    #[instrument(skip_all, fields(request_id = %request_id, actor = %actor))]
    pub fn approve(&self, request_id: &str, actor: &str) -> Result<Command, CommandError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let entry = state
            .records
            .get_mut(request_id)
            .ok_or_else(|| CommandError::NotFound(request_id.to_string()))?;
        if !entry.command.is_pending_decision() {
            return Err(CommandError::NotPending(request_id.to_string()));
        }
        entry.command.resolved_by = Some(actor.to_string());
        entry.command.updated_at = Utc::now();
        let command = entry.command.clone();
        inner.enqueue(&mut state, &command.target_instance, request_id.to_string());
        drop(state);

        inner.audit(&command);
        info!(action = %command.action.name(), "command approved");
        Ok(command)
    }

    #[instrument(skip_all, fields(request_id = %request_id, actor = %actor))]
    pub fn reject(&self, request_id: &str, actor: &str, reason: &str) -> Result<Command, CommandError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let entry = state
            .records
            .get_mut(request_id)
            .ok_or_else(|| CommandError::NotFound(request_id.to_string()))?;
        if !entry.command.is_pending_decision() {
            return Err(CommandError::NotPending(request_id.to_string()));
        }
        entry.command.resolved_by = Some(actor.to_string());
        entry.command.status = CommandStatus::Failed;
        entry.command.error = Some(format!("rejected by operator: {reason}"));
        entry.command.updated_at = Utc::now();
        entry.status.send_replace(CommandStatus::Failed);
        let command = entry.command.clone();
        drop(state);

        inner.audit(&command);
        info!(action = %command.action.name(), reason, "command rejected");
        Ok(command)
    }

    pub fn get(&self, request_id: &str) -> Option<Command> {
        self.inner
            .state
            .lock()
            .records
            .get(request_id)
            .map(|entry| entry.command.clone())
    }

    /// Wait until the command reaches a terminal status.
    pub async fn wait(&self, request_id: &str) -> Result<Command, CommandError> {
        let mut rx = {
            let state = self.inner.state.lock();
            let entry = state
                .records
                .get(request_id)
                .ok_or_else(|| CommandError::NotFound(request_id.to_string()))?;
            entry.status.subscribe()
        };
        // A closed channel means the record was pruned; fall through to `get`.
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.get(request_id)
            .ok_or_else(|| CommandError::NotFound(request_id.to_string()))
    }

    pub fn pending_decisions(&self) -> Vec<Command> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|entry| entry.command.is_pending_decision())
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// Commands waiting for or undergoing execution.
    pub fn depth(&self) -> usize {
        self.inner
            .state
            .lock()
            .records
            .values()
            .filter(|entry| {
                !entry.command.status.is_terminal() && !entry.command.is_pending_decision()
            })
            .count()
    }

    /// The most recent `limit` commands, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Command> {
        let state = self.inner.state.lock();
        let skip = state.order.len().saturating_sub(limit);
        state
            .order
            .iter()
            .skip(skip)
            .filter_map(|id| state.records.get(id))
            .map(|entry| entry.command.clone())
            .collect()
    }

    /// Drop expired index entries and terminal records past retention.
    ///
    /// Compacts the audit log when records were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let inner = &self.inner;
        let window = inner.config.idempotency_window();
        let debounce = inner.config.debounce();
        let retention = inner.config.audit_retention();

        let mut state = inner.state.lock();
        state
            .keys
            .retain(|_, seen| now.saturating_duration_since(seen.accepted_at) < window);
        state
            .signatures
            .retain(|_, at| now.saturating_duration_since(*at) < debounce);

        let expired: Vec<String> = state
            .records
            .iter()
            .filter(|(_, entry)| {
                entry.command.status.is_terminal()
                    && now.saturating_duration_since(entry.created) >= retention
            })
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }
        for id in &expired {
            state.records.remove(id);
        }
        let QueueState { order, records, .. } = &mut *state;
        order.retain(|id| records.contains_key(id));
        let remaining: Vec<Command> = order
            .iter()
            .filter_map(|id| records.get(id))
            .map(|entry| entry.command.clone())
            .collect();

        // Rewrite under the queue lock so no transition lands between the
        // snapshot and the rewrite.
        match inner.store.compact_commands(&remaining) {
            Ok(()) => debug!(removed = expired.len(), "pruned command records"),
            Err(err) => warn!(err = %err, "audit log compaction failed"),
        }
        drop(state);
        expired.len()
    }

    /// Close the target's lane. Commands already on it still run.
    pub fn close_lane(&self, target: &str) -> bool {
        let closed = self.inner.state.lock().lanes.remove(target).is_some();
        if closed {
            debug!(instance = target, "command lane released");
        }
        closed
    }

    /// Reload the audit log after a restart.
    ///
    /// Commands awaiting an operator decision stay pending. Anything else
    /// left `queued` or `dispatched` is failed as interrupted. Idempotency
    /// keys and debounce signatures are re-indexed against restored times.
    pub fn restore(&self) -> Result<usize, PersistenceError> {
        let inner = &self.inner;
        let records = inner.store.load_commands()?;
        let clock = ClockPair::now();
        let mut interrupted = Vec::new();

        let mut state = inner.state.lock();
        for mut command in records {
            if state.records.contains_key(&command.request_id) {
                continue;
            }
            let created = clock.to_instant(command.created_at);
            if !command.status.is_terminal() && !command.is_pending_decision() {
                command.status = CommandStatus::Failed;
                command.error = Some("interrupted by restart".to_string());
                command.updated_at = clock.wall;
                interrupted.push(command.clone());
            }
            let indexable = command.decision != Decision::Denied
                && command.status != CommandStatus::SkippedDuplicate;
            if indexable {
                let newer = state
                    .keys
                    .get(&command.idempotency_key)
                    .is_none_or(|seen| seen.accepted_at <= created);
                if newer {
                    state.keys.insert(
                        command.idempotency_key.clone(),
                        KeyEntry {
                            request_id: command.request_id.clone(),
                            accepted_at: created,
                        },
                    );
                }
                let signature =
                    idempotency::action_signature(&command.target_instance, &command.action);
                let at = state.signatures.entry(signature).or_insert(created);
                *at = (*at).max(created);
            }
            state.insert(command, created);
        }
        let restored = state.records.len();
        drop(state);

        for command in &interrupted {
            inner.audit(command);
        }
        if restored > 0 {
            info!(
                restored,
                interrupted = interrupted.len(),
                "restored command queue"
            );
        }
        Ok(restored)
    }
}

impl Inner {
    fn audit(&self, command: &Command) {
        if let Err(err) = self.store.append_command(command) {
            warn!(request_id = %command.request_id, err = %err, "audit append failed");
        }
    }

    /// Fail a submission whose first audit record could not be written.
    fn abandon(
        &self,
        request_id: &str,
        key: &str,
        signature: &str,
        accepted_at: Instant,
        err: &PersistenceError,
    ) {
        let mut state = self.state.lock();
        if state
            .keys
            .get(key)
            .is_some_and(|seen| seen.request_id == request_id)
        {
            state.keys.remove(key);
        }
        if state.signatures.get(signature) == Some(&accepted_at) {
            state.signatures.remove(signature);
        }
        if let Some(entry) = state.records.get_mut(request_id) {
            entry.command.status = CommandStatus::Failed;
            entry.command.error = Some(format!("audit append failed: {err}"));
            entry.command.updated_at = Utc::now();
            entry.status.send_replace(CommandStatus::Failed);
        }
        drop(state);
        warn!(request_id, err = %err, "command abandoned, audit log unavailable");
    }

    fn enqueue(self: &Arc<Self>, state: &mut QueueState, target: &str, request_id: String) {
        let lane = state
            .lanes
            .entry(target.to_string())
            .or_insert_with(|| spawn_lane(Arc::downgrade(self), target));
        if let Err(mpsc::error::SendError(request_id)) = lane.send(request_id) {
            let lane = spawn_lane(Arc::downgrade(self), target);
            if lane.send(request_id).is_err() {
                warn!(instance = target, "command lane unavailable");
            }
            state.lanes.insert(target.to_string(), lane);
        }
    }

    /// Apply a status change and publish it to waiters.
    fn transition(
        &self,
        request_id: &str,
        apply: impl FnOnce(&mut Command) -> bool,
    ) -> Option<Command> {
        let mut state = self.state.lock();
        let entry = state.records.get_mut(request_id)?;
        if !apply(&mut entry.command) {
            return None;
        }
        entry.command.updated_at = Utc::now();
        entry.status.send_replace(entry.command.status);
        let command = entry.command.clone();
        drop(state);
        self.audit(&command);
        Some(command)
    }

    async fn execute(&self, request_id: &str) {
        let Some(command) = self.transition(request_id, |command| {
            if command.status != CommandStatus::Queued {
                return false;
            }
            command.status = CommandStatus::Dispatched;
            true
        }) else {
            return;
        };

        let deadline = self.config.command_deadline();
        let result = tokio::time::timeout(deadline, self.handler.handle(&command)).await;
        let (status, outcome, error) = match result {
            Ok(Ok(outcome)) => (CommandStatus::Succeeded, Some(outcome), None),
            Ok(Err(err)) => (CommandStatus::Failed, None, Some(format!("{err:#}"))),
            Err(_) => (CommandStatus::Failed, None, Some("timeout".to_string())),
        };
        match &error {
            None => info!(
                request_id,
                target = %command.target_instance,
                action = %command.action.name(),
                "command succeeded"
            ),
            Some(error) => warn!(
                request_id,
                target = %command.target_instance,
                action = %command.action.name(),
                %error,
                "command failed"
            ),
        }
        self.transition(request_id, |command| {
            command.status = status;
            command.outcome = outcome;
            command.error = error;
            true
        });
    }
}

fn spawn_lane(inner: Weak<Inner>, target: &str) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let target = target.to_string();
    tokio::spawn(async move {
        while let Some(request_id) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.execute(&request_id).await;
        }
        debug!(instance = %target, "command lane closed");
    });
    tx
}
