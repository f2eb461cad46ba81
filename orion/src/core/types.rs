//! Shared deterministic types for the supervision loop.
//!
//! These types define stable contracts between the cycle, the command queue,
//! and the supervisor. They carry no I/O and serialize to stable snake_case
//! names so audit logs and snapshots remain readable across versions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CapabilityError;

/// Risk classification attached to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a command: `queued -> dispatched -> succeeded | failed`.
///
/// `SkippedDuplicate` is only ever recorded for submissions that collapsed
/// onto an earlier command with the same idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Dispatched,
    Succeeded,
    Failed,
    SkippedDuplicate,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Succeeded | CommandStatus::Failed | CommandStatus::SkippedDuplicate
        )
    }

    /// Position in the one-way `queued -> dispatched -> terminal` progression.
    fn stage(self) -> u8 {
        match self {
            CommandStatus::Queued => 0,
            CommandStatus::Dispatched => 1,
            _ => 2,
        }
    }
}

/// Policy outcome for a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoApproved,
    ManualRequired,
    Denied,
}

/// How a cycle ended with respect to deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed,
    SkippedUnchanged,
    Blocked,
}

impl DeployOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployOutcome::Deployed => "deployed",
            DeployOutcome::SkippedUnchanged => "skipped_unchanged",
            DeployOutcome::Blocked => "blocked",
        }
    }
}

/// Whether a cycle counts as forward progress.
///
/// Only `Forward` may advance an instance's `last_progress_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressClass {
    Forward,
    Unchanged,
    Blocked,
}

/// Cycle state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Dispatching,
    Aggregating,
    Deciding,
    Deploying,
    Skipping,
    Blocked,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Dispatching => "dispatching",
            CyclePhase::Aggregating => "aggregating",
            CyclePhase::Deciding => "deciding",
            CyclePhase::Deploying => "deploying",
            CyclePhase::Skipping => "skipping",
            CyclePhase::Blocked => "blocked",
        }
    }
}

/// The two ways an instance can drive the improvement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Background loop driven by the instance's own interval policy.
    #[default]
    PolicyLoop,
    /// Loop driven by the hub on behalf of an operator.
    HubLoop,
}

/// Supervisor diagnosis of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StallReason {
    NoProgress { elapsed_secs: u64 },
    Paused { reason: Option<String> },
    ExecutorConflict,
    LeaseExpired,
    Unknown,
}

impl StallReason {
    pub fn class(&self) -> StallClass {
        match self {
            StallReason::NoProgress { .. } => StallClass::NoProgress,
            StallReason::Paused { .. } => StallClass::Paused,
            StallReason::ExecutorConflict => StallClass::ExecutorConflict,
            StallReason::LeaseExpired => StallClass::LeaseExpired,
            StallReason::Unknown => StallClass::Unknown,
        }
    }
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::NoProgress { elapsed_secs } => write!(f, "no_progress({elapsed_secs}s)"),
            StallReason::Paused { reason } => {
                write!(f, "paused({})", reason.as_deref().unwrap_or("unspecified"))
            }
            StallReason::ExecutorConflict => f.write_str("executor_conflict"),
            StallReason::LeaseExpired => f.write_str("lease_expired"),
            StallReason::Unknown => f.write_str("unknown"),
        }
    }
}

/// Field-less stall classification, used to key cooldowns and circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallClass {
    NoProgress,
    Paused,
    ExecutorConflict,
    LeaseExpired,
    Unknown,
}

impl StallClass {
    pub fn as_str(self) -> &'static str {
        match self {
            StallClass::NoProgress => "no_progress",
            StallClass::Paused => "paused",
            StallClass::ExecutorConflict => "executor_conflict",
            StallClass::LeaseExpired => "lease_expired",
            StallClass::Unknown => "unknown",
        }
    }
}

/// Role an agent capability plays within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coder,
    UiReviewer,
    SecurityReviewer,
    Tester,
    Deployer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Coder => "coder",
            AgentRole::UiReviewer => "ui_reviewer",
            AgentRole::SecurityReviewer => "security_reviewer",
            AgentRole::Tester => "tester",
            AgentRole::Deployer => "deployer",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message exchanged between agents inside a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: AgentRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<AgentRole>,
    pub body: MessageBody,
}

/// Closed set of payloads an agent can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Code {
        artifact: String,
    },
    SecurityReview {
        veto: bool,
        findings: Vec<String>,
    },
    UiScore {
        score: f64,
        notes: String,
    },
    TestReport {
        passed: u32,
        total: u32,
    },
    Failure(CapabilityError),
}

impl AgentMessage {
    pub fn new(from: AgentRole, body: MessageBody) -> Self {
        Self {
            from,
            to: None,
            body,
        }
    }

    pub fn failure(error: CapabilityError) -> Self {
        Self::new(error.role, MessageBody::Failure(error))
    }

    /// Address the message to a downstream role.
    pub fn to(mut self, role: AgentRole) -> Self {
        self.to = Some(role);
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.body, MessageBody::Failure(_))
    }

    /// The generated artifact, when this is a successful code message.
    pub fn artifact(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Code { artifact } => Some(artifact),
            _ => None,
        }
    }
}

/// Command payloads accepted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Wake the instance so it runs a cycle now.
    Nudge { reason: String },
    /// Cancel any in-flight cycle, drop an expired lease, and start over.
    RestartCycle { reason: String },
    Pause { reason: String },
    Resume,
    /// Opaque external automation (browser/computer control).
    Screen {
        name: String,
        #[serde(default)]
        args: Value,
    },
    /// Operator resolution of an executor conflict.
    ResolveConflict {
        #[serde(default)]
        keep: Option<String>,
    },
    /// Operator acknowledgement of an opened recovery circuit.
    Escalate { class: StallClass, detail: String },
}

impl Action {
    /// Stable action name used by policy rules and debounce signatures.
    pub fn name(&self) -> String {
        match self {
            Action::Nudge { .. } => "nudge".to_string(),
            Action::RestartCycle { .. } => "restart_cycle".to_string(),
            Action::Pause { .. } => "pause".to_string(),
            Action::Resume => "resume".to_string(),
            Action::Screen { name, .. } => format!("screen.{name}"),
            Action::ResolveConflict { .. } => "resolve_conflict".to_string(),
            Action::Escalate { .. } => "escalate".to_string(),
        }
    }

    /// Action arguments without the `kind` tag.
    pub fn args(&self) -> Value {
        match serde_json::to_value(self).unwrap_or_default() {
            Value::Object(mut map) => {
                map.remove("kind");
                Value::Object(map)
            }
            other => other,
        }
    }

    /// Flattened text used for deny-pattern matching.
    pub fn describe(&self) -> String {
        format!("{} {}", self.name(), self.args())
    }
}

/// Default requester recorded for commands submitted without one.
pub const OPERATOR: &str = "operator";

fn default_requester() -> String {
    OPERATOR.to_string()
}

/// A command as submitted to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub target_instance: String,
    pub action: Action,
    pub risk_level: RiskLevel,
    /// Derived from the target and action when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_requester")]
    pub requested_by: String,
}

impl CommandRequest {
    pub fn new(target_instance: impl Into<String>, action: Action, risk_level: RiskLevel) -> Self {
        Self {
            target_instance: target_instance.into(),
            action,
            risk_level,
            idempotency_key: None,
            requested_by: default_requester(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn requested_by(mut self, requester: impl Into<String>) -> Self {
        self.requested_by = requester.into();
        self
    }
}

/// Audited command record. One line per status transition in `commands.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: String,
    pub idempotency_key: String,
    pub target_instance: String,
    pub action: Action,
    pub risk_level: RiskLevel,
    pub status: CommandStatus,
    pub decision: Decision,
    pub decision_reason: String,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duplicates: u32,
    /// Operator who approved or rejected a `manual_required` command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Command {
    /// Waiting in `queued` for an operator decision.
    pub fn is_pending_decision(&self) -> bool {
        self.status == CommandStatus::Queued
            && self.decision == Decision::ManualRequired
            && self.resolved_by.is_none()
    }

    /// Whether this record of a command should replace `earlier` when the
    /// audit log is replayed. Appends can land out of order, so status never
    /// moves backwards and ties go to the later update.
    pub fn supersedes(&self, earlier: &Command) -> bool {
        match self.status.stage().cmp(&earlier.status.stage()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.updated_at >= earlier.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn action_args_drop_kind_tag() {
        let action = Action::Screen {
            name: "open_url".to_string(),
            args: serde_json::json!({"url": "https://example.com"}),
        };
        assert_eq!(action.name(), "screen.open_url");
        let args = action.args();
        assert!(args.get("kind").is_none());
        assert_eq!(args["args"]["url"], "https://example.com");
    }

    #[test]
    fn action_round_trips_through_tagged_json() {
        let raw = r#"{"kind":"nudge","reason":"no_progress"}"#;
        let action: Action = serde_json::from_str(raw).expect("parse");
        assert_eq!(
            action,
            Action::Nudge {
                reason: "no_progress".to_string()
            }
        );
    }

    #[test]
    fn stall_reason_display_is_compact() {
        assert_eq!(
            StallReason::NoProgress { elapsed_secs: 42 }.to_string(),
            "no_progress(42s)"
        );
        assert_eq!(StallReason::Paused { reason: None }.to_string(), "paused(unspecified)");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CommandStatus::Queued.is_terminal());
        assert!(!CommandStatus::Dispatched.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::SkippedDuplicate.is_terminal());
    }
}
