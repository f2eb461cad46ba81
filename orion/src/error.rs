//! Error taxonomy for the supervision loop.
//!
//! Each component returns its own error enum so callers can tell retryable
//! conditions (lease conflicts, debounced commands) from terminal ones
//! (denied commands, executor conflicts). Binary entry points wrap these in
//! `anyhow` the same way the rest of the I/O layer does.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::AgentRole;

/// Classified failure kinds for agent capability calls.
///
/// The supervisor's circuit breaker and the cycle's retry rule both key off
/// these, so backends must map their failures onto them precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    Auth,
    Quota,
    Backend,
    InvalidOutput,
    MissingInput,
}

impl FailureKind {
    /// Transient failures that earn a single retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Auth => "auth",
            FailureKind::Quota => "quota",
            FailureKind::Backend => "backend",
            FailureKind::InvalidOutput => "invalid_output",
            FailureKind::MissingInput => "missing_input",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent call that failed after its retry budget was spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{role} failed after {attempts} attempt(s): {kind}: {message}")]
pub struct CapabilityError {
    pub role: AgentRole,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Another holder owns a live lease. Retryable after backoff.
    #[error("lease for {instance_id} is held by {holder_id} for another {remaining:?}")]
    Conflict {
        instance_id: String,
        holder_id: String,
        remaining: Duration,
    },
    #[error("lease for {instance_id} expired")]
    Expired { instance_id: String },
    #[error("lease for {instance_id} is not held by {holder_id}")]
    NotHeld {
        instance_id: String,
        holder_id: String,
    },
}

impl LeaseError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Conflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Injected by in-memory fakes.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// Hard-deny policy match. Terminal; never retried.
    #[error("command denied: {reason}")]
    Denied { request_id: String, reason: String },
    #[error("command debounced: {signature} fired {elapsed:?} ago, retry after {retry_after:?}")]
    Debounced {
        signature: String,
        elapsed: Duration,
        retry_after: Duration,
    },
    #[error("unknown target instance {0}")]
    UnknownTarget(String),
    #[error("unknown command {0}")]
    NotFound(String),
    #[error("command {0} is not awaiting approval")]
    NotPending(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    /// A second active executor was refused. Critical; escalated.
    #[error("executor conflict: {active} is already the active executor, {rejected} must stand down")]
    ExecutorConflict { active: String, rejected: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors surfaced by the control plane to its HTTP and CLI callers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Command(#[from] CommandError),
}
