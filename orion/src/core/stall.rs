//! Stall classification and recovery mapping.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::types::{Action, RiskLevel, StallReason};

/// Point-in-time view of an instance, assembled by the supervisor.
#[derive(Debug, Clone)]
pub struct InstanceProbe {
    pub instance_id: String,
    pub running: bool,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub in_executor_conflict: bool,
    /// `Some(true)` when a lease exists and has expired.
    pub lease_expired: Option<bool>,
    pub last_progress_at: Option<Instant>,
    /// Reference point when the instance has never progressed (registration time).
    pub registered_at: Instant,
}

impl InstanceProbe {
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress_at.unwrap_or(self.registered_at))
    }
}

/// Diagnose an instance; `None` means healthy.
///
/// Order: paused, executor conflict, expired lease, elapsed time.
pub fn classify(probe: &InstanceProbe, now: Instant, threshold: Duration) -> Option<StallReason> {
    if probe.paused {
        return Some(StallReason::Paused {
            reason: probe.pause_reason.clone(),
        });
    }
    if probe.in_executor_conflict {
        return Some(StallReason::ExecutorConflict);
    }
    if probe.lease_expired == Some(true) {
        return Some(StallReason::LeaseExpired);
    }
    let elapsed = probe.idle_for(now);
    if elapsed > threshold {
        if !probe.running {
            return Some(StallReason::Unknown);
        }
        return Some(StallReason::NoProgress {
            elapsed_secs: elapsed.as_secs(),
        });
    }
    None
}

/// The command the supervisor submits for a stall, with its risk.
///
/// `Paused` has no recovery: pausing is an operator decision.
pub fn recovery_for(reason: &StallReason) -> Option<(Action, RiskLevel)> {
    match reason {
        StallReason::Paused { .. } => None,
        StallReason::NoProgress { .. } => Some((
            Action::Nudge {
                reason: reason.to_string(),
            },
            RiskLevel::Low,
        )),
        StallReason::LeaseExpired | StallReason::Unknown => Some((
            Action::RestartCycle {
                reason: reason.to_string(),
            },
            RiskLevel::Medium,
        )),
        StallReason::ExecutorConflict => {
            Some((Action::ResolveConflict { keep: None }, RiskLevel::Critical))
        }
    }
}
