//! Progress accounting for finished cycles.

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::core::types::{DeployOutcome, ProgressClass};

/// Content fingerprint of a generated artifact.
pub fn fingerprint(artifact: &str) -> String {
    hex::encode(Sha256::digest(artifact.as_bytes()))
}

pub fn classify(outcome: DeployOutcome) -> ProgressClass {
    match outcome {
        DeployOutcome::Deployed => ProgressClass::Forward,
        DeployOutcome::SkippedUnchanged => ProgressClass::Unchanged,
        DeployOutcome::Blocked => ProgressClass::Blocked,
    }
}

/// New `last_progress_at` after a cycle that began at `cycle_started`.
///
/// Only a dispatched, forward cycle moves the timestamp, and it never moves
/// backwards even if cycles finish out of start order.
pub fn advance(
    current: Option<Instant>,
    cycle_started: Instant,
    dispatched: bool,
    class: ProgressClass,
) -> Option<Instant> {
    if !dispatched || class != ProgressClass::Forward {
        return current;
    }
    match current {
        Some(existing) => Some(existing.max(cycle_started)),
        None => Some(cycle_started),
    }
}
