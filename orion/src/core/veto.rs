//! Deployment veto rules.
//!
//! Gates are evaluated in a fixed priority order: security, UI quality, test
//! pass rate, artifact presence. The first failing gate is the recorded block
//! reason even when later gates would also fail.

use serde::{Deserialize, Serialize};

use crate::core::types::{AgentMessage, MessageBody};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VetoThresholds {
    /// Minimum UI score (0–100) required to deploy.
    pub ui_score: f64,
    /// Minimum fraction of passing tests (0.0–1.0) required to deploy.
    pub test_pass_rate: f64,
}

/// Why a cycle did not deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    SecurityVeto { findings: Vec<String> },
    SecurityUnverified { error: String },
    UiBelowThreshold { score: f64, threshold: f64 },
    UiUnavailable { error: String },
    TestsBelowThreshold { pass_rate: f64, threshold: f64 },
    TestsUnavailable { error: String },
    MissingArtifact { error: String },
    DeployFailed { error: String },
    Persistence { error: String },
    Internal { error: String },
}

impl BlockReason {
    pub fn is_veto(&self) -> bool {
        matches!(self, BlockReason::SecurityVeto { .. })
    }
}

/// Outcome of the deciding phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approve { artifact: String },
    Block(BlockReason),
}

/// Sub-results gathered during dispatch and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResults {
    pub code: AgentMessage,
    pub ui: AgentMessage,
    pub tests: AgentMessage,
    pub security: AgentMessage,
}

impl SubResults {
    pub fn messages(&self) -> [&AgentMessage; 4] {
        [&self.code, &self.ui, &self.tests, &self.security]
    }
}

pub fn decide(results: &SubResults, thresholds: &VetoThresholds) -> Verdict {
    match &results.security.body {
        MessageBody::SecurityReview { veto: true, findings } => {
            return Verdict::Block(BlockReason::SecurityVeto {
                findings: findings.clone(),
            });
        }
        MessageBody::SecurityReview { veto: false, .. } => {}
        other => {
            return Verdict::Block(BlockReason::SecurityUnverified {
                error: unavailable(other),
            });
        }
    }

    match &results.ui.body {
        MessageBody::UiScore { score, .. } if *score < thresholds.ui_score => {
            return Verdict::Block(BlockReason::UiBelowThreshold {
                score: *score,
                threshold: thresholds.ui_score,
            });
        }
        MessageBody::UiScore { .. } => {}
        other => {
            return Verdict::Block(BlockReason::UiUnavailable {
                error: unavailable(other),
            });
        }
    }

    match &results.tests.body {
        MessageBody::TestReport { total: 0, .. } => {
            return Verdict::Block(BlockReason::TestsUnavailable {
                error: "no tests reported".to_string(),
            });
        }
        MessageBody::TestReport { passed, total } => {
            let pass_rate = f64::from(*passed) / f64::from(*total);
            if pass_rate < thresholds.test_pass_rate {
                return Verdict::Block(BlockReason::TestsBelowThreshold {
                    pass_rate,
                    threshold: thresholds.test_pass_rate,
                });
            }
        }
        other => {
            return Verdict::Block(BlockReason::TestsUnavailable {
                error: unavailable(other),
            });
        }
    }

    match results.code.artifact() {
        Some(artifact) if !artifact.trim().is_empty() => Verdict::Approve {
            artifact: artifact.to_string(),
        },
        Some(_) => Verdict::Block(BlockReason::MissingArtifact {
            error: "generated artifact is empty".to_string(),
        }),
        None => Verdict::Block(BlockReason::MissingArtifact {
            error: unavailable(&results.code.body),
        }),
    }
}

fn unavailable(body: &MessageBody) -> String {
    match body {
        MessageBody::Failure(err) => err.to_string(),
        other => format!("unexpected message {}", body_kind(other)),
    }
}

fn body_kind(body: &MessageBody) -> &'static str {
    match body {
        MessageBody::Code { .. } => "code",
        MessageBody::SecurityReview { .. } => "security_review",
        MessageBody::UiScore { .. } => "ui_score",
        MessageBody::TestReport { .. } => "test_report",
        MessageBody::Failure(_) => "failure",
    }
}
