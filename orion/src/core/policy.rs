//! Risk policy gate for commands.
//!
//! All approval rules live in one [`PolicyConfig`] loaded from `orion.toml`
//! and handed to the command queue. Nothing here consults the environment.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{Action, Decision, RiskLevel};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Highest risk level approved without an operator.
    pub risk_threshold: RiskLevel,
    /// Action names approved automatically regardless of risk (except critical).
    pub auto_approve_actions: Vec<String>,
    /// Action names that are never executed.
    pub deny_actions: Vec<String>,
    /// Regexes matched against the action name and arguments; a match denies.
    pub deny_patterns: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            risk_threshold: RiskLevel::Medium,
            auto_approve_actions: vec!["nudge".to_string(), "resume".to_string()],
            deny_actions: Vec::new(),
            deny_patterns: vec![
                r"(?i)rm\s+-rf".to_string(),
                r"(?i)drop\s+database".to_string(),
                r"(?i)force[-_ ]push".to_string(),
            ],
        }
    }
}

/// Outcome of evaluating a command against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub decision: Decision,
    pub reason: String,
}

/// Compiled policy.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    config: PolicyConfig,
    deny_patterns: Vec<Regex>,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig) -> Result<Self, regex::Error> {
        let deny_patterns = config
            .deny_patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            deny_patterns,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Classify a command. Rules apply in order: deny list, deny patterns,
    /// critical risk, auto-approve list, risk threshold.
    pub fn evaluate(&self, action: &Action, risk: RiskLevel) -> PolicyVerdict {
        let name = action.name();
        if self.config.deny_actions.iter().any(|denied| *denied == name) {
            return PolicyVerdict {
                decision: Decision::Denied,
                reason: format!("action '{name}' is on the deny list"),
            };
        }
        let text = action.describe();
        if let Some(pattern) = self.deny_patterns.iter().find(|re| re.is_match(&text)) {
            return PolicyVerdict {
                decision: Decision::Denied,
                reason: format!("action '{name}' matches deny pattern '{}'", pattern.as_str()),
            };
        }
        if risk == RiskLevel::Critical {
            return PolicyVerdict {
                decision: Decision::ManualRequired,
                reason: "critical risk requires operator approval".to_string(),
            };
        }
        if self.config.auto_approve_actions.iter().any(|a| *a == name) {
            return PolicyVerdict {
                decision: Decision::AutoApproved,
                reason: format!("action '{name}' is auto-approved"),
            };
        }
        if risk <= self.config.risk_threshold {
            PolicyVerdict {
                decision: Decision::AutoApproved,
                reason: format!("risk {risk} within threshold {}", self.config.risk_threshold),
            }
        } else {
            PolicyVerdict {
                decision: Decision::ManualRequired,
                reason: format!("risk {risk} above threshold {}", self.config.risk_threshold),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> PolicyGate {
        PolicyGate::new(PolicyConfig {
            deny_actions: vec!["screen.delete_account".to_string()],
            ..PolicyConfig::default()
        })
        .expect("policy")
    }

    fn screen(name: &str, args: serde_json::Value) -> Action {
        Action::Screen {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn deny_list_and_patterns_deny() {
        let gate = gate();
        let verdict = gate.evaluate(&screen("delete_account", json!({})), RiskLevel::Low);
        assert_eq!(verdict.decision, Decision::Denied);

        let verdict = gate.evaluate(
            &screen("terminal", json!({"cmd": "rm -rf /"})),
            RiskLevel::Low,
        );
        assert_eq!(verdict.decision, Decision::Denied);
        assert!(verdict.reason.contains("deny pattern"));
    }

    #[test]
    fn critical_always_requires_approval() {
        let verdict = gate().evaluate(
            &Action::Nudge {
                reason: "x".to_string(),
            },
            RiskLevel::Critical,
        );
        assert_eq!(verdict.decision, Decision::ManualRequired);
    }

    #[test]
    fn threshold_splits_auto_and_manual() {
        let gate = gate();
        let pause = Action::Pause {
            reason: "maintenance".to_string(),
        };
        assert_eq!(
            gate.evaluate(&pause, RiskLevel::Medium).decision,
            Decision::AutoApproved
        );
        assert_eq!(
            gate.evaluate(&pause, RiskLevel::High).decision,
            Decision::ManualRequired
        );
        let nudge = Action::Nudge {
            reason: "no_progress".to_string(),
        };
        assert_eq!(
            gate.evaluate(&nudge, RiskLevel::High).decision,
            Decision::AutoApproved
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let config = PolicyConfig {
            deny_patterns: vec!["(".to_string()],
            ..PolicyConfig::default()
        };
        assert!(PolicyGate::new(config).is_err());
    }
}
