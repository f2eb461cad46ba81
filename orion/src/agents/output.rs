//! Parsing and schema validation of agent output.

use std::collections::HashMap;

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::{AgentRole, MessageBody};

const CODER_SCHEMA: &str = include_str!("../../schemas/coder.schema.json");
const UI_REVIEWER_SCHEMA: &str = include_str!("../../schemas/ui_reviewer.schema.json");
const TESTER_SCHEMA: &str = include_str!("../../schemas/tester.schema.json");
const SECURITY_REVIEWER_SCHEMA: &str = include_str!("../../schemas/security_reviewer.schema.json");

#[derive(Deserialize)]
struct CoderOutput {
    artifact: String,
}

#[derive(Deserialize)]
struct UiReviewerOutput {
    score: f64,
    #[serde(default)]
    notes: String,
}

#[derive(Deserialize)]
struct TesterOutput {
    passed: u32,
    total: u32,
}

#[derive(Deserialize)]
struct SecurityReviewerOutput {
    veto: bool,
    #[serde(default)]
    findings: Vec<String>,
}

/// Compiled output schemas, one per role that produces a message.
pub struct OutputParser {
    validators: HashMap<AgentRole, Validator>,
}

impl OutputParser {
    pub fn new() -> Result<Self> {
        let mut validators = HashMap::new();
        for (role, raw) in [
            (AgentRole::Coder, CODER_SCHEMA),
            (AgentRole::UiReviewer, UI_REVIEWER_SCHEMA),
            (AgentRole::Tester, TESTER_SCHEMA),
            (AgentRole::SecurityReviewer, SECURITY_REVIEWER_SCHEMA),
        ] {
            let schema: Value =
                serde_json::from_str(raw).with_context(|| format!("parse {role} schema"))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&schema)
                .with_context(|| format!("compile {role} schema"))?;
            validators.insert(role, validator);
        }
        Ok(Self { validators })
    }

    /// Parse raw generator text into the role's message body.
    ///
    /// Errors are human-readable and end up in `FailureKind::InvalidOutput`.
    pub fn parse(&self, role: AgentRole, raw: &str) -> Result<MessageBody, String> {
        let json = extract_json(raw).ok_or_else(|| "no JSON object in output".to_string())?;
        let value: Value =
            serde_json::from_str(json).map_err(|err| format!("invalid JSON: {err}"))?;

        let validator = self
            .validators
            .get(&role)
            .ok_or_else(|| format!("{role} does not produce messages"))?;
        let messages: Vec<String> = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(format!(
                "schema validation failed: {}",
                messages.join("; ")
            ));
        }

        let body = match role {
            AgentRole::Coder => {
                let out: CoderOutput = from_value(value)?;
                MessageBody::Code {
                    artifact: out.artifact,
                }
            }
            AgentRole::UiReviewer => {
                let out: UiReviewerOutput = from_value(value)?;
                MessageBody::UiScore {
                    score: out.score,
                    notes: out.notes,
                }
            }
            AgentRole::Tester => {
                let out: TesterOutput = from_value(value)?;
                if out.passed > out.total {
                    return Err(format!(
                        "passed ({}) exceeds total ({})",
                        out.passed, out.total
                    ));
                }
                MessageBody::TestReport {
                    passed: out.passed,
                    total: out.total,
                }
            }
            AgentRole::SecurityReviewer => {
                let out: SecurityReviewerOutput = from_value(value)?;
                MessageBody::SecurityReview {
                    veto: out.veto,
                    findings: out.findings,
                }
            }
            AgentRole::Deployer => return Err("deployer does not produce messages".to_string()),
        };
        Ok(body)
    }
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| format!("unexpected shape: {err}"))
}

/// Locate the JSON object in model output, tolerating code fences and prose.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> OutputParser {
        OutputParser::new().expect("schemas compile")
    }

    #[test]
    fn parses_fenced_output() {
        let raw = "Here you go:\n```json\n{\"score\": 82.5, \"notes\": \"tidy\"}\n```\n";
        let body = parser().parse(AgentRole::UiReviewer, raw).expect("parse");
        assert_eq!(
            body,
            MessageBody::UiScore {
                score: 82.5,
                notes: "tidy".to_string()
            }
        );
    }

    #[test]
    fn rejects_schema_violations() {
        let err = parser()
            .parse(AgentRole::UiReviewer, r#"{"score": 140}"#)
            .unwrap_err();
        assert!(err.contains("schema validation failed"), "{err}");

        let err = parser()
            .parse(AgentRole::SecurityReviewer, r#"{"veto": "no"}"#)
            .unwrap_err();
        assert!(err.contains("schema validation failed"), "{err}");
    }

    #[test]
    fn rejects_inconsistent_test_report() {
        let err = parser()
            .parse(AgentRole::Tester, r#"{"passed": 5, "total": 3}"#)
            .unwrap_err();
        assert!(err.contains("exceeds total"));
    }

    #[test]
    fn rejects_missing_json() {
        assert!(parser().parse(AgentRole::Coder, "sorry, no").is_err());
    }

    #[test]
    fn parses_security_review_with_default_findings() {
        let body = parser()
            .parse(AgentRole::SecurityReviewer, r#"{"veto": true}"#)
            .expect("parse");
        assert_eq!(
            body,
            MessageBody::SecurityReview {
                veto: true,
                findings: Vec::new()
            }
        );
    }
}
