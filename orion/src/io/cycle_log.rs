//! Cycle record helpers for `<state_dir>/cycles/`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cycle::CycleResult;
use crate::error::PersistenceError;
use crate::io::store::{create_parent, sanitize_component, to_pretty_json, write_text};

/// Product artifact for one finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub instance_id: String,
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: CycleResult,
    #[serde(skip)]
    pub deploy_log: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub artifact_path: PathBuf,
    pub deploy_log_path: PathBuf,
}

impl CyclePaths {
    pub fn new(root: &Path, instance_id: &str, iteration: u64) -> Self {
        let dir = root
            .join("cycles")
            .join(sanitize_component(instance_id))
            .join(iteration.to_string());
        Self {
            dir: dir.clone(),
            record_path: dir.join("record.json"),
            artifact_path: dir.join("artifact.txt"),
            deploy_log_path: dir.join("deploy.log"),
        }
    }
}

pub fn write_cycle_record(root: &Path, record: &CycleRecord) -> Result<CyclePaths, PersistenceError> {
    let paths = CyclePaths::new(root, &record.instance_id, record.iteration);
    create_parent(&paths.record_path)?;

    // Write in deterministic order to keep logs stable.
    let buf = to_pretty_json(&paths.record_path, record)?;
    write_text(&paths.record_path, &buf)?;
    let artifact = record
        .result
        .sub_results
        .as_ref()
        .and_then(|results| results.code.artifact());
    if let Some(artifact) = artifact {
        write_text(&paths.artifact_path, artifact)?;
    }
    if let Some(log) = &record.deploy_log {
        write_text(&paths.deploy_log_path, log)?;
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        AgentMessage, AgentRole, CyclePhase, DeployOutcome, MessageBody, ProgressClass,
    };
    use crate::core::veto::SubResults;

    #[test]
    fn cycle_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CyclePaths::new(temp.path(), "orion", 3);

        assert!(paths.dir.ends_with(Path::new("cycles/orion/3")));
        assert!(paths.record_path.ends_with("record.json"));
        assert!(paths.artifact_path.ends_with("artifact.txt"));
        assert!(paths.deploy_log_path.ends_with("deploy.log"));
    }

    #[test]
    fn writes_record_artifact_and_deploy_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let message = |role, body| AgentMessage::new(role, body);
        let record = CycleRecord {
            cycle_id: "c-1".to_string(),
            instance_id: "orion".to_string(),
            iteration: 1,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 12,
            result: CycleResult {
                sub_results: Some(SubResults {
                    code: message(
                        AgentRole::Coder,
                        MessageBody::Code {
                            artifact: "<html></html>".to_string(),
                        },
                    ),
                    ui: message(
                        AgentRole::UiReviewer,
                        MessageBody::UiScore {
                            score: 90.0,
                            notes: String::new(),
                        },
                    ),
                    tests: message(
                        AgentRole::Tester,
                        MessageBody::TestReport {
                            passed: 1,
                            total: 1,
                        },
                    ),
                    security: message(
                        AgentRole::SecurityReviewer,
                        MessageBody::SecurityReview {
                            veto: false,
                            findings: Vec::new(),
                        },
                    ),
                }),
                veto: false,
                deploy_outcome: DeployOutcome::Deployed,
                progress_class: ProgressClass::Forward,
                block_reason: None,
                artifact_fingerprint: Some("abc".to_string()),
                phase_trace: vec![CyclePhase::Dispatching, CyclePhase::Deploying],
            },
            deploy_log: Some("deployed".to_string()),
        };

        let paths = write_cycle_record(temp.path(), &record).expect("write");
        assert!(paths.record_path.is_file());
        assert_eq!(
            std::fs::read_to_string(&paths.artifact_path).expect("artifact"),
            "<html></html>"
        );
        assert!(paths.deploy_log_path.is_file());

        let raw = std::fs::read_to_string(&paths.record_path).expect("record");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["result"]["deploy_outcome"], "deployed");
        assert_eq!(value["result"]["progress_class"], "forward");
    }
}
