//! Deployer adapter for approved artifacts.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::io::config::ProcessConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub instance_id: String,
    pub iteration: u64,
    pub artifact: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReceipt {
    pub status: DeployStatus,
    /// Truncated stdout/stderr of the deploy step.
    pub log: String,
}

impl DeployReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == DeployStatus::Succeeded
    }
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt>;
}

/// Runs the configured deploy command with the artifact on stdin.
///
/// `ORION_INSTANCE`, `ORION_ITERATION` and `ORION_FINGERPRINT` are exported
/// to the process.
pub struct CommandDeployer {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandDeployer {
    pub fn new(config: &ProcessConfig, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if !config.is_configured() {
            return Err(anyhow!("deployer.command must be a non-empty array"));
        }
        Ok(Self {
            command: config.command.clone(),
            timeout,
            output_limit_bytes,
        })
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    #[instrument(skip_all, fields(instance = %request.instance_id, iteration = request.iteration))]
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env("ORION_INSTANCE", &request.instance_id)
            .env("ORION_ITERATION", request.iteration.to_string())
            .env("ORION_FINGERPRINT", &request.fingerprint);

        let output = run_command_with_timeout(
            cmd,
            Some(request.artifact.clone().into_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .await?;

        let log = format_deploy_log(&output, self.output_limit_bytes);
        let status = if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "deploy timed out");
            DeployStatus::TimedOut
        } else if output.status.success() {
            info!("deploy succeeded");
            DeployStatus::Succeeded
        } else {
            warn!(exit_code = ?output.status.code(), "deploy failed");
            DeployStatus::Failed
        };
        Ok(DeployReceipt { status, log })
    }
}

fn format_deploy_log(output: &CommandOutput, output_limit: usize) -> String {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str(&output.stdout_truncated_notice("deploy"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    buf.push_str(&output.stderr_truncated_notice("deploy"));
    if output.timed_out {
        buf.push_str("\n[deploy timed out]\n");
    }
    truncate_log(buf, output_limit)
}

fn truncate_log(buf: String, output_limit: usize) -> String {
    if buf.len() <= output_limit {
        return buf;
    }
    let mut cut = output_limit;
    while !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut)
}
