//! Screen (browser/computer control) actions, invoked only by the command handler.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::io::config::ProcessConfig;
use crate::io::process::run_command_with_timeout;

#[async_trait]
pub trait ScreenAction: Send + Sync {
    /// Perform a named action. Returns a short outcome message.
    async fn perform(&self, name: &str, args: &Value) -> Result<String>;
}

/// Refuses every action. Used when no screen command is configured.
pub struct DisabledScreen;

#[async_trait]
impl ScreenAction for DisabledScreen {
    async fn perform(&self, name: &str, _args: &Value) -> Result<String> {
        bail!("screen actions are disabled (requested {name})")
    }
}

/// Spawns the configured command as `<command...> <name>` with the JSON args on stdin.
pub struct CommandScreenAction {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandScreenAction {
    pub fn new(config: &ProcessConfig, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if !config.is_configured() {
            return Err(anyhow!("screen.command must be a non-empty array"));
        }
        Ok(Self {
            command: config.command.clone(),
            timeout,
            output_limit_bytes,
        })
    }
}

#[async_trait]
impl ScreenAction for CommandScreenAction {
    #[instrument(skip_all, fields(action = name))]
    async fn perform(&self, name: &str, args: &Value) -> Result<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).arg(name);
        let output = run_command_with_timeout(
            cmd,
            Some(args.to_string().into_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .await?;
        if output.timed_out {
            bail!("screen action {name} timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "screen action {name} failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            );
        }
        info!("screen action completed");
        Ok(output.stdout_text().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_screen_refuses() {
        let err = DisabledScreen
            .perform("open_url", &Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_screen_passes_name_and_args() {
        let screen = CommandScreenAction::new(
            &ProcessConfig::new(["sh", "-c", "printf '%s ' \"$1\"; cat", "screen"]),
            Duration::from_secs(5),
            1024,
        )
        .expect("screen");
        let outcome = screen
            .perform("refresh", &serde_json::json!({"tab": 1}))
            .await
            .expect("perform");
        assert_eq!(outcome, r#"refresh {"tab":1}"#);
    }
}
