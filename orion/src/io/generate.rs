//! Generator abstraction for LLM-backed agent calls.
//!
//! The [`Generator`] trait decouples agents from the actual model backend.
//! [`CommandGenerator`] spawns a configured process per call; tests use
//! scripted generators that return predetermined text.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::AgentRole;
use crate::error::FailureKind;
use crate::io::config::ProcessConfig;
use crate::io::process::run_command_with_timeout;

/// Backend failures, kept distinct so retry rules can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerationError::Timeout(_) => FailureKind::Timeout,
            GenerationError::RateLimited(_) => FailureKind::RateLimited,
            GenerationError::Auth(_) => FailureKind::Auth,
            GenerationError::Quota(_) => FailureKind::Quota,
            GenerationError::Backend(_) => FailureKind::Backend,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce text for `role` from a rendered prompt and structured context.
    async fn generate(
        &self,
        role: AgentRole,
        prompt: &str,
        context: &Value,
    ) -> Result<String, GenerationError>;
}

/// Generator that spawns the configured command.
///
/// The prompt is written to stdin, the JSON context is exported as
/// `ORION_CONTEXT`, and `{role}` in arguments is replaced by the role name.
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    classifier: StderrClassifier,
}

impl CommandGenerator {
    pub fn new(config: &ProcessConfig, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        if !config.is_configured() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        Ok(Self {
            command: config.command.clone(),
            timeout,
            output_limit_bytes,
            classifier: StderrClassifier::new()?,
        })
    }

    fn build_command(&self, role: AgentRole, context: &Value) -> Command {
        let args: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace("{role}", role.as_str()))
            .collect();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .env("ORION_ROLE", role.as_str())
            .env("ORION_CONTEXT", context.to_string());
        cmd
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(role = %role, timeout_secs = self.timeout.as_secs()))]
    async fn generate(
        &self,
        role: AgentRole,
        prompt: &str,
        context: &Value,
    ) -> Result<String, GenerationError> {
        let cmd = self.build_command(role, context);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes().to_vec()),
            self.timeout,
            self.output_limit_bytes,
        )
        .await
        .map_err(|err| GenerationError::Backend(format!("{err:#}")))?;

        if output.timed_out {
            warn!("generator timed out");
            return Err(GenerationError::Timeout(self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(self.classifier.classify(stderr.trim()));
        }
        debug!(bytes = output.stdout.len(), "generator completed");
        Ok(output.stdout_text())
    }
}

/// Maps backend stderr onto [`GenerationError`] kinds.
struct StderrClassifier {
    rate_limited: Regex,
    auth: Regex,
    quota: Regex,
    timeout: Regex,
}

impl StderrClassifier {
    fn new() -> Result<Self> {
        Ok(Self {
            rate_limited: Regex::new(r"(?i)rate.?limit|too many requests|\b429\b")
                .context("compile rate limit pattern")?,
            auth: Regex::new(r"(?i)unauthori[sz]ed|invalid api key|authentication|\b401\b|\b403\b")
                .context("compile auth pattern")?,
            quota: Regex::new(r"(?i)quota|insufficient.?credit|billing|\b402\b")
                .context("compile quota pattern")?,
            timeout: Regex::new(r"(?i)timed? ?out|deadline exceeded")
                .context("compile timeout pattern")?,
        })
    }

    fn classify(&self, stderr: &str) -> GenerationError {
        let message = stderr.lines().last().unwrap_or("").to_string();
        if self.quota.is_match(stderr) {
            GenerationError::Quota(message)
        } else if self.rate_limited.is_match(stderr) {
            GenerationError::RateLimited(message)
        } else if self.auth.is_match(stderr) {
            GenerationError::Auth(message)
        } else if self.timeout.is_match(stderr) {
            GenerationError::Timeout(Duration::ZERO)
        } else {
            GenerationError::Backend(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_is_classified_by_kind() {
        let classifier = StderrClassifier::new().expect("classifier");
        assert_eq!(
            classifier.classify("error: 429 Too Many Requests").kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            classifier.classify("Invalid API key provided").kind(),
            FailureKind::Auth
        );
        assert_eq!(
            classifier.classify("You exceeded your current quota").kind(),
            FailureKind::Quota
        );
        assert_eq!(
            classifier.classify("upstream request timed out").kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            classifier.classify("segfault").kind(),
            FailureKind::Backend
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = CommandGenerator::new(&ProcessConfig::default(), Duration::from_secs(1), 100);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_substitutes_role_and_reads_stdout() {
        let generator = CommandGenerator::new(
            &ProcessConfig::new(["sh", "-c", "printf '%s:' \"$0\"; cat", "{role}"]),
            Duration::from_secs(5),
            1024,
        )
        .expect("generator");
        let text = generator
            .generate(AgentRole::Tester, "prompt", &Value::Null)
            .await
            .expect("generate");
        assert_eq!(text, "tester:prompt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_generator_classifies_failures() {
        let generator = CommandGenerator::new(
            &ProcessConfig::new(["sh", "-c", "echo 'rate limit exceeded' >&2; exit 1"]),
            Duration::from_secs(5),
            1024,
        )
        .expect("generator");
        let err = generator
            .generate(AgentRole::Coder, "prompt", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimited);
    }
}
