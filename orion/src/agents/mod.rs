//! Agent capabilities: one role, one generator call, one tagged message.
//!
//! A capability renders its prompt, calls the [`Generator`] under a timeout,
//! retries a transient failure once after backoff with jitter, and parses
//! the reply into a [`MessageBody`]. It never returns an error: failures come
//! back as `MessageBody::Failure` so the cycle can aggregate them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::types::{AgentMessage, AgentRole, DeployOutcome, MessageBody};
use crate::error::{CapabilityError, FailureKind};
use crate::io::generate::Generator;

pub mod output;
pub mod prompt;

use output::OutputParser;
use prompt::PromptEngine;

/// One retry for transient failures.
const MAX_ATTEMPTS: u32 = 2;

/// What an agent knows about the cycle it runs in.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub instance_id: String,
    pub iteration: u64,
    pub last_outcome: Option<DeployOutcome>,
    /// Prerequisite output (the generated code, for the security reviewer).
    pub upstream: Option<AgentMessage>,
}

#[derive(Debug, Clone, Copy)]
pub struct CapabilityConfig {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

/// Shared prompt and parser state for every capability.
pub struct AgentToolkit {
    prompts: PromptEngine,
    parser: OutputParser,
}

impl AgentToolkit {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompts: PromptEngine::new()?,
            parser: OutputParser::new()?,
        })
    }
}

#[derive(Clone)]
pub struct AgentCapability {
    role: AgentRole,
    generator: Arc<dyn Generator>,
    toolkit: Arc<AgentToolkit>,
    config: CapabilityConfig,
}

impl AgentCapability {
    pub fn new(
        role: AgentRole,
        generator: Arc<dyn Generator>,
        toolkit: Arc<AgentToolkit>,
        config: CapabilityConfig,
    ) -> Self {
        Self {
            role,
            generator,
            toolkit,
            config,
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    #[instrument(skip_all, fields(role = %self.role, instance = %input.instance_id, iteration = input.iteration))]
    pub async fn run(&self, input: &AgentInput) -> AgentMessage {
        if self.role == AgentRole::SecurityReviewer
            && input.upstream.as_ref().and_then(AgentMessage::artifact).is_none()
        {
            return self.fail(FailureKind::MissingInput, "no generated code to review", 0);
        }

        let prompt = match self.toolkit.prompts.render(self.role, input) {
            Ok(prompt) => prompt,
            Err(err) => return self.fail(FailureKind::Backend, &format!("{err:#}"), 0),
        };
        let context = json!({
            "instance_id": input.instance_id,
            "iteration": input.iteration,
            "last_outcome": input.last_outcome,
        });

        let mut attempts = 0;
        loop {
            attempts += 1;
            let call = self.generator.generate(self.role, &prompt, &context);
            let (kind, message) = match tokio::time::timeout(self.config.timeout, call).await {
                Ok(Ok(text)) => match self.toolkit.parser.parse(self.role, &text) {
                    Ok(body) => {
                        debug!(attempts, "agent produced output");
                        return self.message(body);
                    }
                    Err(reason) => (FailureKind::InvalidOutput, reason),
                },
                Ok(Err(err)) => (err.kind(), err.to_string()),
                Err(_) => (
                    FailureKind::Timeout,
                    format!("no response within {:?}", self.config.timeout),
                ),
            };

            if kind.is_retryable() && attempts < MAX_ATTEMPTS {
                let delay = self.retry_delay();
                warn!(kind = %kind, delay_ms = delay.as_millis() as u64, "agent call failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            warn!(kind = %kind, attempts, %message, "agent call failed");
            return self.fail(kind, &message, attempts);
        }
    }

    fn retry_delay(&self) -> Duration {
        let base = self.config.retry_backoff;
        let max_jitter = (base.as_millis() as u64) / 2;
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        base + Duration::from_millis(jitter)
    }

    fn message(&self, body: MessageBody) -> AgentMessage {
        let message = AgentMessage::new(self.role, body);
        match self.role {
            AgentRole::Coder => message.to(AgentRole::SecurityReviewer),
            AgentRole::SecurityReviewer => message.to(AgentRole::Deployer),
            _ => message,
        }
    }

    fn fail(&self, kind: FailureKind, message: &str, attempts: u32) -> AgentMessage {
        AgentMessage::failure(CapabilityError {
            role: self.role,
            kind,
            message: message.to_string(),
            attempts,
        })
    }
}
