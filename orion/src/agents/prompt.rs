//! Prompt rendering for agent roles.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};

use crate::agents::AgentInput;
use crate::core::types::{AgentRole, DeployOutcome};

const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");
const UI_REVIEWER_TEMPLATE: &str = include_str!("prompts/ui_reviewer.md");
const TESTER_TEMPLATE: &str = include_str!("prompts/tester.md");
const SECURITY_REVIEWER_TEMPLATE: &str = include_str!("prompts/security_reviewer.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (role, template) in [
            (AgentRole::Coder, CODER_TEMPLATE),
            (AgentRole::UiReviewer, UI_REVIEWER_TEMPLATE),
            (AgentRole::Tester, TESTER_TEMPLATE),
            (AgentRole::SecurityReviewer, SECURITY_REVIEWER_TEMPLATE),
        ] {
            env.add_template(role.as_str(), template)
                .with_context(|| format!("{role} template"))?;
        }
        Ok(Self { env })
    }

    pub fn render(&self, role: AgentRole, input: &AgentInput) -> Result<String> {
        let template = self
            .env
            .get_template(role.as_str())
            .map_err(|_| anyhow!("no prompt template for {role}"))?;
        let rendered = template.render(context! {
            instance_id => &input.instance_id,
            iteration => input.iteration,
            last_outcome => input.last_outcome.map(DeployOutcome::as_str),
            artifact => input.upstream.as_ref().and_then(|m| m.artifact()).map(str::trim),
        })?;
        Ok(rendered.trim().to_string())
    }
}
