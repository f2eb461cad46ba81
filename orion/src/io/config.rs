//! Orion configuration stored in `orion.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::breaker::BreakerConfig;
use crate::core::policy::{PolicyConfig, PolicyGate};
use crate::core::types::ExecutorKind;
use crate::core::veto::VetoThresholds;

pub const CONFIG_FILE: &str = "orion.toml";

/// Orion configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrionConfig {
    /// Directory holding snapshots, the command audit log, and cycle records.
    pub state_dir: PathBuf,
    pub cycle: CycleConfig,
    pub lease: LeaseConfig,
    pub queue: QueueConfig,
    pub policy: PolicyConfig,
    pub supervisor: SupervisorConfig,
    pub generator: ProcessConfig,
    pub deployer: ProcessConfig,
    /// Empty command disables screen actions.
    pub screen: ProcessConfig,
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CycleConfig {
    /// Pause between cycles of a policy loop.
    pub interval_secs: u64,
    /// Per agent call, per attempt.
    pub agent_timeout_secs: u64,
    /// Base delay before the single retry of a transient failure.
    pub retry_backoff_ms: u64,
    pub ui_score_threshold: f64,
    pub test_pass_rate_threshold: f64,
    pub deploy_timeout_secs: u64,
    /// Truncate generator/deployer output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            agent_timeout_secs: 120,
            retry_backoff_ms: 500,
            ui_score_threshold: 70.0,
            test_pass_rate_threshold: 0.8,
            deploy_timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    /// Worst case for one dispatch phase: two timed-out attempts and the
    /// widest jittered backoff between them.
    pub fn phase_budget(&self) -> Duration {
        self.agent_timeout() * 2 + self.retry_backoff() * 3 / 2
    }

    pub fn thresholds(&self) -> VetoThresholds {
        VetoThresholds {
            ui_score: self.ui_score_threshold,
            test_pass_rate: self.test_pass_rate_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseConfig {
    pub ttl_secs: u64,
    /// How long an instance loop waits after finding its lease held elsewhere.
    pub conflict_backoff_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            conflict_backoff_secs: 5,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_secs(self.conflict_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub idempotency_window_secs: u64,
    /// Zero disables debouncing.
    pub debounce_secs: u64,
    pub command_deadline_secs: u64,
    pub audit_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idempotency_window_secs: 8,
            debounce_secs: 2,
            command_deadline_secs: 120,
            audit_retention_secs: 24 * 60 * 60,
        }
    }
}

impl QueueConfig {
    pub fn idempotency_window(&self) -> Duration {
        Duration::from_secs(self.idempotency_window_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn command_deadline(&self) -> Duration {
        Duration::from_secs(self.command_deadline_secs)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(self.audit_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub cooldown_secs: u64,
    pub circuit_trigger_count: u32,
    pub circuit_window_secs: u64,
    pub circuit_open_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stuck_threshold_secs: 600,
            cooldown_secs: 300,
            circuit_trigger_count: 3,
            circuit_window_secs: 30 * 60,
            circuit_open_secs: 30 * 60,
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            trigger_count: self.circuit_trigger_count,
            window: Duration::from_secs(self.circuit_window_secs),
            open_for: Duration::from_secs(self.circuit_open_secs),
        }
    }
}

/// External command used by a process-backed adapter.
///
/// Arguments may contain `{role}`, substituted per call by the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ProcessConfig {
    pub command: Vec<String>,
}

impl ProcessConfig {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.command
            .first()
            .is_some_and(|program| !program.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Claim the hub's executor slot at startup. Instances without one only
    /// run cycles on demand (nudges and restarts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
}

impl InstanceConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

impl Default for OrionConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".orion"),
            cycle: CycleConfig::default(),
            lease: LeaseConfig::default(),
            queue: QueueConfig::default(),
            policy: PolicyConfig::default(),
            supervisor: SupervisorConfig::default(),
            generator: ProcessConfig::new(["orion-llm", "--role", "{role}"]),
            deployer: ProcessConfig::new(["./deploy.sh"]),
            screen: ProcessConfig::default(),
            instances: vec![InstanceConfig {
                id: "orion".to_string(),
                display_name: Some("Orion".to_string()),
                executor: Some(ExecutorKind::PolicyLoop),
            }],
        }
    }
}

impl OrionConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("cycle.interval_secs", self.cycle.interval_secs),
            ("cycle.agent_timeout_secs", self.cycle.agent_timeout_secs),
            ("cycle.deploy_timeout_secs", self.cycle.deploy_timeout_secs),
            ("lease.ttl_secs", self.lease.ttl_secs),
            ("queue.idempotency_window_secs", self.queue.idempotency_window_secs),
            ("queue.command_deadline_secs", self.queue.command_deadline_secs),
            ("queue.audit_retention_secs", self.queue.audit_retention_secs),
            ("supervisor.interval_secs", self.supervisor.interval_secs),
            ("supervisor.stuck_threshold_secs", self.supervisor.stuck_threshold_secs),
            ("supervisor.circuit_window_secs", self.supervisor.circuit_window_secs),
            ("supervisor.circuit_open_secs", self.supervisor.circuit_open_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.cycle.output_limit_bytes == 0 {
            return Err(anyhow!("cycle.output_limit_bytes must be > 0"));
        }
        if self.supervisor.circuit_trigger_count == 0 {
            return Err(anyhow!("supervisor.circuit_trigger_count must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.cycle.ui_score_threshold) {
            return Err(anyhow!("cycle.ui_score_threshold must be within 0..=100"));
        }
        if !(0.0..=1.0).contains(&self.cycle.test_pass_rate_threshold) {
            return Err(anyhow!("cycle.test_pass_rate_threshold must be within 0..=1"));
        }
        // The cycle lease is renewed after each phase and before deploy.
        let ttl = self.lease.ttl();
        if ttl < self.cycle.phase_budget() || ttl < self.cycle.deploy_timeout() {
            return Err(anyhow!(
                "lease.ttl_secs ({}s) must cover one dispatch phase ({:?}) and cycle.deploy_timeout_secs ({}s)",
                self.lease.ttl_secs,
                self.cycle.phase_budget(),
                self.cycle.deploy_timeout_secs
            ));
        }
        if self.queue.audit_retention_secs < self.queue.idempotency_window_secs {
            return Err(anyhow!(
                "queue.audit_retention_secs must be >= queue.idempotency_window_secs"
            ));
        }
        PolicyGate::new(self.policy.clone()).context("policy.deny_patterns")?;
        if !self.generator.is_configured() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if !self.deployer.is_configured() {
            return Err(anyhow!("deployer.command must be a non-empty array"));
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                return Err(anyhow!("instances[].id must be non-empty"));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(anyhow!("duplicate instance id {}", instance.id));
            }
        }
        Ok(())
    }

    /// Resolve `state_dir` against the directory holding the config file.
    pub fn state_dir_in(&self, root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            root.join(&self.state_dir)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrionConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrionConfig> {
    if !path.exists() {
        let cfg = OrionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
