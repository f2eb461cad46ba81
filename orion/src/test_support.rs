//! Test doubles for the supervision loop.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::core::types::{AgentRole, Command, ExecutorKind};
use crate::io::config::{InstanceConfig, OrionConfig, ProcessConfig};
use crate::io::cycle_log::CycleRecord;
use crate::io::deploy::{DeployReceipt, DeployRequest, DeployStatus, Deployer};
use crate::io::generate::{GenerationError, Generator};
use crate::io::screen::ScreenAction;
use crate::io::sink::{DashboardSink, DashboardSnapshot, DashboardUpdate};
use crate::io::store::JsonFileStore;
use crate::queue::CommandHandler;

/// One scripted generator response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Ok(String),
    Err(GenerationError),
    /// Never answers; exercises agent timeouts and cancellation.
    Hang,
}

/// Generator that replays scripted replies per role, then falls back to a
/// per-role default. `{iteration}` in reply text is replaced with the
/// iteration from the call context.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<AgentRole, VecDeque<ScriptedReply>>>,
    defaults: Mutex<HashMap<AgentRole, String>>,
    calls: Mutex<HashMap<AgentRole, usize>>,
}

impl ScriptedGenerator {
    /// No defaults: unscripted calls fail with a backend error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults that pass every gate and change the artifact each iteration.
    pub fn healthy() -> Self {
        let generator = Self::new();
        generator.set_default(
            AgentRole::Coder,
            r#"{"artifact": "<main>iteration {iteration}</main>"}"#,
        );
        generator.set_default(AgentRole::UiReviewer, r#"{"score": 90, "notes": "clean"}"#);
        generator.set_default(AgentRole::Tester, r#"{"passed": 10, "total": 10}"#);
        generator.set_default(
            AgentRole::SecurityReviewer,
            r#"{"veto": false, "findings": []}"#,
        );
        generator
    }

    pub fn push(&self, role: AgentRole, reply: ScriptedReply) {
        self.scripts.lock().entry(role).or_default().push_back(reply);
    }

    pub fn set_default(&self, role: AgentRole, text: &str) {
        self.defaults.lock().insert(role, text.to_string());
    }

    pub fn calls(&self, role: AgentRole) -> usize {
        self.calls.lock().get(&role).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        role: AgentRole,
        _prompt: &str,
        context: &Value,
    ) -> Result<String, GenerationError> {
        *self.calls.lock().entry(role).or_default() += 1;
        let scripted = self
            .scripts
            .lock()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        let reply = match scripted {
            Some(reply) => reply,
            None => match self.defaults.lock().get(&role) {
                Some(text) => ScriptedReply::Ok(text.clone()),
                None => ScriptedReply::Err(GenerationError::Backend(format!(
                    "no scripted reply for {role}"
                ))),
            },
        };
        match reply {
            ScriptedReply::Ok(text) => {
                let iteration = context
                    .get("iteration")
                    .map(Value::to_string)
                    .unwrap_or_default();
                Ok(text.replace("{iteration}", &iteration))
            }
            ScriptedReply::Err(err) => Err(err),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }
}

enum DeployScript {
    Status(DeployStatus),
    Error(String),
}

/// Deployer that succeeds unless told otherwise, recording every request.
#[derive(Default)]
pub struct ScriptedDeployer {
    scripts: Mutex<VecDeque<DeployScript>>,
    requests: Mutex<Vec<DeployRequest>>,
}

impl ScriptedDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: DeployStatus) {
        self.scripts.lock().push_back(DeployScript::Status(status));
    }

    pub fn push_error(&self, message: &str) {
        self.scripts
            .lock()
            .push_back(DeployScript::Error(message.to_string()));
    }

    pub fn requests(&self) -> Vec<DeployRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Deployer for ScriptedDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<DeployReceipt> {
        self.requests.lock().push(request.clone());
        let script = self.scripts.lock().pop_front();
        match script {
            None => Ok(DeployReceipt {
                status: DeployStatus::Succeeded,
                log: format!("deployed {}", request.fingerprint),
            }),
            Some(DeployScript::Status(status)) => Ok(DeployReceipt {
                status,
                log: format!("deploy ended {status:?}"),
            }),
            Some(DeployScript::Error(message)) => Err(anyhow!(message)),
        }
    }
}

/// Sink that keeps every published update.
#[derive(Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<DashboardUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<DashboardUpdate> {
        self.updates.lock().clone()
    }

    pub fn cycles(&self) -> Vec<CycleRecord> {
        self.updates
            .lock()
            .iter()
            .filter_map(|update| match update {
                DashboardUpdate::Cycle(record) => Some(record.clone()),
                DashboardUpdate::Status(_) => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<DashboardSnapshot> {
        self.updates
            .lock()
            .iter()
            .filter_map(|update| match update {
                DashboardUpdate::Status(snapshot) => Some(snapshot.clone()),
                DashboardUpdate::Cycle(_) => None,
            })
            .collect()
    }
}

impl DashboardSink for RecordingSink {
    fn publish(&self, update: &DashboardUpdate) {
        self.updates.lock().push(update.clone());
    }
}

#[derive(Default)]
struct InFlight {
    per_target: HashMap<String, usize>,
    max_per_target: HashMap<String, usize>,
    total: usize,
    max_total: usize,
}

/// Command handler that records what it ran and how much ran at once.
#[derive(Default)]
pub struct RecordingHandler {
    delay: Option<Duration>,
    failing: Vec<String>,
    handled: Mutex<Vec<Command>>,
    in_flight: Mutex<InFlight>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail commands whose action has this name.
    pub fn failing(mut self, action_name: &str) -> Self {
        self.failing.push(action_name.to_string());
        self
    }

    /// Commands in the order they started.
    pub fn handled(&self) -> Vec<Command> {
        self.handled.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.handled.lock().len()
    }

    pub fn max_in_flight(&self, target: &str) -> usize {
        self.in_flight
            .lock()
            .max_per_target
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight_total(&self) -> usize {
        self.in_flight.lock().max_total
    }

    fn enter(&self, target: &str) {
        let mut in_flight = self.in_flight.lock();
        let current = {
            let count = in_flight.per_target.entry(target.to_string()).or_default();
            *count += 1;
            *count
        };
        let max = in_flight.max_per_target.entry(target.to_string()).or_default();
        *max = (*max).max(current);
        in_flight.total += 1;
        in_flight.max_total = in_flight.max_total.max(in_flight.total);
    }

    fn exit(&self, target: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.per_target.get_mut(target) {
            *count = count.saturating_sub(1);
        }
        in_flight.total = in_flight.total.saturating_sub(1);
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, command: &Command) -> Result<String> {
        self.handled.lock().push(command.clone());
        self.enter(&command.target_instance);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.exit(&command.target_instance);
        let name = command.action.name();
        if self.failing.contains(&name) {
            bail!("{name} failed");
        }
        Ok(format!("handled {name}"))
    }
}

/// Screen adapter that records invocations.
#[derive(Default)]
pub struct RecordingScreen {
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingScreen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ScreenAction for RecordingScreen {
    async fn perform(&self, name: &str, args: &Value) -> Result<String> {
        self.calls.lock().push((name.to_string(), args.clone()));
        Ok(format!("performed {name}"))
    }
}

/// Adapters wired to the scripted doubles above.
pub struct ScriptedAdapters {
    pub generator: Arc<ScriptedGenerator>,
    pub deployer: Arc<ScriptedDeployer>,
    pub screen: Arc<RecordingScreen>,
    pub sink: Arc<RecordingSink>,
}

impl ScriptedAdapters {
    pub fn healthy() -> Self {
        Self::with_generator(ScriptedGenerator::healthy())
    }

    pub fn with_generator(generator: ScriptedGenerator) -> Self {
        Self {
            generator: Arc::new(generator),
            deployer: Arc::new(ScriptedDeployer::new()),
            screen: Arc::new(RecordingScreen::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    pub fn adapters(&self) -> crate::control::Adapters {
        crate::control::Adapters {
            generator: self.generator.clone(),
            deployer: self.deployer.clone(),
            screen: self.screen.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Configuration with short timings for loop tests.
///
/// Cycles every 60s, supervisor ticks every 10s, stuck after 120s, cooldown
/// 300s. Process commands are placeholders; tests inject scripted adapters.
pub fn test_config() -> OrionConfig {
    let mut config = OrionConfig::default();
    config.cycle.interval_secs = 60;
    config.cycle.agent_timeout_secs = 5;
    config.cycle.retry_backoff_ms = 100;
    config.cycle.deploy_timeout_secs = 5;
    config.lease.ttl_secs = 30;
    config.supervisor.interval_secs = 10;
    config.supervisor.stuck_threshold_secs = 120;
    config.supervisor.cooldown_secs = 300;
    config.supervisor.circuit_trigger_count = 3;
    config.supervisor.circuit_window_secs = 3600;
    config.supervisor.circuit_open_secs = 1800;
    config.generator = ProcessConfig::new(["true"]);
    config.deployer = ProcessConfig::new(["true"]);
    config.instances = vec![InstanceConfig {
        id: "orion".to_string(),
        display_name: Some("Orion".to_string()),
        executor: Some(ExecutorKind::PolicyLoop),
    }];
    config
}

/// File-backed store in a fresh temp dir. Keep the guard alive for the test.
pub fn temp_store() -> (tempfile::TempDir, JsonFileStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonFileStore::new(dir.path());
    (dir, store)
}
