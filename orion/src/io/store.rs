//! Persisted state behind the [`StateStore`] seam.
//!
//! Layout under the configured state directory:
//!
//! ```text
//! state/instances/<instance_id>.json   instance snapshots (atomic temp + rename)
//! state/commands.jsonl                 command audit log (append; compacted on prune)
//! state/supervisor.json                cooldown and circuit bookkeeping
//! cycles/<instance_id>/<iteration>/    cycle records (see `cycle_log`)
//! ```
//!
//! [`MemoryStore`] is the in-memory fake used by tests, with write-failure
//! injection per instance or globally.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::types::Command;
use crate::error::PersistenceError;
use crate::hub::InstanceSnapshot;
use crate::io::cycle_log::{CycleRecord, write_cycle_record};
use crate::supervisor::SupervisorSnapshot;

pub trait StateStore: Send + Sync {
    fn save_instance(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError>;
    fn remove_instance(&self, instance_id: &str) -> Result<(), PersistenceError>;
    fn load_instances(&self) -> Result<Vec<InstanceSnapshot>, PersistenceError>;

    /// Append one status transition of a command to the audit log.
    fn append_command(&self, record: &Command) -> Result<(), PersistenceError>;
    /// Latest record per request id, in first-seen order.
    fn load_commands(&self) -> Result<Vec<Command>, PersistenceError>;
    /// Replace the audit log with exactly `records`.
    fn compact_commands(&self, records: &[Command]) -> Result<(), PersistenceError>;

    fn save_supervisor(&self, snapshot: &SupervisorSnapshot) -> Result<(), PersistenceError>;
    fn load_supervisor(&self) -> Result<Option<SupervisorSnapshot>, PersistenceError>;

    fn write_cycle(&self, record: &CycleRecord) -> Result<(), PersistenceError>;
}

/// File-backed store rooted at the state directory.
pub struct JsonFileStore {
    root: PathBuf,
    audit_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            audit_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    fn instances_dir(&self) -> PathBuf {
        self.state_dir().join("instances")
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.instances_dir()
            .join(format!("{}.json", sanitize_component(instance_id)))
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir().join("commands.jsonl")
    }

    fn supervisor_path(&self) -> PathBuf {
        self.state_dir().join("supervisor.json")
    }
}

impl StateStore for JsonFileStore {
    fn save_instance(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        write_json_atomic(&self.instance_path(&snapshot.instance_id), snapshot)
    }

    fn remove_instance(&self, instance_id: &str) -> Result<(), PersistenceError> {
        let path = self.instance_path(instance_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Io { path, source }),
        }
    }

    fn load_instances(&self) -> Result<Vec<InstanceSnapshot>, PersistenceError> {
        let dir = self.instances_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| PersistenceError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| PersistenceError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths.iter().map(|path| read_json(path)).collect()
    }

    fn append_command(&self, record: &Command) -> Result<(), PersistenceError> {
        let path = self.audit_path();
        let mut line = serde_json::to_string(record).map_err(|source| PersistenceError::Serde {
            path: path.clone(),
            source,
        })?;
        line.push('\n');

        let _guard = self.audit_lock.lock();
        create_parent(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| PersistenceError::Io { path, source })
    }

    fn load_commands(&self) -> Result<Vec<Command>, PersistenceError> {
        let path = self.audit_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Command>(line) {
                Ok(record) => records.push(record),
                // A torn final line after a crash is tolerated.
                Err(err) => warn!(line = line_no + 1, err = %err, "skipping unreadable audit line"),
            }
        }
        Ok(latest_per_request(records))
    }

    fn compact_commands(&self, records: &[Command]) -> Result<(), PersistenceError> {
        let path = self.audit_path();
        let mut buf = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(|source| PersistenceError::Serde {
                path: path.clone(),
                source,
            })?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let _guard = self.audit_lock.lock();
        write_atomic(&path, &buf)?;
        debug!(records = records.len(), "compacted command audit log");
        Ok(())
    }

    fn save_supervisor(&self, snapshot: &SupervisorSnapshot) -> Result<(), PersistenceError> {
        write_json_atomic(&self.supervisor_path(), snapshot)
    }

    fn load_supervisor(&self) -> Result<Option<SupervisorSnapshot>, PersistenceError> {
        let path = self.supervisor_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn write_cycle(&self, record: &CycleRecord) -> Result<(), PersistenceError> {
        write_cycle_record(&self.root, record).map(|_| ())
    }
}

/// Collapse an append-only transition log to the latest record per request.
pub(crate) fn latest_per_request(records: Vec<Command>) -> Vec<Command> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Command> = HashMap::new();
    for record in records {
        match latest.get(&record.request_id) {
            None => order.push(record.request_id.clone()),
            Some(seen) if !record.supersedes(seen) => continue,
            Some(_) => {}
        }
        latest.insert(record.request_id.clone(), record);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

/// Keep ids usable as single path components.
pub(crate) fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(crate) fn create_parent(path: &Path) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub(crate) fn write_text(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    create_parent(path)?;
    fs::write(path, contents).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn to_pretty_json<T: Serialize>(path: &Path, value: &T) -> Result<String, PersistenceError> {
    let mut buf = serde_json::to_string_pretty(value).map_err(|source| PersistenceError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    buf.push('\n');
    Ok(buf)
}

/// Atomically write to disk (temp file + rename).
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), PersistenceError> {
    create_parent(path)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents).map_err(|source| PersistenceError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let buf = to_pretty_json(path, value)?;
    write_atomic(path, &buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let contents = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| PersistenceError::Serde {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Default)]
struct MemoryState {
    instances: HashMap<String, InstanceSnapshot>,
    commands: Vec<Command>,
    supervisor: Option<SupervisorSnapshot>,
    cycles: Vec<CycleRecord>,
}

/// In-memory store with failure injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_all: AtomicBool,
    failing_instances: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until cleared.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Make instance snapshot and cycle record writes fail for one instance.
    pub fn set_fail_instance(&self, instance_id: &str, fail: bool) {
        let mut failing = self.failing_instances.lock();
        if fail {
            failing.insert(instance_id.to_string());
        } else {
            failing.remove(instance_id);
        }
    }

    pub fn cycles(&self) -> Vec<CycleRecord> {
        self.state.lock().cycles.clone()
    }

    /// Raw audit log, one entry per transition.
    pub fn audit_log(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceSnapshot> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    fn check(&self, instance_id: Option<&str>) -> Result<(), PersistenceError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("injected failure".to_string()));
        }
        if let Some(id) = instance_id
            && self.failing_instances.lock().contains(id)
        {
            return Err(PersistenceError::Unavailable(format!(
                "injected failure for {id}"
            )));
        }
        Ok(())
    }
}

impl StateStore for MemoryStore {
    fn save_instance(&self, snapshot: &InstanceSnapshot) -> Result<(), PersistenceError> {
        self.check(Some(&snapshot.instance_id))?;
        self.state
            .lock()
            .instances
            .insert(snapshot.instance_id.clone(), snapshot.clone());
        Ok(())
    }

    fn remove_instance(&self, instance_id: &str) -> Result<(), PersistenceError> {
        self.check(None)?;
        self.state.lock().instances.remove(instance_id);
        Ok(())
    }

    fn load_instances(&self) -> Result<Vec<InstanceSnapshot>, PersistenceError> {
        let mut snapshots: Vec<_> = self.state.lock().instances.values().cloned().collect();
        snapshots.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(snapshots)
    }

    fn append_command(&self, record: &Command) -> Result<(), PersistenceError> {
        self.check(None)?;
        self.state.lock().commands.push(record.clone());
        Ok(())
    }

    fn load_commands(&self) -> Result<Vec<Command>, PersistenceError> {
        Ok(latest_per_request(self.state.lock().commands.clone()))
    }

    fn compact_commands(&self, records: &[Command]) -> Result<(), PersistenceError> {
        self.check(None)?;
        self.state.lock().commands = records.to_vec();
        Ok(())
    }

    fn save_supervisor(&self, snapshot: &SupervisorSnapshot) -> Result<(), PersistenceError> {
        self.check(None)?;
        self.state.lock().supervisor = Some(snapshot.clone());
        Ok(())
    }

    fn load_supervisor(&self) -> Result<Option<SupervisorSnapshot>, PersistenceError> {
        Ok(self.state.lock().supervisor.clone())
    }

    fn write_cycle(&self, record: &CycleRecord) -> Result<(), PersistenceError> {
        self.check(Some(&record.instance_id))?;
        self.state.lock().cycles.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Action, CommandStatus, Decision, RiskLevel};
    use chrono::Utc;

    fn record(request_id: &str, status: CommandStatus) -> Command {
        let now = Utc::now();
        Command {
            request_id: request_id.to_string(),
            idempotency_key: format!("key-{request_id}"),
            target_instance: "orion".to_string(),
            action: Action::Resume,
            risk_level: RiskLevel::Low,
            status,
            decision: Decision::AutoApproved,
            decision_reason: "test".to_string(),
            requested_by: "operator".to_string(),
            created_at: now,
            updated_at: now,
            outcome: None,
            error: None,
            duplicates: 0,
            resolved_by: None,
        }
    }

    #[test]
    fn audit_log_collapses_to_latest_transition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path());
        store
            .append_command(&record("a", CommandStatus::Queued))
            .expect("append");
        store
            .append_command(&record("b", CommandStatus::Queued))
            .expect("append");
        store
            .append_command(&record("a", CommandStatus::Succeeded))
            .expect("append");

        let loaded = store.load_commands().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].request_id, "a");
        assert_eq!(loaded[0].status, CommandStatus::Succeeded);
        assert_eq!(loaded[1].status, CommandStatus::Queued);
    }

    #[test]
    fn late_stale_append_does_not_roll_status_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path());
        let dispatched = record("a", CommandStatus::Dispatched);
        let mut succeeded = record("a", CommandStatus::Succeeded);
        succeeded.updated_at = dispatched.updated_at + chrono::Duration::seconds(1);
        store.append_command(&succeeded).expect("append");
        store.append_command(&dispatched).expect("append");

        let loaded = store.load_commands().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, CommandStatus::Succeeded);

        // Same stage: the newer update wins regardless of line order.
        let mut counted = succeeded.clone();
        counted.duplicates = 1;
        counted.updated_at = succeeded.updated_at + chrono::Duration::seconds(1);
        store.append_command(&counted).expect("append");
        store.append_command(&succeeded).expect("append");
        assert_eq!(store.load_commands().expect("load")[0].duplicates, 1);
    }

    #[test]
    fn torn_audit_line_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path());
        store
            .append_command(&record("a", CommandStatus::Queued))
            .expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.audit_path())
            .expect("open");
        file.write_all(b"{\"request_id\":\"tr").expect("write");

        assert_eq!(store.load_commands().expect("load").len(), 1);
    }

    #[test]
    fn compact_rewrites_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path());
        for id in ["a", "b", "c"] {
            store
                .append_command(&record(id, CommandStatus::Succeeded))
                .expect("append");
        }
        store
            .compact_commands(&[record("c", CommandStatus::Succeeded)])
            .expect("compact");
        let contents = fs::read_to_string(store.audit_path()).expect("read");
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn missing_files_load_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path().join("nothing"));
        assert!(store.load_instances().expect("instances").is_empty());
        assert!(store.load_commands().expect("commands").is_empty());
        assert!(store.load_supervisor().expect("supervisor").is_none());
    }

    #[test]
    fn memory_store_injects_failures() {
        let store = MemoryStore::new();
        store.set_fail_all(true);
        assert!(
            store
                .append_command(&record("a", CommandStatus::Queued))
                .is_err()
        );
        store.set_fail_all(false);
        assert!(
            store
                .append_command(&record("a", CommandStatus::Queued))
                .is_ok()
        );
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_component("orion-1_a.b"), "orion-1_a.b");
        assert_eq!(sanitize_component("../etc"), ".._etc");
    }
}
