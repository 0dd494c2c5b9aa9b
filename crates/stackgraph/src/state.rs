//! Persisted stack state
//!
//! Applying a stack records which nodes exist, the attributes they exported
//! and the stack's outputs. Other stacks read those outputs through
//! [`crate::remote_state::RemoteStateBridge`].

use crate::error::Result;
use crate::value::OutputValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Current state artifact format
pub const STATE_VERSION: u32 = 1;

/// A node that has been applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// State artifact of one stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub version: u32,
    pub stack: String,
    /// Incremented on every write
    pub serial: u64,
    pub applied_at: DateTime<Utc>,
    /// Applied nodes, in apply order
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
    #[serde(default)]
    pub sensitive_outputs: BTreeSet<String>,
}

impl StackState {
    /// Empty state following `previous`
    pub fn next(stack: &str, previous: Option<&StackState>) -> Self {
        Self {
            version: STATE_VERSION,
            stack: stack.to_string(),
            serial: previous.map_or(1, |p| p.serial + 1),
            applied_at: Utc::now(),
            nodes: Vec::new(),
            outputs: BTreeMap::new(),
            sensitive_outputs: BTreeSet::new(),
        }
    }

    /// Prepare an in-place rewrite
    pub fn bump(&mut self) {
        self.serial += 1;
        self.applied_at = Utc::now();
    }

    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Insert or replace a node record, keeping first-apply order
    pub fn upsert_node(&mut self, record: NodeRecord) {
        match self.nodes.iter_mut().find(|n| n.id == record.id) {
            Some(existing) => *existing = record,
            None => self.nodes.push(record),
        }
    }

    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        self.nodes.len() < before
    }
}

/// Read access to state artifacts
pub trait StateReader: Send + Sync {
    /// State of `stack`, or `None` if it has never been applied
    fn read(&self, stack: &str) -> Result<Option<StackState>>;
}

/// Read/write access to state artifacts
pub trait StateStore: StateReader {
    fn write(&self, state: &StackState) -> Result<()>;

    fn remove(&self, stack: &str) -> Result<()>;
}

/// One JSON file per stack in a directory
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    dir: PathBuf,
}

impl LocalStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `stack`
    pub fn path_for(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.tfstate.json"))
    }
}

impl StateReader for LocalStateStore {
    fn read(&self, stack: &str) -> Result<Option<StackState>> {
        let path = self.path_for(stack);
        if !path.exists() {
            log::debug!("no state file for stack '{}' at {}", stack, path.display());
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let state: StackState = serde_json::from_str(&content)?;
        log::debug!("loaded state for '{}' (serial {})", stack, state.serial);
        Ok(Some(state))
    }
}

impl StateStore for LocalStateStore {
    fn write(&self, state: &StackState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&state.stack);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        log::debug!("saved state for '{}' to {}", state.stack, path.display());
        Ok(())
    }

    fn remove(&self, stack: &str) -> Result<()> {
        let path = self.path_for(stack);
        if path.exists() {
            fs::remove_file(&path)?;
            log::debug!("removed state file {}", path.display());
        }
        Ok(())
    }
}

/// In-memory store, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<BTreeMap<String, StackState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a stack's outputs as if it had been applied
    pub fn with_outputs<K: Into<String>>(
        self,
        stack: &str,
        outputs: impl IntoIterator<Item = (K, OutputValue)>,
    ) -> Self {
        let mut state = StackState::next(stack, None);
        state.outputs = outputs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.lock().insert(stack.to_string(), state);
        self
    }

    pub fn snapshot(&self, stack: &str) -> Option<StackState> {
        self.lock().get(stack).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StackState>> {
        // A poisoned map is still consistent: every mutation is a single insert/remove.
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateReader for MemoryStateStore {
    fn read(&self, stack: &str) -> Result<Option<StackState>> {
        Ok(self.lock().get(stack).cloned())
    }
}

impl StateStore for MemoryStateStore {
    fn write(&self, state: &StackState) -> Result<()> {
        self.lock().insert(state.stack.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, stack: &str) -> Result<()> {
        self.lock().remove(stack);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn network_state() -> StackState {
        let mut state = StackState::next("network", None);
        state.upsert_node(NodeRecord {
            id: "vpc".into(),
            kind: "aws_vpc".into(),
            attributes: BTreeMap::from([("id".to_string(), serde_json::json!("vpc-0a1b"))]),
        });
        state
            .outputs
            .insert("vpc_id".into(), OutputValue::String("vpc-0a1b".into()));
        state.outputs.insert(
            "vpc_private_subnets".into(),
            OutputValue::List(vec!["subnet-1".into(), "subnet-2".into()]),
        );
        state
    }

    #[test]
    fn test_local_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStateStore::new(tmp.path().join("state"));

        assert!(store.read("network").unwrap().is_none());

        let state = network_state();
        store.write(&state).unwrap();
        assert!(store.path_for("network").exists());
        assert_eq!(store.read("network").unwrap(), Some(state));

        store.remove("network").unwrap();
        assert!(store.read("network").unwrap().is_none());
    }

    #[test]
    fn test_state_file_format() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStateStore::new(tmp.path());
        store.write(&network_state()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path_for("network")).unwrap()).unwrap();
        assert_eq!(raw["outputs"]["vpc_id"], serde_json::json!("vpc-0a1b"));
        assert_eq!(
            raw["outputs"]["vpc_private_subnets"],
            serde_json::json!(["subnet-1", "subnet-2"])
        );
        assert_eq!(raw["serial"], serde_json::json!(1));
    }

    #[test]
    fn test_serial_and_node_records() {
        let first = network_state();
        let mut second = StackState::next("network", Some(&first));
        assert_eq!(second.serial, 2);

        second.upsert_node(NodeRecord {
            id: "vpc".into(),
            kind: "aws_vpc".into(),
            attributes: BTreeMap::new(),
        });
        second.upsert_node(NodeRecord {
            id: "subnet".into(),
            kind: "aws_subnet".into(),
            attributes: BTreeMap::new(),
        });
        second.upsert_node(NodeRecord {
            id: "vpc".into(),
            kind: "aws_vpc".into(),
            attributes: BTreeMap::from([("id".to_string(), serde_json::json!("vpc-2"))]),
        });
        let ids: Vec<_> = second.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["vpc", "subnet"]);
        assert!(second.remove_node("subnet"));
        assert!(!second.remove_node("subnet"));
    }
}
