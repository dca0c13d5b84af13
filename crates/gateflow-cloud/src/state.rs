//! State management for provisioned resources
//!
//! Manages the `.gateflow/state.json` file, which records what was applied
//! for each logical resource and the identity the provider assigned to it.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use gateflow_core::{DependencyMap, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_VERSION: u32 = 1;
const STATE_DIR: &str = ".gateflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Recorded state of every managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State file version
    pub version: u32,

    /// Incremented on every save
    #[serde(default)]
    pub serial: u64,

    /// Identifies the deployment this state belongs to
    pub lineage: String,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Resources indexed by logical name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResourceState> {
        self.resources.get_mut(name)
    }

    /// Add or update a resource
    pub fn set_resource(&mut self, name: impl Into<String>, state: ResourceState) {
        self.resources.insert(name.into(), state);
        self.updated_at = Utc::now();
    }

    /// Remove a resource
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }

    /// Value of `resource.attribute` as recorded
    pub fn value(&self, resource: &str, attribute: &str) -> Option<Value> {
        self.resources.get(resource)?.value(attribute)
    }

    /// Recorded dependencies, limited to resources still in the snapshot
    pub fn dependency_map(&self) -> DependencyMap {
        self.resources
            .iter()
            .map(|(name, state)| {
                let deps = state
                    .dependencies
                    .iter()
                    .filter(|d| self.resources.contains_key(*d))
                    .cloned()
                    .collect();
                (name.clone(), deps)
            })
            .collect()
    }

    /// Names of recorded resources that depend on `name`
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|(_, state)| state.dependencies.contains(name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Number of old copies waiting to be deleted
    pub fn deposed_count(&self) -> usize {
        self.resources.values().map(|r| r.deposed.len()).sum()
    }
}

/// State of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Provider-assigned ID. Never changes once created.
    pub id: String,

    pub kind: ResourceKind,

    /// Current status
    pub status: ResourceStatus,

    /// Resolved input attributes that were applied
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,

    /// Computed attributes reported by the provider
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,

    /// Logical names this resource depended on when applied
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Old copies left behind by create-before-destroy replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedCopy>,

    /// When the resource was created
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: ResourceStatus::Ready,
            attributes: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Look up `id`, a computed output, or an applied input attribute
    pub fn value(&self, attribute: &str) -> Option<Value> {
        if attribute == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.outputs
            .get(attribute)
            .or_else(|| self.attributes.get(attribute))
            .cloned()
    }

    pub fn is_tainted(&self) -> bool {
        self.status == ResourceStatus::Tainted
    }
}

/// An old copy that still exists at the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeposedCopy {
    pub id: String,
    pub kind: ResourceKind,
}

/// Status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Created and ready
    Ready,
    /// Exists but never became ready; will be replaced on the next apply
    Tainted,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Tainted => write!(f, "tainted"),
        }
    }
}

/// State manager for reading/writing state files
pub struct StateManager {
    /// Project root directory
    project_root: PathBuf,
}

impl StateManager {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    /// Get the state directory path
    fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    /// Get the state file path
    pub fn state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    /// Get the backup file path
    fn backup_path(&self) -> PathBuf {
        self.state_dir().join(STATE_BACKUP)
    }

    /// Get the lock file path
    fn lock_path(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        let dir = self.state_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<StateSnapshot> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: StateSnapshot = serde_json::from_str(&content)?;

        // Version check
        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} resources", state.resources.len());
        Ok(state)
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &mut StateSnapshot) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        state.serial += 1;
        state.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!(
            serial = state.serial,
            "Saved state with {} resources",
            state.resources.len()
        );
        Ok(())
    }

    /// Acquire a lock for exclusive access
    ///
    /// The lock file is created with `create_new`, so only one caller can
    /// win. A lock older than an hour is removed and creation is retried once.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path();
        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&lock_info)?;

        for _ in 0..2 {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;
            match created {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.flush().await?;
                    tracing::debug!("Acquired state lock");
                    return Ok(StateLock {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    remove_stale_lock(&lock_path).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CloudError::LockError(
            "State lock was taken by another process".to_string(),
        ))
    }
}

/// Remove the lock at `path` if it is stale, otherwise report the holder
async fn remove_stale_lock(path: &Path) -> Result<()> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        // Released in the meantime
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    // An empty or partial file belongs to a holder that is still writing it
    let Ok(lock_info) = serde_json::from_str::<LockInfo>(&content) else {
        return Err(CloudError::LockError(
            "State is being locked by another process".to_string(),
        ));
    };

    // Locks older than an hour are considered stale
    let age = Utc::now().signed_duration_since(lock_info.acquired_at);
    if age.num_hours() < 1 {
        return Err(CloudError::LockError(format!(
            "State is locked by {} since {}",
            lock_info.holder, lock_info.acquired_at
        )));
    }

    tracing::warn!("Removing stale lock from {}", lock_info.holder);
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let mut state = StateSnapshot::new();
        state.set_resource(
            "gateway_instance",
            ResourceState::new("i-0123", ResourceKind::ComputeInstance)
                .with_output("private_ip", json!("10.0.0.12"))
                .with_dependency("gateway_sg"),
        );

        manager.save(&mut state).await.unwrap();
        manager.save(&mut state).await.unwrap();

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.serial, 2);
        assert_eq!(loaded.lineage, state.lineage);
        assert_eq!(
            loaded.value("gateway_instance", "private_ip"),
            Some(json!("10.0.0.12"))
        );
        assert!(temp_dir.path().join(".gateflow/state.json.backup").exists());
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let state = manager.load().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());
        let mut state = StateSnapshot::new();
        state.version = STATE_VERSION + 1;
        std::fs::create_dir_all(temp_dir.path().join(".gateflow")).unwrap();
        std::fs::write(
            manager.state_path(),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            manager.load().await,
            Err(CloudError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let lock = manager.acquire_lock().await.unwrap();
        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));

        lock.release().await.unwrap();
        let again = manager.acquire_lock().await.unwrap();
        drop(again);
        assert!(!temp_dir.path().join(".gateflow/lock.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        for _ in 0..20 {
            let temp_dir = tempdir().unwrap();
            let first = StateManager::new(temp_dir.path());
            let second = StateManager::new(temp_dir.path());

            let (a, b) = tokio::join!(
                tokio::spawn(async move { first.acquire_lock().await }),
                tokio::spawn(async move { second.acquire_lock().await }),
            );
            let results = [a.unwrap(), b.unwrap()];

            let held = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(held, 1);
            assert!(
                results
                    .iter()
                    .any(|r| matches!(r, Err(CloudError::LockError(_))))
            );
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());
        let lock_path = temp_dir.path().join(".gateflow/lock.json");
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        let stale = LockInfo {
            holder: "crashed-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = manager.acquire_lock().await.unwrap();
        let content = std::fs::read_to_string(&lock_path).unwrap();
        assert!(!content.contains("crashed-host"));
        lock.release().await.unwrap();
    }

    #[test]
    fn test_value_lookup_order() {
        let state = ResourceState::new("vol-1", ResourceKind::VolumeAttachment)
            .with_attribute("device_name", json!("/dev/sdf"))
            .with_output("state", json!("attached"));

        assert_eq!(state.value("id"), Some(json!("vol-1")));
        assert_eq!(state.value("device_name"), Some(json!("/dev/sdf")));
        assert_eq!(state.value("state"), Some(json!("attached")));
        assert_eq!(state.value("missing"), None);
    }

    #[test]
    fn test_dependency_map_ignores_missing() {
        let mut state = StateSnapshot::new();
        state.set_resource(
            "a",
            ResourceState::new("1", ResourceKind::Role).with_dependency("gone"),
        );
        state.set_resource(
            "b",
            ResourceState::new("2", ResourceKind::RolePolicy).with_dependency("a"),
        );

        let deps = state.dependency_map();
        assert!(deps["a"].is_empty());
        assert!(deps["b"].contains("a"));
        assert_eq!(state.dependents_of("a"), BTreeSet::from(["b".to_string()]));
    }
}
