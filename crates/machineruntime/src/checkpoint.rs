use async_trait::async_trait;
use machinecore::{CheckpointError, ExecutionState, STATE_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Serialized execution state. Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for CheckpointToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a ExecutionState,
}

/// Upgrades the `state` of an envelope written by an older version by one
/// version step.
pub type Migration = fn(serde_json::Value) -> Result<serde_json::Value, CheckpointError>;

/// Turns execution state into checkpoint tokens and back.
///
/// The token is a versioned JSON envelope. Every map in the state is
/// ordered, so the same state always yields the same token.
#[derive(Default)]
pub struct StateManager {
    migrations: BTreeMap<u32, Migration>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the migration that lifts version `from` to `from + 1`.
    pub fn with_migration(mut self, from: u32, migration: Migration) -> Self {
        self.migrations.insert(from, migration);
        self
    }

    pub fn checkpoint(&self, state: &ExecutionState) -> Result<CheckpointToken, CheckpointError> {
        let raw = serde_json::to_string(&EnvelopeRef {
            version: STATE_VERSION,
            state,
        })?;
        tracing::debug!(
            tick = state.metadata.tick,
            paths = state.paths.len(),
            bytes = raw.len(),
            "Checkpoint taken"
        );
        Ok(CheckpointToken(raw))
    }

    pub fn restore(&self, token: &CheckpointToken) -> Result<ExecutionState, CheckpointError> {
        let envelope: serde_json::Value = serde_json::from_str(token.as_str())?;
        let mut version = envelope
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CheckpointError::Malformed("missing version".to_string()))?
            as u32;
        let mut state = envelope
            .get("state")
            .cloned()
            .ok_or_else(|| CheckpointError::Malformed("missing state".to_string()))?;

        if version > STATE_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: version,
                current: STATE_VERSION,
            });
        }
        while version < STATE_VERSION {
            let migrate = self.migrations.get(&version).ok_or(CheckpointError::UnsupportedVersion {
                found: version,
                current: STATE_VERSION,
            })?;
            state = migrate(state)?;
            version += 1;
            tracing::info!(version, "Migrated checkpoint");
        }

        let mut state: ExecutionState = serde_json::from_value(state)?;
        state.version = STATE_VERSION;
        Ok(state)
    }
}

/// Somewhere to keep checkpoint tokens between runs.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, id: &str, token: &CheckpointToken) -> Result<(), CheckpointError>;

    async fn load(&self, id: &str) -> Result<CheckpointToken, CheckpointError>;

    /// Stored checkpoint ids, sorted.
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;

    async fn delete(&self, id: &str) -> Result<(), CheckpointError>;
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    tokens: RwLock<BTreeMap<String, CheckpointToken>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, id: &str, token: &CheckpointToken) -> Result<(), CheckpointError> {
        self.tokens.write().await.insert(id.to_string(), token.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<CheckpointToken, CheckpointError> {
        self.tokens
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(self.tokens.read().await.keys().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        self.tokens.write().await.remove(id);
        Ok(())
    }
}

/// Stores each checkpoint as `<dir>/<id>.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.starts_with('.');
        if !valid {
            return Err(CheckpointError::Malformed(format!("invalid checkpoint id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, id: &str, token: &CheckpointToken) -> Result<(), CheckpointError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, token.as_str()).await?;
        tracing::debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<CheckpointToken, CheckpointError> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(CheckpointToken(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use machinecore::{GraphDefinition, Limits, Node, NodeKind};
    use std::sync::Arc;

    fn state() -> ExecutionState {
        let mut def = GraphDefinition::new("checkpoint");
        def.add_node(Node::new("Start", NodeKind::Entry))
            .add_node(Node::new("End", NodeKind::Control))
            .connect("Start", "End");
        let mut state = ExecutionState::new(Arc::new(def), Limits::default(), Utc::now());
        state.spawn_path("Start", None, Utc::now());
        state
    }

    #[test]
    fn restore_reproduces_the_same_token() {
        let manager = StateManager::new();
        let original = state();
        let token = manager.checkpoint(&original).unwrap();
        let restored = manager.restore(&token).unwrap();

        assert_eq!(restored.paths.len(), 1);
        assert_eq!(restored.definition.title, "checkpoint");
        assert_eq!(manager.checkpoint(&restored).unwrap(), token);
    }

    #[test]
    fn newer_versions_are_refused() {
        let token = CheckpointToken::from(
            serde_json::json!({ "version": STATE_VERSION + 1, "state": {} }).to_string(),
        );
        let err = StateManager::new().restore(&token).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion { .. }));
    }

    #[test]
    fn older_versions_go_through_migrations() {
        let manager = StateManager::new();
        let current = manager.checkpoint(&state()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(current.as_str()).unwrap();
        envelope["version"] = serde_json::json!(STATE_VERSION - 1);
        envelope["state"]["legacy"] = serde_json::json!(true);
        let old = CheckpointToken::from(envelope.to_string());

        assert!(matches!(
            manager.restore(&old),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));

        fn drop_legacy(mut state: serde_json::Value) -> Result<serde_json::Value, CheckpointError> {
            if let Some(map) = state.as_object_mut() {
                map.remove("legacy");
            }
            Ok(state)
        }
        let migrating = StateManager::new().with_migration(STATE_VERSION - 1, drop_legacy);
        let restored = migrating.restore(&old).unwrap();
        assert_eq!(restored.version, STATE_VERSION);
    }

    #[test]
    fn garbage_is_malformed_or_serialization_error() {
        let manager = StateManager::new();
        assert!(matches!(
            manager.restore(&CheckpointToken::from("{}".to_string())),
            Err(CheckpointError::Malformed(_))
        ));
        assert!(matches!(
            manager.restore(&CheckpointToken::from("not json".to_string())),
            Err(CheckpointError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryCheckpointStore::new();
        let token = StateManager::new().checkpoint(&state()).unwrap();
        store.save("tick-3", &token).await.unwrap();

        assert_eq!(store.load("tick-3").await.unwrap(), token);
        assert_eq!(store.list().await.unwrap(), vec!["tick-3".to_string()]);
        store.delete("tick-3").await.unwrap();
        assert!(matches!(
            store.load("tick-3").await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("machine-checkpoints-{}", uuid::Uuid::new_v4()));
        let store = FileCheckpointStore::new(&dir);
        let token = StateManager::new().checkpoint(&state()).unwrap();

        assert!(store.list().await.unwrap().is_empty());
        store.save("b", &token).await.unwrap();
        store.save("a", &token).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.load("a").await.unwrap(), token);
        assert!(matches!(
            store.save("../escape", &token).await,
            Err(CheckpointError::Malformed(_))
        ));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
