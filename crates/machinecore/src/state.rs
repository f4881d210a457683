use crate::{GraphDefinition, Mutation, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Schema version written into every serialized state and checkpoint.
pub const STATE_VERSION: u32 = 1;

pub type PathId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Active,
    WaitingAtBarrier,
    Completed,
    Failed,
    /// Retired after spawning child paths at a fork.
    Forked,
    /// Retired after collapsing into a sibling at a merge barrier.
    Merged,
}

impl PathStatus {
    /// Still participates in scheduling.
    pub fn is_live(&self) -> bool {
        matches!(self, PathStatus::Active | PathStatus::WaitingAtBarrier)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    Auto,
    Agent,
    Code,
    Fork,
    Barrier,
    /// Auto-entry into the first child of a hierarchical node.
    Enter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub tick: u64,
    pub from: String,
    pub to: String,
    pub trigger: TransitionTrigger,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Machine-readable failure cause.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    LimitExceeded,
    Timeout,
    CycleDetected,
    AgentProtocol,
    AgentFailure,
    /// Waiting at a barrier that can no longer be satisfied.
    Deadlock,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathFailure {
    pub code: ReasonCode,
    pub message: String,
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
}

impl PathFailure {
    pub fn new(
        code: ReasonCode,
        node: impl Into<String>,
        message: impl Into<String>,
        tick: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            node: node.into(),
            limit: None,
            threshold: None,
            actual: None,
            tick,
            timestamp,
        }
    }

    pub fn with_limit(mut self, limit: impl Into<String>, threshold: u64, actual: u64) -> Self {
        self.limit = Some(limit.into());
        self.threshold = Some(threshold);
        self.actual = Some(actual);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Transition(TransitionRecord),
    Warning {
        tick: u64,
        node: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ToolCall {
        tick: u64,
        node: String,
        tool: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Refinement {
        tick: u64,
        node: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Failure(PathFailure),
}

/// One logical thread of control through the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPath {
    pub id: PathId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PathId>,
    pub current_node: String,
    pub status: PathStatus,
    pub history: Vec<HistoryEntry>,
    pub step_count: u64,
    pub node_invocations: BTreeMap<String, u64>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PathFailure>,
}

impl ExecutionPath {
    pub fn new(id: PathId, node: impl Into<String>, parent: Option<PathId>, now: DateTime<Utc>) -> Self {
        let node = node.into();
        let mut node_invocations = BTreeMap::new();
        node_invocations.insert(node.clone(), 1);
        Self {
            id,
            parent,
            current_node: node,
            status: PathStatus::Active,
            history: Vec::new(),
            step_count: 0,
            node_invocations,
            start_time: now,
            barrier: None,
            failure: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PathStatus::Active
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter().filter_map(|entry| match entry {
            HistoryEntry::Transition(record) => Some(record),
            _ => None,
        })
    }

    pub fn invocations_of(&self, node: &str) -> u64 {
        self.node_invocations.get(node).copied().unwrap_or(0)
    }

    /// Move to `to`, bumping the invocation counter of the target.
    pub fn record_transition(&mut self, record: TransitionRecord) {
        self.current_node = record.to.clone();
        *self.node_invocations.entry(record.to.clone()).or_insert(0) += 1;
        self.history.push(HistoryEntry::Transition(record));
    }

    pub fn record_warning(&mut self, tick: u64, message: impl Into<String>, timestamp: DateTime<Utc>) {
        self.history.push(HistoryEntry::Warning {
            tick,
            node: self.current_node.clone(),
            message: message.into(),
            timestamp,
        });
    }

    pub fn fail(&mut self, failure: PathFailure) {
        self.status = PathStatus::Failed;
        self.barrier = None;
        self.history.push(HistoryEntry::Failure(failure.clone()));
        self.failure = Some(failure);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    /// Elapsed time since run start; expiry fails every live path.
    #[default]
    Run,
    /// Elapsed time since each path started; expiry fails that path.
    Path,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StaleWritePolicy {
    /// Reject the stale write and record a warning on the writer.
    Fail,
    /// Re-apply the write at the next commit.
    #[default]
    Queue,
}

/// Resource limits. Caller defaults are merged with machine-level
/// attributes of the definition; the definition wins where it sets a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Limits {
    pub max_steps: u64,
    pub max_path_steps: u64,
    pub max_node_invocations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub timeout_scope: TimeoutScope,
    pub cycle_window: usize,
    pub max_cycle_repeats: u32,
    pub max_concurrent_paths: usize,
    pub fail_fast: bool,
    /// Resource-limit failures abort the whole run instead of one path.
    pub limits_fatal: bool,
    pub stale_writes: StaleWritePolicy,
    pub confidence_threshold: f64,
    pub max_agent_turns: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_path_steps: 1_000,
            max_node_invocations: 100,
            timeout_ms: None,
            timeout_scope: TimeoutScope::Run,
            cycle_window: 50,
            max_cycle_repeats: 10,
            max_concurrent_paths: 64,
            fail_fast: false,
            limits_fatal: false,
            stale_writes: StaleWritePolicy::Queue,
            confidence_threshold: 0.7,
            max_agent_turns: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    pub run_id: Uuid,
    pub tick: u64,
    pub total_steps: u64,
    pub started_at: DateTime<Utc>,
    pub error_count: u64,
    pub next_path_id: PathId,
    #[serde(default)]
    pub aborted: bool,
}

/// Committed values of one shared-state node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextEntry {
    pub version: u64,
    pub values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextWrite {
    pub path_id: PathId,
    pub node: String,
    pub values: BTreeMap<String, Value>,
    /// Version of the node the writer based its write on.
    pub base_version: u64,
}

/// Versioned shared state. Writes are staged during a tick and committed
/// between ticks; `queued` holds stale writes deferred to the next commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextStore {
    pub entries: BTreeMap<String, ContextEntry>,
    #[serde(default)]
    pub queued: Vec<ContextWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarrierArrival {
    pub path_id: PathId,
    pub edge: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarrierState {
    pub id: String,
    pub required_count: usize,
    pub merge: bool,
    pub waiting: Vec<BarrierArrival>,
}

/// Generated code failed or was not confident enough; a code-generation
/// collaborator may use this to replace the implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinementSignal {
    pub tick: u64,
    pub path_id: PathId,
    pub node: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// The single root of truth for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionState {
    pub version: u32,
    pub definition: Arc<GraphDefinition>,
    pub paths: Vec<ExecutionPath>,
    pub limits: Limits,
    pub metadata: ExecutionMetadata,
    pub context: ContextStore,
    pub barriers: BTreeMap<String, BarrierState>,
    pub mutations: Vec<Mutation>,
    pub refinements: Vec<RefinementSignal>,
}

impl ExecutionState {
    pub fn new(definition: Arc<GraphDefinition>, limits: Limits, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            definition,
            paths: Vec::new(),
            limits,
            metadata: ExecutionMetadata {
                run_id: Uuid::new_v4(),
                tick: 0,
                total_steps: 0,
                started_at: now,
                error_count: 0,
                next_path_id: 1,
                aborted: false,
            },
            context: ContextStore::default(),
            barriers: BTreeMap::new(),
            mutations: Vec::new(),
            refinements: Vec::new(),
        }
    }

    pub fn spawn_path(&mut self, node: impl Into<String>, parent: Option<PathId>, now: DateTime<Utc>) -> PathId {
        let id = self.metadata.next_path_id;
        self.metadata.next_path_id += 1;
        self.paths.push(ExecutionPath::new(id, node, parent, now));
        id
    }

    pub fn path(&self, id: PathId) -> Option<&ExecutionPath> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn path_mut(&mut self, id: PathId) -> Option<&mut ExecutionPath> {
        self.paths.iter_mut().find(|p| p.id == id)
    }

    pub fn live_paths(&self) -> impl Iterator<Item = &ExecutionPath> {
        self.paths.iter().filter(|p| p.status.is_live())
    }

    pub fn count(&self, status: PathStatus) -> usize {
        self.paths.iter().filter(|p| p.status == status).count()
    }

    pub fn is_finished(&self) -> bool {
        self.metadata.aborted || self.live_paths().next().is_none()
    }

    /// Exit condition once no live paths remain.
    pub fn outcome(&self) -> Option<RunOutcome> {
        if !self.is_finished() {
            return None;
        }
        let completed = self.count(PathStatus::Completed);
        let failed = self.count(PathStatus::Failed);
        Some(if self.metadata.aborted || (failed > 0 && completed == 0) {
            RunOutcome::Failed
        } else if failed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Completed
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: ExecutionState,
}
