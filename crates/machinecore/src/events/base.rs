use crate::{MutationKind, PathId, ReasonCode, RunOutcome, TransitionTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        title: String,
        paths: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        outcome: RunOutcome,
        ticks: u64,
        timestamp: DateTime<Utc>,
    },
    TickStarted {
        execution_id: ExecutionId,
        tick: u64,
        active_paths: usize,
    },
    TickCompleted {
        execution_id: ExecutionId,
        tick: u64,
        effects: usize,
    },
    PathCreated {
        execution_id: ExecutionId,
        path_id: PathId,
        node: String,
        parent: Option<PathId>,
    },
    PathTransitioned {
        execution_id: ExecutionId,
        path_id: PathId,
        from: String,
        to: String,
        trigger: TransitionTrigger,
        tick: u64,
    },
    PathForked {
        execution_id: ExecutionId,
        path_id: PathId,
        children: Vec<PathId>,
        tick: u64,
    },
    PathWaiting {
        execution_id: ExecutionId,
        path_id: PathId,
        barrier: String,
        tick: u64,
    },
    BarrierReleased {
        execution_id: ExecutionId,
        barrier: String,
        released: Vec<PathId>,
        tick: u64,
    },
    PathCompleted {
        execution_id: ExecutionId,
        path_id: PathId,
        node: String,
        tick: u64,
    },
    PathFailed {
        execution_id: ExecutionId,
        path_id: PathId,
        code: ReasonCode,
        message: String,
        tick: u64,
    },
    MutationCommitted {
        execution_id: ExecutionId,
        kind: MutationKind,
        tick: u64,
    },
    MutationRejected {
        execution_id: ExecutionId,
        reason: String,
        tick: u64,
    },
    AgentInvoked {
        execution_id: ExecutionId,
        path_id: PathId,
        node: String,
        candidates: usize,
    },
    GuardWarning {
        execution_id: ExecutionId,
        path_id: PathId,
        expression: String,
        message: String,
    },
    PathEvent {
        execution_id: ExecutionId,
        path_id: PathId,
        event: PathEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events raised by tool handlers running on behalf of a path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum PathEvent {
    Info { message: String },
    Warning { message: String },
    ToolInvoked { tool: String, succeeded: bool },
    Data { key: String, value: serde_json::Value },
}

/// Event emitter handed to tools for real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    path_id: PathId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        path_id: PathId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            path_id,
            sender,
        }
    }

    /// Emitter wired to nothing; events are dropped.
    pub fn detached(path_id: PathId) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(Uuid::nil(), path_id, sender)
    }

    pub fn emit(&self, event: PathEvent) {
        let _ = self.sender.send(ExecutionEvent::PathEvent {
            execution_id: self.execution_id,
            path_id: self.path_id,
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(PathEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(PathEvent::Warning {
            message: message.into(),
        });
    }

    pub fn data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.emit(PathEvent::Data {
            key: key.into(),
            value,
        });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, path_id: PathId) -> EventEmitter {
        EventEmitter::new(execution_id, path_id, self.sender.clone())
    }
}
