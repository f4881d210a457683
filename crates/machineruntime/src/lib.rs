//! Machine execution runtime
//!
//! This crate provides the tick-driven engine that runs graph definitions:
//! transition evaluation, barrier synchronization, shared context, path
//! scheduling, definition mutation, the effect boundary to the agent and
//! tools, and checkpointing.

mod checkpoint;
mod context;
mod effects;
mod graph;
mod loader;
mod mutation;
mod registry;
mod runtime;
mod scheduler;
mod sync;
mod transition;

pub use checkpoint::{
    CheckpointStore, CheckpointToken, FileCheckpointStore, InMemoryCheckpointStore, Migration,
    StateManager,
};
pub use context::{CommitReport, ContextError, ContextManager, ContextView, Permissions};
pub use effects::{ChosenTransition, EffectExecutor, EffectOutcome};
pub use graph::ControlGraph;
pub use loader::{check as check_definition, load_definition, load_definition_file};
pub use mutation::{MetaMutationManager, MutationCommit, PendingMutation};
pub use registry::{FactoryMetadata, ToolFactory, ToolRegistry};
pub use runtime::{MachineRuntime, RuntimeConfig, TickReport};
pub use scheduler::{detect_cycle, EffectRequest, FoldedEffects, PathScheduler, TickSnapshot};
pub use sync::{Arrival, Release, SynchronizationManager};
pub use transition::{Candidate, Decision, Evaluation, GuardWarning, TransitionEvaluator};
