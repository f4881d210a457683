//! Core abstractions for the machine engine
//!
//! This crate provides the data model, guard expressions, annotation
//! processing and the traits at the I/O seams (agent, tools, generated
//! code). It performs no I/O itself.

pub mod annotations;
mod agent;
mod clock;
mod definition;
mod error;
pub mod events;
pub mod expression;
mod mutation;
mod state;
mod tool;
mod value;

pub use agent::{
    AgentClient, AgentMessage, AgentRequest, AgentResponse, MessageRole, ToolCall,
    ToolCatalogEntry, TRANSITION_TOOL,
};
pub use annotations::{BarrierSpec, EdgeConfig, NodeConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use definition::{
    normalize_key, Annotation, Attribute, CodeImplementation, CompositionStep, Edge, EdgeTarget,
    GraphDefinition, Guard, GuardPolarity, ImplementationStrategy, Node, NodeKind,
    ToolImplementation, ToolSpec,
};
pub use error::{
    AgentError, CheckpointError, DefinitionError, ExpressionError, MachineError, MutationError,
    ToolError,
};
pub use events::*;
pub use expression::{EvalContext, Expression};
pub use mutation::{Mutation, MutationKind, MutationOp};
pub use state::{
    BarrierArrival, BarrierState, ContextEntry, ContextStore, ContextWrite, ExecutionMetadata,
    ExecutionPath, ExecutionState, HistoryEntry, Limits, PathFailure, PathId, PathStatus,
    ReasonCode, RefinementSignal, RunOutcome, RunReport, StaleWritePolicy, TimeoutScope,
    TransitionRecord, TransitionTrigger, STATE_VERSION,
};
pub use tool::{CodeRunner, ToolContext, ToolHandler, ToolInvoker, ToolOutput};
pub use value::Value;

/// Result type for machine operations
pub type Result<T> = std::result::Result<T, MachineError>;
