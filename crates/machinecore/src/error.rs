use thiserror::Error;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Mutation rejected: {0}")]
    Mutation(#[from] MutationError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems with a graph definition, raised at load time or
/// when a wholesale replacement is validated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Edge {edge} references unknown node '{endpoint}'")]
    UnresolvedEdge { edge: usize, endpoint: String },

    #[error("Tool node '{0}' has no tool specification")]
    MissingToolSpec(String),

    #[error("Barrier '{barrier}': {reason}")]
    InvalidBarrier { barrier: String, reason: String },

    #[error("Invalid attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("Invalid definition: {0}")]
    Invalid(String),
}

/// Guard expression failures. These never abort a run; the transition
/// evaluator treats them as a false guard and records a warning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("Division by zero")]
    DivisionByZero,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("Structural validation failed: {0}")]
    Structural(#[from] DefinitionError),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Edge index {0} out of range")]
    EdgeNotFound(usize),

    #[error("Malformed payload: {0}")]
    Payload(String),
}

#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input for '{field}': expected {expected}")]
    InvalidInput { field: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Agent invocation failed: {0}")]
    Invocation(String),

    #[error("Agent protocol violation: {0}")]
    Protocol(String),

    #[error("Agent exceeded {0} turns without choosing a transition")]
    TurnsExhausted(usize),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Unsupported checkpoint version {found} (current {current})")]
    UnsupportedVersion { found: u32, current: u32 },

    #[error("Malformed checkpoint: {0}")]
    Malformed(String),

    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
