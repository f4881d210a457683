use crate::{events::EventEmitter, AgentClient, CodeImplementation, PathId, ToolError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Core trait that every callable tool implements
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool name as it appears in the agent's catalog
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool input
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool with given context
    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Lets a tool call other registered tools (composition).
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke_tool(&self, name: &str, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Executes generated code. The input is passed as JSON; implementations
/// report an optional confidence alongside the result.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(
        &self,
        code: &CodeImplementation,
        input: serde_json::Value,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// Execution context passed to each tool call
#[derive(Clone)]
pub struct ToolContext {
    pub path_id: PathId,

    /// Node whose agent turn issued the call
    pub node: String,

    pub input: serde_json::Value,

    pub events: EventEmitter,

    pub cancellation: tokio_util::sync::CancellationToken,

    pub agent: Option<Arc<dyn AgentClient>>,

    pub invoker: Option<Arc<dyn ToolInvoker>>,
}

impl ToolContext {
    pub fn new(path_id: PathId, node: impl Into<String>, input: serde_json::Value, events: EventEmitter) -> Self {
        Self {
            path_id,
            node: node.into(),
            input,
            events,
            cancellation: tokio_util::sync::CancellationToken::new(),
            agent: None,
            invoker: None,
        }
    }

    /// Same context with a different input, for nested calls.
    pub fn with_input(&self, input: serde_json::Value) -> Self {
        Self {
            input,
            ..self.clone()
        }
    }

    pub fn require_input(&self, name: &str) -> Result<&serde_json::Value, ToolError> {
        self.input
            .get(name)
            .ok_or_else(|| ToolError::MissingInput(name.to_string()))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        self.require_input(name)?
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput {
                field: name.to_string(),
                expected: "string".to_string(),
            })
    }
}

/// Output from a tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutput {
    pub value: serde_json::Value,

    /// Self-reported confidence in `[0, 1]`, used to gate generated code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Why generated code behind the tool was bypassed, when it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<String>,
}

impl ToolOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            confidence: None,
            refinement: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_refinement(mut self, reason: impl Into<String>) -> Self {
        self.refinement = Some(reason.into());
        self
    }
}
