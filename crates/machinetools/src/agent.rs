use async_trait::async_trait;
use machinecore::{
    AgentMessage, AgentRequest, ImplementationStrategy, ToolContext, ToolError, ToolHandler,
    ToolImplementation, ToolOutput, ToolSpec,
};
use machineruntime::{FactoryMetadata, ToolFactory};
use std::sync::Arc;

/// Tool answered by the agent itself, from a fixed prompt plus the call
/// input.
pub struct AgentBackedTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    prompt: String,
}

impl AgentBackedTool {
    pub fn new(name: impl Into<String>, spec: &ToolSpec, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: spec.description.clone(),
            input_schema: spec.input_schema.clone(),
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for AgentBackedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        ask_agent(&ctx, &self.name, &self.prompt).await
    }
}

/// Put `prompt` and the call input to the context's agent and read its
/// reply as JSON, or as a plain string when it is not JSON.
pub(crate) async fn ask_agent(ctx: &ToolContext, tool: &str, prompt: &str) -> Result<ToolOutput, ToolError> {
    let agent = ctx
        .agent
        .clone()
        .ok_or_else(|| ToolError::Configuration("no agent available to this tool".to_string()))?;

    let prompt = format!("{}\n\nInput:\n{}", prompt, ctx.input);
    let request = AgentRequest {
        path_id: ctx.path_id,
        node: ctx.node.clone(),
        prompt: prompt.clone(),
        tools: Vec::new(),
        conversation: vec![AgentMessage::user(prompt)],
    };

    ctx.events.info(format!("Asking agent for tool '{}'", tool));
    let response = tokio::select! {
        _ = ctx.cancellation.cancelled() => return Err(ToolError::Cancelled),
        response = agent.invoke(request) => {
            response.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        }
    };

    let text = response.text.trim();
    let value = serde_json::from_str(text)
        .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
    Ok(ToolOutput::new(value))
}

pub struct AgentToolFactory;

impl ToolFactory for AgentToolFactory {
    fn create(&self, name: &str, spec: &ToolSpec) -> Result<Arc<dyn ToolHandler>, ToolError> {
        match &spec.implementation {
            ToolImplementation::Agent { prompt } => {
                Ok(Arc::new(AgentBackedTool::new(name, spec, prompt.clone())))
            }
            _ => Err(ToolError::Configuration(format!(
                "'{}' is not an agent-backed tool",
                name
            ))),
        }
    }

    fn strategy(&self) -> ImplementationStrategy {
        ImplementationStrategy::Agent
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Tool whose answer comes from the agent".to_string(),
            category: "agent".to_string(),
        }
    }
}
