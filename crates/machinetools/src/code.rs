use crate::agent::ask_agent;
use async_trait::async_trait;
use machinecore::{
    CodeImplementation, CodeRunner, ImplementationStrategy, Limits, ToolContext, ToolError,
    ToolHandler, ToolImplementation, ToolOutput, ToolSpec,
};
use machineruntime::{FactoryMetadata, ToolFactory};
use std::sync::Arc;

/// Tool backed by generated code.
///
/// When the code fails or answers below its confidence threshold the call
/// is put to the agent instead, and the output carries the reason as a
/// refinement. Without an agent the failure is returned.
pub struct GeneratedCodeTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    code: CodeImplementation,
    threshold: f64,
    runner: Arc<dyn CodeRunner>,
}

impl GeneratedCodeTool {
    async fn run_code(&self, ctx: &ToolContext) -> Result<ToolOutput, (String, Option<f64>)> {
        let output = match self
            .runner
            .run(&self.code, ctx.input.clone(), ctx.cancellation.clone())
            .await
        {
            Ok(output) => output,
            Err(e) => return Err((format!("generated code failed: {}", e), None)),
        };
        match output.confidence {
            Some(confidence) if confidence < self.threshold => Err((
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    confidence, self.threshold
                ),
                Some(confidence),
            )),
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl ToolHandler for GeneratedCodeTool {
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
        let (reason, confidence) = match self.run_code(&ctx).await {
            Ok(output) => return Ok(output),
            Err(failure) => failure,
        };
        if ctx.cancellation.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        ctx.events.warn(format!("'{}': {}", self.name, reason));
        if ctx.agent.is_none() {
            return Err(ToolError::ExecutionFailed(reason));
        }

        tracing::debug!(tool = %self.name, %reason, "Falling back to the agent");
        let mut output = ask_agent(&ctx, &self.name, &self.description)
            .await?
            .with_refinement(reason);
        output.confidence = confidence;
        Ok(output)
    }
}

pub struct GeneratedCodeFactory {
    runner: Arc<dyn CodeRunner>,
    threshold: f64,
}

impl GeneratedCodeFactory {
    pub fn new(runner: Arc<dyn CodeRunner>) -> Self {
        Self {
            runner,
            threshold: Limits::default().confidence_threshold,
        }
    }

    /// Threshold for code that does not state its own.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl ToolFactory for GeneratedCodeFactory {
    fn create(&self, name: &str, spec: &ToolSpec) -> Result<Arc<dyn ToolHandler>, ToolError> {
        let ToolImplementation::GeneratedCode(code) = &spec.implementation else {
            return Err(ToolError::Configuration(format!(
                "'{}' is not a generated-code tool",
                name
            )));
        };
        if code.code.trim().is_empty() {
            return Err(ToolError::Configuration(format!("'{}' has no code", name)));
        }
        Ok(Arc::new(GeneratedCodeTool {
            name: name.to_string(),
            description: spec.description.clone(),
            input_schema: spec.input_schema.clone(),
            threshold: code.confidence_threshold.unwrap_or(self.threshold),
            code: code.clone(),
            runner: self.runner.clone(),
        }))
    }

    fn strategy(&self) -> ImplementationStrategy {
        ImplementationStrategy::GeneratedCode
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Tool implemented by generated code run in a child process".to_string(),
            category: "code".to_string(),
        }
    }
}
