use async_trait::async_trait;
use machinecore::{
    CompositionStep, ImplementationStrategy, ToolContext, ToolError, ToolHandler,
    ToolImplementation, ToolOutput, ToolSpec,
};
use machineruntime::{FactoryMetadata, ToolFactory};
use serde_json::Value;
use std::sync::Arc;

/// Tool that calls other tools in sequence.
///
/// Step inputs may reference `$input` (the composite's own input) and
/// `$previous` (the prior step's output), optionally with a dotted field
/// path: `$previous.items`. A step without input receives the previous
/// output. The last step's output is the result.
pub struct CompositionTool {
    name: String,
    description: String,
    input_schema: Value,
    steps: Vec<CompositionStep>,
}

impl CompositionTool {
    fn resolve(template: &Value, input: &Value, previous: &Value) -> Value {
        match template {
            Value::String(s) => Self::reference(s, input, previous).unwrap_or_else(|| template.clone()),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::resolve(item, input, previous))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::resolve(v, input, previous)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn reference(s: &str, input: &Value, previous: &Value) -> Option<Value> {
        let (root, rest) = if let Some(rest) = s.strip_prefix("$input") {
            (input, rest)
        } else if let Some(rest) = s.strip_prefix("$previous") {
            (previous, rest)
        } else {
            return None;
        };
        if rest.is_empty() {
            return Some(root.clone());
        }
        let path = rest.strip_prefix('.')?;
        let mut current = root;
        for field in path.split('.') {
            current = match current {
                Value::Array(items) => items.get(field.parse::<usize>().ok()?)?,
                other => other.get(field)?,
            };
        }
        Some(current.clone())
    }
}

#[async_trait]
impl ToolHandler for CompositionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let invoker = ctx
            .invoker
            .clone()
            .ok_or_else(|| ToolError::Configuration("composition needs a tool invoker".to_string()))?;

        let mut previous = ctx.input.clone();
        let mut last = ToolOutput::new(previous.clone());
        for (i, step) in self.steps.iter().enumerate() {
            if ctx.cancellation.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let input = if step.input.is_null() {
                previous.clone()
            } else {
                Self::resolve(&step.input, &ctx.input, &previous)
            };

            tracing::debug!(tool = %self.name, step = i, callee = %step.tool, "Composition step");
            last = invoker
                .invoke_tool(&step.tool, ctx.with_input(input))
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("step {} ('{}'): {}", i, step.tool, e)))?;
            previous = last.value.clone();
        }
        Ok(last)
    }
}

pub struct CompositionFactory;

impl ToolFactory for CompositionFactory {
    fn create(&self, name: &str, spec: &ToolSpec) -> Result<Arc<dyn ToolHandler>, ToolError> {
        let ToolImplementation::Composition { steps } = &spec.implementation else {
            return Err(ToolError::Configuration(format!("'{}' is not a composition", name)));
        };
        if steps.is_empty() {
            return Err(ToolError::Configuration(format!("'{}' has no steps", name)));
        }
        if let Some(step) = steps.iter().find(|s| s.tool == name) {
            return Err(ToolError::Configuration(format!(
                "'{}' cannot call itself as a step",
                step.tool
            )));
        }
        Ok(Arc::new(CompositionTool {
            name: name.to_string(),
            description: spec.description.clone(),
            input_schema: spec.input_schema.clone(),
            steps: steps.clone(),
        }))
    }

    fn strategy(&self) -> ImplementationStrategy {
        ImplementationStrategy::Composition
    }

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata {
            description: "Tool that chains other tools".to_string(),
            category: "composition".to_string(),
        }
    }
}
