//! Standard tool library
//!
//! Handlers for each tool implementation strategy and the process-backed
//! runner for generated code.

mod agent;
mod code;
mod composition;
mod process;

pub use agent::{AgentBackedTool, AgentToolFactory};
pub use code::{GeneratedCodeFactory, GeneratedCodeTool};
pub use composition::{CompositionFactory, CompositionTool};
pub use process::ProcessCodeRunner;
use machinecore::CodeRunner;
use machineruntime::ToolRegistry;

use std::sync::Arc;

/// Register all standard tool factories with a registry
pub fn register_all(registry: &mut ToolRegistry) {
    register_with_runner(registry, Arc::new(ProcessCodeRunner::default()));
}

/// Register all standard tool factories, running generated code with
/// `runner`
pub fn register_with_runner(registry: &mut ToolRegistry, runner: Arc<dyn CodeRunner>) {
    registry.register(Arc::new(AgentToolFactory));
    registry.register(Arc::new(GeneratedCodeFactory::new(runner)));
    registry.register(Arc::new(CompositionFactory));
}
