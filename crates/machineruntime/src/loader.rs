use crate::sync::SynchronizationManager;
use machinecore::{annotations, GraphDefinition, Limits, MachineError};
use std::path::Path;

/// Parse a definition from its JSON form and run every load-time check:
/// structure, barrier configuration and machine-level limits.
pub fn load_definition(json: &str) -> Result<GraphDefinition, MachineError> {
    let definition: GraphDefinition = serde_json::from_str(json)?;
    check(&definition)?;
    tracing::info!(
        title = %definition.title,
        nodes = definition.all_nodes().len(),
        edges = definition.edges.len(),
        "Loaded definition"
    );
    Ok(definition)
}

pub async fn load_definition_file(path: impl AsRef<Path>) -> Result<GraphDefinition, MachineError> {
    let path = path.as_ref();
    tracing::debug!(path = %path.display(), "Reading definition");
    let raw = tokio::fs::read_to_string(path).await?;
    load_definition(&raw)
}

/// The checks `load_definition` runs, for definitions built in code.
pub fn check(definition: &GraphDefinition) -> Result<(), MachineError> {
    definition.validate()?;
    SynchronizationManager::validate(definition)?;
    annotations::machine_limits(definition, &Limits::default())?;
    Ok(())
}
