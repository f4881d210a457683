use async_trait::async_trait;
use machinecore::{
    GraphDefinition, ImplementationStrategy, Node, ToolCatalogEntry, ToolContext, ToolError,
    ToolHandler, ToolInvoker, ToolOutput, ToolSpec,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Factory trait for turning a persisted tool node into a callable handler
pub trait ToolFactory: Send + Sync {
    /// Create a handler for the tool node `name` with the given spec
    fn create(&self, name: &str, spec: &ToolSpec) -> Result<Arc<dyn ToolHandler>, ToolError>;

    /// Implementation strategy this factory materializes
    fn strategy(&self) -> ImplementationStrategy;

    /// Optional: Get factory metadata
    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata::default()
    }
}

/// Metadata about a tool factory
#[derive(Debug, Clone)]
pub struct FactoryMetadata {
    pub description: String,
    pub category: String,
}

impl Default for FactoryMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of tool factories and the live handlers built from them.
///
/// Factories are registered up front; handlers are (re)built from the tool
/// nodes of a definition and may be added while a run is in progress.
pub struct ToolRegistry {
    factories: BTreeMap<ImplementationStrategy, Arc<dyn ToolFactory>>,
    handlers: RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a tool factory
    pub fn register(&mut self, factory: Arc<dyn ToolFactory>) {
        let strategy = factory.strategy();
        tracing::info!("Registering tool factory: {}", strategy);
        self.factories.insert(strategy, factory);
    }

    /// Register a ready-made handler under its own name
    pub async fn register_handler(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        tracing::debug!("Registering tool handler: {}", name);
        self.handlers.write().await.insert(name, handler);
    }

    /// Build and register the handler for one tool node
    pub async fn materialize_node(&self, node: &Node) -> Result<(), ToolError> {
        let spec = node
            .tool
            .as_ref()
            .ok_or_else(|| ToolError::Configuration(format!("'{}' is not a tool node", node.name)))?;
        let factory = self.factories.get(&spec.strategy()).ok_or_else(|| {
            ToolError::Configuration(format!(
                "no factory registered for strategy '{}'",
                spec.strategy()
            ))
        })?;
        let handler = factory.create(&node.name, spec)?;
        self.handlers.write().await.insert(node.name.clone(), handler);
        Ok(())
    }

    /// Re-materialize every tool node of a definition. Returns how many
    /// handlers were built.
    pub async fn materialize(&self, definition: &GraphDefinition) -> Result<usize, ToolError> {
        let tools = definition.tool_nodes();
        for node in &tools {
            self.materialize_node(node).await?;
        }
        tracing::info!(count = tools.len(), "Materialized tool nodes");
        Ok(tools.len())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Catalog entries for the named handlers that exist, in the given order
    pub async fn catalog(&self, names: &[String]) -> Vec<ToolCatalogEntry> {
        let handlers = self.handlers.read().await;
        names
            .iter()
            .filter_map(|name| handlers.get(name))
            .map(|handler| ToolCatalogEntry {
                name: handler.name().to_string(),
                description: handler.description().to_string(),
                input_schema: handler.input_schema(),
            })
            .collect()
    }

    /// Get all registered strategies
    pub fn list_strategies(&self) -> Vec<ImplementationStrategy> {
        self.factories.keys().copied().collect()
    }

    /// Get metadata for a strategy
    pub fn get_metadata(&self, strategy: ImplementationStrategy) -> Option<FactoryMetadata> {
        self.factories.get(&strategy).map(|f| f.metadata())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke_tool(&self, name: &str, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let handler = self
            .get(name)
            .await
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        handler.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinecore::{EventEmitter, ToolImplementation};

    struct Echo {
        name: String,
    }

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "echoes its input"
        }

        async fn execute(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(ctx.input))
        }
    }

    struct EchoFactory;

    impl ToolFactory for EchoFactory {
        fn create(&self, name: &str, _spec: &ToolSpec) -> Result<Arc<dyn ToolHandler>, ToolError> {
            Ok(Arc::new(Echo {
                name: name.to_string(),
            }))
        }

        fn strategy(&self) -> ImplementationStrategy {
            ImplementationStrategy::Agent
        }
    }

    fn spec() -> ToolSpec {
        ToolSpec {
            description: "echo".to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
            implementation: ToolImplementation::Agent {
                prompt: "repeat".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn materializes_tool_nodes_from_definition() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoFactory));

        let mut def = GraphDefinition::new("tools");
        def.add_node(Node::tool("echo", spec()));
        assert_eq!(registry.materialize(&def).await.unwrap(), 1);

        let ctx = ToolContext::new(1, "Decide", serde_json::json!({ "x": 1 }), EventEmitter::detached(1));
        let output = registry.invoke_tool("echo", ctx).await.unwrap();
        assert_eq!(output.value, serde_json::json!({ "x": 1 }));

        let catalog = registry.catalog(&["echo".to_string(), "missing".to_string()]).await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].description, "echoes its input");
    }

    #[tokio::test]
    async fn missing_factory_is_a_configuration_error() {
        let registry = ToolRegistry::new();
        let result = registry.materialize_node(&Node::tool("echo", spec())).await;
        assert!(matches!(result, Err(ToolError::Configuration(_))));
    }
}
