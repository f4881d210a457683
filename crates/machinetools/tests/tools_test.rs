use async_trait::async_trait;
use machinecore::{
    AgentClient, AgentError, AgentRequest, AgentResponse, CodeImplementation, CodeRunner,
    CompositionStep, EventEmitter, GraphDefinition, Node, ToolContext, ToolError,
    ToolImplementation, ToolInvoker, ToolOutput, ToolSpec,
};
use machineruntime::ToolRegistry;
use machinetools::{register_with_runner, ProcessCodeRunner};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Agent that upper-cases whatever follows "Input:" in the prompt.
#[derive(Default)]
struct Shouting {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl AgentClient for Shouting {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let input = request.prompt.rsplit("Input:\n").next().unwrap_or_default();
        let value: serde_json::Value = serde_json::from_str(input).unwrap_or_default();
        let text = value["text"].as_str().unwrap_or_default().to_uppercase();
        Ok(AgentResponse::text(json!({ "text": text }).to_string()))
    }
}

/// Runner that appends "!" to the `text` field and reports a fixed
/// confidence.
struct Exclaim(f64);

#[async_trait]
impl CodeRunner for Exclaim {
    async fn run(
        &self,
        _code: &CodeImplementation,
        input: serde_json::Value,
        _cancellation: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let text = format!("{}!", input["text"].as_str().unwrap_or_default());
        Ok(ToolOutput::new(json!({ "text": text })).with_confidence(self.0))
    }
}

fn definition(threshold: f64) -> GraphDefinition {
    let mut def = GraphDefinition::new("tools");
    def.add_node(Node::tool(
        "shout",
        ToolSpec {
            description: "upper-cases text".to_string(),
            input_schema: json!({ "type": "object", "properties": { "text": { "type": "string" } } }),
            implementation: ToolImplementation::Agent {
                prompt: "Upper-case the text field.".to_string(),
            },
        },
    ))
    .add_node(Node::tool(
        "exclaim",
        ToolSpec {
            description: "adds an exclamation mark".to_string(),
            input_schema: json!({ "type": "object" }),
            implementation: ToolImplementation::GeneratedCode(CodeImplementation {
                language: "python".to_string(),
                code: "import sys, json".to_string(),
                confidence_threshold: Some(threshold),
            }),
        },
    ))
    .add_node(Node::tool(
        "announce",
        ToolSpec {
            description: "shouts, then exclaims".to_string(),
            input_schema: json!({ "type": "object" }),
            implementation: ToolImplementation::Composition {
                steps: vec![
                    CompositionStep {
                        tool: "shout".to_string(),
                        input: json!({ "text": "$input.message" }),
                    },
                    CompositionStep {
                        tool: "exclaim".to_string(),
                        input: serde_json::Value::Null,
                    },
                ],
            },
        },
    ));
    def
}

async fn registry(threshold: f64, confidence: f64) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    register_with_runner(&mut registry, Arc::new(Exclaim(confidence)));
    assert_eq!(registry.list_strategies().len(), 3);
    let registry = Arc::new(registry);
    assert_eq!(registry.materialize(&definition(threshold)).await.unwrap(), 3);
    registry
}

fn context(registry: &Arc<ToolRegistry>, agent: Arc<Shouting>, input: serde_json::Value) -> ToolContext {
    let mut ctx = ToolContext::new(1, "Decide", input, EventEmitter::detached(1));
    ctx.agent = Some(agent);
    ctx.invoker = Some(registry.clone());
    ctx
}

#[tokio::test]
async fn agent_backed_tool_asks_the_agent() {
    let registry = registry(0.5, 0.9).await;
    let agent = Arc::new(Shouting::default());
    let ctx = context(&registry, agent.clone(), json!({ "text": "hello" }));

    let output = registry.invoke_tool("shout", ctx).await.unwrap();
    assert_eq!(output.value, json!({ "text": "HELLO" }));
    let prompts = agent.prompts.lock().unwrap();
    assert!(prompts[0].starts_with("Upper-case the text field."));
}

#[tokio::test]
async fn agent_backed_tool_without_agent_is_misconfigured() {
    let registry = registry(0.5, 0.9).await;
    let ctx = ToolContext::new(1, "Decide", json!({ "text": "x" }), EventEmitter::detached(1));
    let err = registry.invoke_tool("shout", ctx).await.unwrap_err();
    assert!(matches!(err, ToolError::Configuration(_)));
}

#[tokio::test]
async fn composition_chains_steps() {
    let registry = registry(0.5, 0.9).await;
    let ctx = context(&registry, Arc::new(Shouting::default()), json!({ "message": "go" }));

    let output = registry.invoke_tool("announce", ctx).await.unwrap();
    assert_eq!(output.value, json!({ "text": "GO!" }));
    assert_eq!(output.confidence, Some(0.9));
}

#[tokio::test]
async fn low_confidence_code_tool_falls_back_to_the_agent() {
    init_tracing();
    let registry = registry(0.8, 0.4).await;
    let agent = Arc::new(Shouting::default());
    let ctx = context(&registry, agent.clone(), json!({ "text": "hi" }));

    let output = registry.invoke_tool("exclaim", ctx).await.unwrap();
    assert_eq!(output.value, json!({ "text": "HI" }));
    assert!(output.refinement.unwrap().contains("below threshold"));
    assert!(agent.prompts.lock().unwrap()[0].starts_with("adds an exclamation mark"));
}

#[tokio::test]
async fn low_confidence_code_tool_without_agent_fails() {
    let registry = registry(0.8, 0.4).await;
    let mut ctx = ToolContext::new(1, "Decide", json!({ "text": "hi" }), EventEmitter::detached(1));
    ctx.invoker = Some(registry.clone());

    let err = registry.invoke_tool("exclaim", ctx).await.unwrap_err();
    assert!(matches!(err, ToolError::ExecutionFailed(_)));
}

#[tokio::test]
async fn code_tool_without_threshold_uses_the_default() {
    let mut def = GraphDefinition::new("defaults");
    def.add_node(Node::tool(
        "exclaim",
        ToolSpec {
            description: "adds an exclamation mark".to_string(),
            input_schema: json!({ "type": "object" }),
            implementation: ToolImplementation::GeneratedCode(CodeImplementation {
                language: "python".to_string(),
                code: "import sys, json".to_string(),
                confidence_threshold: None,
            }),
        },
    ));
    let mut registry = ToolRegistry::new();
    register_with_runner(&mut registry, Arc::new(Exclaim(0.5)));
    let registry = Arc::new(registry);
    registry.materialize(&def).await.unwrap();

    let ctx = context(&registry, Arc::new(Shouting::default()), json!({ "text": "hi" }));
    let output = registry.invoke_tool("exclaim", ctx).await.unwrap();
    assert_eq!(output.value, json!({ "text": "HI" }));
    assert!(output.refinement.is_some());
}

#[tokio::test]
async fn confident_code_tool_skips_the_agent() {
    let registry = registry(0.5, 0.9).await;
    let agent = Arc::new(Shouting::default());
    let ctx = context(&registry, agent.clone(), json!({ "text": "hi" }));

    let output = registry.invoke_tool("exclaim", ctx).await.unwrap();
    assert_eq!(output.value, json!({ "text": "hi!" }));
    assert!(output.refinement.is_none());
    assert!(agent.prompts.lock().unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_reads_stdin_and_reports_confidence() {
    let runner = ProcessCodeRunner::default();
    let code = CodeImplementation {
        language: "sh".to_string(),
        code: r#"read input; echo "{\"result\": $input, \"confidence\": 0.6}""#.to_string(),
        confidence_threshold: None,
    };

    let output = runner
        .run(&code, json!({ "target": "Done" }), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.value, json!({ "target": "Done" }));
    assert_eq!(output.confidence, Some(0.6));
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_times_out() {
    let runner = ProcessCodeRunner::new(Duration::from_millis(100));
    let code = CodeImplementation {
        language: "sh".to_string(),
        code: "sleep 5".to_string(),
        confidence_threshold: None,
    };

    let err = runner
        .run(&code, json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { millis: 100 }));
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_reports_failed_exit() {
    let runner = ProcessCodeRunner::default();
    let code = CodeImplementation {
        language: "bash".to_string(),
        code: "echo broken >&2; exit 3".to_string(),
        confidence_threshold: None,
    };

    let err = runner
        .run(&code, json!({}), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ToolError::ExecutionFailed(message) => assert!(message.contains("broken")),
        other => panic!("unexpected error: {other}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn process_runner_times_out_when_stdin_is_never_read() {
    init_tracing();
    let runner = ProcessCodeRunner::new(Duration::from_millis(200));
    let code = CodeImplementation {
        language: "sh".to_string(),
        code: "sleep 3".to_string(),
        confidence_threshold: None,
    };
    let input = json!({ "blob": "x".repeat(400_000) });

    let started = std::time::Instant::now();
    let err = runner
        .run(&code, input, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { millis: 200 }));
    assert!(started.elapsed() < Duration::from_secs(2));
}
