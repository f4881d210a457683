use async_trait::async_trait;
use chrono::TimeZone;
use machinecore::{
    AgentClient, AgentError, AgentRequest, AgentResponse, Annotation, Clock, Edge, ExecutionEvent,
    GraphDefinition, HistoryEntry, ImplementationStrategy, Limits, ManualClock, MutationKind, Node,
    NodeKind, PathStatus, ReasonCode, RunOutcome, ToolCall, ToolContext, ToolError, ToolHandler,
    ToolOutput, ToolSpec, TransitionTrigger, TRANSITION_TOOL,
};
use machineruntime::{
    load_definition, ControlGraph, MachineRuntime, RuntimeConfig, ToolFactory, ToolRegistry,
};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Agent double answering from a per-node script. Nodes without a script
/// take the first offered transition.
#[derive(Default)]
struct ScriptedAgent {
    scripts: Mutex<BTreeMap<String, VecDeque<AgentResponse>>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    fn with_script(self, node: &str, responses: Vec<AgentResponse>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(node.to_string(), responses.into());
        self
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(response) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.node)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }
        let first = request
            .tools
            .iter()
            .find(|t| t.name == TRANSITION_TOOL)
            .and_then(|t| t.input_schema["properties"]["target"]["enum"][0].as_str())
            .unwrap_or_default()
            .to_string();
        Ok(AgentResponse::default().with_call(ToolCall::transition("default", &first)))
    }
}

fn drain(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn barrier_edge(source: &str) -> Edge {
    Edge::new(source, "WaitPoint").with_annotation(Annotation::with_value("barrier", "sync"))
}

#[tokio::test]
async fn fetch_data_and_config_meet_at_the_barrier() {
    init_tracing();
    let definition = load_definition(
        r#"{
            "title": "Fetch",
            "attributes": [],
            "annotations": [],
            "nodes": [
                { "name": "FetchData", "kind": "entry" },
                { "name": "FetchConfig", "kind": "entry" },
                { "name": "WaitPoint", "kind": "control" },
                { "name": "Done", "kind": "control" }
            ],
            "edges": [
                { "source": "FetchData", "target": "WaitPoint",
                  "annotations": [{ "name": "barrier", "value": "sync" }] },
                { "source": "FetchConfig", "target": "WaitPoint",
                  "annotations": [{ "name": "barrier", "value": "sync" }] },
                { "source": "WaitPoint", "target": "Done" }
            ]
        }"#,
    )
    .unwrap();

    let runtime = MachineRuntime::new(Arc::new(ScriptedAgent::default()));
    let mut rx = runtime.subscribe_events();
    let state = runtime.start(definition).await.unwrap();
    assert_eq!(state.paths.len(), 2);

    let report = runtime.resume(state).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.state.count(PathStatus::Completed), 2);
    assert_eq!(report.state.count(PathStatus::Failed), 0);
    assert!(report.state.paths.iter().all(|p| p.current_node == "Done"));
    assert!(report.state.barriers.is_empty());

    let releases: Vec<(u64, usize)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::BarrierReleased { tick, released, .. } => Some((tick, released.len())),
            _ => None,
        })
        .collect();
    assert_eq!(releases, vec![(1, 2)]);
}

fn staggered(delayed: &str) -> GraphDefinition {
    let mut def = GraphDefinition::new("staggered");
    def.add_node(Node::new("FetchData", NodeKind::Entry))
        .add_node(Node::new("FetchConfig", NodeKind::Entry))
        .add_node(Node::new("Prepare", NodeKind::Control))
        .add_node(Node::new("WaitPoint", NodeKind::Control))
        .add_node(Node::new("Done", NodeKind::Control));
    for entry in ["FetchData", "FetchConfig"] {
        if entry == delayed {
            def.connect(entry, "Prepare").add_edge(barrier_edge("Prepare"));
        } else {
            def.add_edge(barrier_edge(entry));
        }
    }
    def.connect("WaitPoint", "Done");
    def
}

#[tokio::test]
async fn barrier_release_does_not_depend_on_arrival_order() {
    init_tracing();
    let mut results = Vec::new();
    for delayed in ["FetchData", "FetchConfig"] {
        let runtime = MachineRuntime::new(Arc::new(ScriptedAgent::default()));
        let mut rx = runtime.subscribe_events();
        let mut state = runtime.start(staggered(delayed)).await.unwrap();

        runtime.tick(&mut state).await.unwrap();
        assert_eq!(state.count(PathStatus::WaitingAtBarrier), 1);

        let report = runtime.resume(state).await.unwrap();
        let release_tick = drain(&mut rx).into_iter().find_map(|e| match e {
            ExecutionEvent::BarrierReleased { tick, .. } => Some(tick),
            _ => None,
        });
        results.push((release_tick, report.state.count(PathStatus::Completed), report.state.paths.len()));
    }

    assert_eq!(results[0], (Some(2), 2, 2));
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn acyclic_run_finishes_within_its_longest_path() {
    init_tracing();
    let mut def = GraphDefinition::new("acyclic");
    def.add_node(Node::new("Start", NodeKind::Entry))
        .add_node(Node::new("A", NodeKind::Control))
        .add_node(Node::new("B", NodeKind::Control))
        .add_node(Node::new("X", NodeKind::Control))
        .add_node(Node::new("C", NodeKind::Control))
        .add_edge(Edge::fork("Start", vec!["A", "X"]))
        .connect("A", "B")
        .connect("B", "C")
        .connect("X", "C");

    let bound = ControlGraph::build(&def).longest_path_from("Start").unwrap();
    assert_eq!(bound, 3);

    let runtime = MachineRuntime::new(Arc::new(ScriptedAgent::default()));
    let report = runtime.run(def).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.state.metadata.tick, bound as u64);
    assert_eq!(report.state.count(PathStatus::Forked), 1);
    assert_eq!(report.state.count(PathStatus::Completed), 2);
}

fn reads_of(state: &machinecore::ExecutionState, node: &str) -> Vec<serde_json::Value> {
    state
        .paths
        .iter()
        .flat_map(|p| p.history.iter())
        .filter_map(|entry| match entry {
            HistoryEntry::ToolCall {
                node: n,
                tool,
                output: Some(output),
                ..
            } if n == node && tool == "read_context" => Some(output.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn context_writes_become_visible_on_the_next_tick() {
    init_tracing();
    let mut def = GraphDefinition::new("context");
    def.add_node(Node::new("Writer", NodeKind::Decision).with_annotation(Annotation::flag("entry")))
        .add_node(Node::new("Reader1", NodeKind::Decision).with_annotation(Annotation::flag("entry")))
        .add_node(Node::new("Reader2", NodeKind::Decision))
        .add_node(Node::new("WDone", NodeKind::Control))
        .add_node(Node::new("RDone", NodeKind::Control))
        .add_node(Node::new("Notes", NodeKind::Context).with_attribute("flag", "unset"))
        .connect("Writer", "WDone")
        .connect("Writer", "Notes")
        .connect("Reader1", "Reader2")
        .connect("Reader2", "RDone")
        .connect("Notes", "Reader1")
        .connect("Notes", "Reader2");

    let read = |id: &str| ToolCall::new(id, "read_context", json!({ "node": "Notes" }));
    let agent = ScriptedAgent::default()
        .with_script(
            "Writer",
            vec![AgentResponse::default()
                .with_call(ToolCall::new(
                    "w",
                    "write_context",
                    json!({ "node": "Notes", "values": { "flag": "set" } }),
                ))
                .with_call(ToolCall::transition("t", "WDone"))],
        )
        .with_script(
            "Reader1",
            vec![AgentResponse::default()
                .with_call(read("r1"))
                .with_call(ToolCall::transition("t", "Reader2"))],
        )
        .with_script(
            "Reader2",
            vec![AgentResponse::default()
                .with_call(read("r2"))
                .with_call(ToolCall::transition("t", "RDone"))],
        );

    let runtime = MachineRuntime::new(Arc::new(agent));
    let report = runtime.run(def).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let same_tick = reads_of(&report.state, "Reader1");
    let next_tick = reads_of(&report.state, "Reader2");
    assert_eq!(same_tick[0]["values"]["flag"], json!("unset"));
    assert_eq!(same_tick[0]["version"], json!(0));
    assert_eq!(next_tick[0]["values"]["flag"], json!("set"));
    assert_eq!(next_tick[0]["version"], json!(1));
}

#[tokio::test]
async fn mutation_takes_effect_from_the_next_tick() {
    init_tracing();
    let mut def = GraphDefinition::new("mutation");
    def.add_node(
        Node::new("Planner", NodeKind::Decision)
            .with_annotation(Annotation::flag("entry"))
            .with_annotation(Annotation::flag("meta")),
    )
    .add_node(
        Node::new("Gate", NodeKind::Entry)
            .with_attribute("open", false)
            .with_annotation(Annotation::flag("hold")),
    )
    .add_node(Node::new("PDone", NodeKind::Control))
    .add_node(Node::new("Through", NodeKind::Control))
    .connect("Planner", "PDone")
    .add_edge(Edge::new("Gate", "Through").when("open"));

    let agent = ScriptedAgent::default().with_script(
        "Planner",
        vec![AgentResponse::default()
            .with_call(ToolCall::new(
                "m",
                "modify_node",
                json!({ "name": "Gate", "attributes": [{ "name": "open", "value": true }] }),
            ))
            .with_call(ToolCall::transition("t", "PDone"))],
    );

    let runtime = MachineRuntime::new(Arc::new(agent));
    let mut state = runtime.start(def).await.unwrap();

    let first = runtime.tick(&mut state).await.unwrap();
    assert_eq!(first.mutations_committed, 1);
    let gate = state.paths.iter().find(|p| p.current_node == "Gate").unwrap();
    assert_eq!(gate.status, PathStatus::Active);
    let gate_id = gate.id;

    runtime.tick(&mut state).await.unwrap();
    let gate = state.path(gate_id).unwrap();
    assert_eq!(gate.current_node, "Through");
    assert_eq!(gate.status, PathStatus::Completed);
    assert!(gate.history.iter().any(|e| matches!(
        e,
        HistoryEntry::Transition(t) if t.tick == 2 && t.to == "Through" && t.trigger == TransitionTrigger::Auto
    )));

    assert_eq!(state.mutations.len(), 1);
    assert_eq!(state.mutations[0].kind, MutationKind::ModifyNode);
    assert_eq!(state.mutations[0].tick, 1);
}

#[tokio::test]
async fn closed_guard_ends_the_path_in_one_tick() {
    init_tracing();
    let mut def = GraphDefinition::new("closed");
    def.add_node(Node::new("A", NodeKind::Entry))
        .add_node(Node::new("B", NodeKind::Control))
        .add_edge(Edge::new("A", "B").when("false"));

    let report = MachineRuntime::new(Arc::new(ScriptedAgent::default()))
        .run(def)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.state.metadata.tick, 1);
    assert_eq!(report.state.paths[0].current_node, "A");
    assert_eq!(report.state.paths[0].status, PathStatus::Completed);
}

#[tokio::test]
async fn cycle_fails_on_the_fourth_repeat() {
    init_tracing();
    let definition = load_definition(
        r#"{
            "title": "Loop",
            "attributes": [{ "name": "maxCycleRepeats", "value": 3 }],
            "annotations": [],
            "nodes": [
                { "name": "A", "kind": "entry" },
                { "name": "B", "kind": "control" }
            ],
            "edges": [
                { "source": "A", "target": "B" },
                { "source": "B", "target": "A" }
            ]
        }"#,
    )
    .unwrap();

    let runtime = MachineRuntime::new(Arc::new(ScriptedAgent::default()));
    let report = runtime.run(definition).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed);

    let path = &report.state.paths[0];
    let failure = path.failure.as_ref().unwrap();
    assert_eq!(failure.code, ReasonCode::CycleDetected);
    assert_eq!(failure.tick, 7);
    assert_eq!(failure.threshold, Some(3));
    assert_eq!(failure.actual, Some(4));

    let ab = path
        .history
        .iter()
        .filter(|e| matches!(e, HistoryEntry::Transition(t) if t.from == "A" && t.to == "B"))
        .count();
    assert_eq!(ab, 3);
}

fn choice_definition() -> GraphDefinition {
    let mut def = GraphDefinition::new("replay");
    def.add_node(Node::new("Start", NodeKind::Entry))
        .add_node(Node::new("Choose", NodeKind::Decision))
        .add_node(Node::new("Left", NodeKind::Control))
        .add_node(Node::new("Right", NodeKind::Control))
        .add_node(Node::new("Notes", NodeKind::Context).with_attribute("pick", ""))
        .connect("Start", "Choose")
        .connect("Choose", "Left")
        .connect("Choose", "Right")
        .connect("Choose", "Notes");
    def
}

fn choosing_agent() -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::default().with_script(
        "Choose",
        vec![AgentResponse::text("going right")
            .with_call(ToolCall::new(
                "w",
                "write_context",
                json!({ "node": "Notes", "values": { "pick": "right" } }),
            ))
            .with_call(ToolCall::transition("t", "Right"))],
    ))
}

#[tokio::test]
async fn restored_checkpoint_replays_identically() {
    init_tracing();
    let start = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start));
    let config = || RuntimeConfig::default().with_clock(clock.clone());

    let first = MachineRuntime::with_config(choosing_agent(), config());
    let mut state = first.start(choice_definition()).await.unwrap();
    first.tick(&mut state).await.unwrap();
    assert_eq!(state.paths[0].current_node, "Choose");

    let token = first.checkpoint(&state).unwrap();
    let direct = first.resume(state).await.unwrap();

    let second = MachineRuntime::with_config(choosing_agent(), config());
    let restored = second.restore(&token).await.unwrap();
    let replayed = second.resume(restored).await.unwrap();

    assert_eq!(direct.outcome, RunOutcome::Completed);
    assert_eq!(direct.state.paths[0].current_node, "Right");
    assert_eq!(
        serde_json::to_string(&direct.state).unwrap(),
        serde_json::to_string(&replayed.state).unwrap()
    );
    assert_eq!(
        first.checkpoint(&direct.state).unwrap(),
        second.checkpoint(&replayed.state).unwrap()
    );
}

#[tokio::test]
async fn cancellation_fails_remaining_paths() {
    init_tracing();
    let runtime = MachineRuntime::new(choosing_agent());
    let state = runtime.start(choice_definition()).await.unwrap();

    runtime.cancel();
    let report = runtime.resume(state).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(
        report.state.paths[0].failure.as_ref().unwrap().code,
        ReasonCode::Cancelled
    );
}

#[tokio::test]
async fn second_invalid_choice_fails_only_that_path() {
    init_tracing();
    let mut def = choice_definition();
    def.add_node(Node::new("Side", NodeKind::Entry))
        .add_node(Node::new("SideDone", NodeKind::Control))
        .connect("Side", "SideDone");
    let agent = Arc::new(ScriptedAgent::default().with_script(
        "Choose",
        vec![AgentResponse::text("Up"), AgentResponse::text("Down")],
    ));

    let report = MachineRuntime::new(agent).run(def).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Partial);
    let failed = report
        .state
        .paths
        .iter()
        .find(|p| p.status == PathStatus::Failed)
        .unwrap();
    assert_eq!(failed.failure.as_ref().unwrap().code, ReasonCode::AgentProtocol);
    assert_eq!(report.state.count(PathStatus::Completed), 1);
}

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

#[tokio::test]
async fn constructed_tool_is_callable_in_the_same_turn_and_persisted() {
    init_tracing();
    let mut def = GraphDefinition::new("builder");
    def.add_node(
        Node::new("Build", NodeKind::Decision)
            .with_annotation(Annotation::flag("entry"))
            .with_annotation(Annotation::flag("meta")),
    )
    .add_node(Node::new("Built", NodeKind::Control))
    .connect("Build", "Built");

    let agent = Arc::new(ScriptedAgent::default().with_script(
        "Build",
        vec![AgentResponse::default()
            .with_call(ToolCall::new(
                "c",
                "construct_tool",
                json!({
                    "name": "echo",
                    "description": "echoes its input",
                    "implementation": { "strategy": "agent", "prompt": "repeat" }
                }),
            ))
            .with_call(ToolCall::new("e", "echo", json!({ "word": "hi" })))
            .with_call(ToolCall::transition("t", "Built"))],
    ));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoFactory));
    let runtime = MachineRuntime::with_registry(agent, Arc::new(registry), RuntimeConfig::default());
    let report = runtime.run(def).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.state.definition.find_node("echo").is_some());
    assert_eq!(report.state.mutations[0].kind, MutationKind::ToolConstructed);
    assert!(runtime.registry().contains("echo").await);

    let echoed = report.state.paths[0].history.iter().find_map(|e| match e {
        HistoryEntry::ToolCall { tool, output, .. } if tool == "echo" => output.clone(),
        _ => None,
    });
    assert_eq!(echoed, Some(json!({ "word": "hi" })));
}

/// Agent that never answers.
struct Unresponsive;

#[async_trait]
impl AgentClient for Unresponsive {
    async fn invoke(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn run_timeout_cuts_off_an_unanswered_agent_call() {
    init_tracing();
    let config = RuntimeConfig::default().with_limits(Limits {
        timeout_ms: Some(100),
        ..Limits::default()
    });
    let runtime = MachineRuntime::with_config(Arc::new(Unresponsive), config);

    let report = tokio::time::timeout(Duration::from_secs(5), runtime.run(choice_definition()))
        .await
        .expect("run must not hang on an outstanding agent call")
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    let failure = report.state.paths[0].failure.as_ref().unwrap();
    assert_eq!(failure.code, ReasonCode::Timeout);
    assert_eq!(report.state.paths[0].current_node, "Choose");
}

#[tokio::test]
async fn path_timeout_fails_only_the_waiting_path() {
    init_tracing();
    let mut def = choice_definition()
        .with_attribute("timeout", 100.0)
        .with_attribute("timeoutScope", "path");
    def.add_node(Node::new("Side", NodeKind::Entry))
        .add_node(Node::new("SideDone", NodeKind::Control))
        .connect("Side", "SideDone");
    let runtime = MachineRuntime::new(Arc::new(Unresponsive));

    let report = tokio::time::timeout(Duration::from_secs(5), runtime.run(def))
        .await
        .expect("run must not hang on an outstanding agent call")
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Partial);
    let failed = report
        .state
        .paths
        .iter()
        .find(|p| p.status == PathStatus::Failed)
        .unwrap();
    assert_eq!(failed.current_node, "Choose");
    assert_eq!(failed.failure.as_ref().unwrap().code, ReasonCode::Timeout);
}

fn echo_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoFactory));
    Arc::new(registry)
}

#[tokio::test]
async fn constructed_tool_survives_a_restart() {
    init_tracing();
    let mut def = GraphDefinition::new("restart");
    def.add_node(
        Node::new("Build", NodeKind::Decision)
            .with_annotation(Annotation::flag("entry"))
            .with_annotation(Annotation::flag("meta")),
    )
    .add_node(Node::new("Use", NodeKind::Decision))
    .add_node(Node::new("Done", NodeKind::Control))
    .connect("Build", "Use")
    .connect("Use", "Done");

    let builder = Arc::new(ScriptedAgent::default().with_script(
        "Build",
        vec![AgentResponse::default()
            .with_call(ToolCall::new(
                "c",
                "construct_tool",
                json!({
                    "name": "echo",
                    "description": "echoes its input",
                    "implementation": { "strategy": "agent", "prompt": "repeat" }
                }),
            ))
            .with_call(ToolCall::transition("t", "Use"))],
    ));
    let first = MachineRuntime::with_registry(builder, echo_registry(), RuntimeConfig::default());
    let mut state = first.start(def).await.unwrap();
    first.tick(&mut state).await.unwrap();
    assert_eq!(state.paths[0].current_node, "Use");
    let token = first.checkpoint(&state).unwrap();
    drop(first);

    let user = Arc::new(ScriptedAgent::default().with_script(
        "Use",
        vec![AgentResponse::default()
            .with_call(ToolCall::new("e", "echo", json!({ "word": "again" })))
            .with_call(ToolCall::transition("t", "Done"))],
    ));
    let second = MachineRuntime::with_registry(user, echo_registry(), RuntimeConfig::default());
    assert!(!second.registry().contains("echo").await);

    let restored = second.restore(&token).await.unwrap();
    assert!(second.registry().contains("echo").await);

    let report = second.resume(restored).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let echoed = report.state.paths[0].history.iter().find_map(|e| match e {
        HistoryEntry::ToolCall { node, tool, output, .. } if node == "Use" && tool == "echo" => {
            output.clone()
        }
        _ => None,
    });
    assert_eq!(echoed, Some(json!({ "word": "again" })));
}
