//! The effect boundary.
//!
//! The only place that performs I/O: runs generated code, talks to the
//! agent and calls tool handlers. Results are returned as plain values for
//! the scheduler to fold back; nothing here writes to the execution state.

use crate::context::{ContextError, ContextManager, ContextView, Permissions};
use crate::graph::ControlGraph;
use crate::mutation::MetaMutationManager;
use crate::registry::ToolRegistry;
use crate::scheduler::{EffectRequest, TickSnapshot};
use crate::transition::Candidate;
use futures::stream::{FuturesUnordered, StreamExt};
use machinecore::{
    AgentClient, AgentMessage, AgentRequest, CodeImplementation, CodeRunner, ContextWrite,
    EventBus, ExecutionEvent, ExecutionId, GraphDefinition, HistoryEntry, Limits, MutationOp,
    Node, NodeConfig, NodeKind, PathEvent, PathId, ReasonCode, RefinementSignal, StaleWritePolicy, ToolCall,
    ToolCatalogEntry, ToolContext, ToolInvoker, ToolSpec, TransitionTrigger, Value,
    TRANSITION_TOOL,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

pub const READ_CONTEXT_TOOL: &str = "read_context";
pub const WRITE_CONTEXT_TOOL: &str = "write_context";
pub const GET_DEFINITION_TOOL: &str = "get_definition";
pub const UPDATE_DEFINITION_TOOL: &str = "update_definition";
pub const ADD_NODE_TOOL: &str = "add_node";
pub const MODIFY_NODE_TOOL: &str = "modify_node";
pub const ADD_EDGE_TOOL: &str = "add_edge";
pub const CONSTRUCT_TOOL_TOOL: &str = "construct_tool";

/// The transition a decision settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct ChosenTransition {
    pub edge: usize,
    pub target: String,
    pub trigger: TransitionTrigger,
    pub output: Option<serde_json::Value>,
}

/// Everything one effect produced.
#[derive(Debug, Clone, Default)]
pub struct EffectOutcome {
    pub path_id: PathId,
    pub transition: Option<ChosenTransition>,
    pub history: Vec<HistoryEntry>,
    pub refinements: Vec<RefinementSignal>,
    pub context_writes: Vec<ContextWrite>,
    pub mutations: Vec<MutationOp>,
    pub failure: Option<(ReasonCode, String)>,
    /// The run or path timeout ran out while this effect was outstanding.
    pub expired: bool,
}

impl EffectOutcome {
    fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            ..Self::default()
        }
    }

    fn fail(&mut self, code: ReasonCode, message: impl Into<String>) {
        self.failure = Some((code, message.into()));
    }
}

/// Per-call scratch state of one agent conversation.
struct Turn<'a> {
    request: &'a EffectRequest,
    snapshot: &'a TickSnapshot,
    execution_id: ExecutionId,
    policy: StaleWritePolicy,
    permissions: BTreeMap<String, Permissions>,
    meta: bool,
    tools: Vec<String>,
    working: GraphDefinition,
    view: ContextView,
    outcome: EffectOutcome,
}

impl Turn<'_> {
    fn record_tool_call(&mut self, call: &ToolCall, result: &Result<serde_json::Value, String>) {
        let (output, error) = match result {
            Ok(value) => (Some(value.clone()), None),
            Err(e) => (None, Some(e.clone())),
        };
        self.outcome.history.push(HistoryEntry::ToolCall {
            tick: self.snapshot.tick,
            node: self.request.node.clone(),
            tool: call.name.clone(),
            input: call.input.clone(),
            output,
            error,
            timestamp: self.snapshot.now,
        });
    }

    fn find_candidate(&self, target: &str) -> Option<&Candidate> {
        self.request.candidates.iter().find(|c| c.target == target)
    }

    fn candidate_names(&self) -> Vec<&str> {
        self.request
            .candidates
            .iter()
            .map(|c| c.target.as_str())
            .collect()
    }
}

pub struct EffectExecutor {
    agent: Arc<dyn AgentClient>,
    registry: Arc<ToolRegistry>,
    code_runner: Option<Arc<dyn CodeRunner>>,
    events: Arc<EventBus>,
    cancellation: CancellationToken,
}

impl EffectExecutor {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        registry: Arc<ToolRegistry>,
        code_runner: Option<Arc<dyn CodeRunner>>,
        events: Arc<EventBus>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            agent,
            registry,
            code_runner,
            events,
            cancellation,
        }
    }

    /// Run every request concurrently and return the outcomes in request
    /// order.
    pub async fn execute_all(
        &self,
        requests: Vec<EffectRequest>,
        snapshot: &TickSnapshot,
        limits: &Limits,
        execution_id: ExecutionId,
    ) -> Vec<EffectOutcome> {
        let mut running = FuturesUnordered::new();
        for (i, request) in requests.into_iter().enumerate() {
            running.push(async move {
                let path_id = request.path_id;
                let Some(budget) = request.budget else {
                    return (i, self.execute(request, snapshot, limits, execution_id).await);
                };
                match timeout(budget, self.execute(request, snapshot, limits, execution_id)).await {
                    Ok(outcome) => (i, outcome),
                    Err(_) => {
                        tracing::warn!(path_id, budget_ms = budget.as_millis() as u64, "effect outlived the timeout; result discarded");
                        let mut outcome = EffectOutcome::new(path_id);
                        outcome.fail(
                            ReasonCode::Timeout,
                            format!("no decision within the remaining {}ms", budget.as_millis()),
                        );
                        outcome.expired = true;
                        (i, outcome)
                    }
                }
            });
        }

        let mut outcomes = Vec::with_capacity(running.len());
        while let Some(result) = running.next().await {
            outcomes.push(result);
        }
        outcomes.sort_by_key(|(i, _)| *i);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Resolve one decision: generated code first when the node has it,
    /// then the agent.
    pub async fn execute(
        &self,
        request: EffectRequest,
        snapshot: &TickSnapshot,
        limits: &Limits,
        execution_id: ExecutionId,
    ) -> EffectOutcome {
        let mut outcome = EffectOutcome::new(request.path_id);
        let Some(node) = snapshot.definition.find_node(&request.node) else {
            outcome.fail(
                ReasonCode::AgentFailure,
                format!("node '{}' not found in snapshot", request.node),
            );
            return outcome;
        };

        if let Some(code) = &node.code {
            match self.try_code(&request, node, code, snapshot, limits).await {
                Ok(choice) => {
                    tracing::debug!(path_id = request.path_id, target = %choice.target, "generated code chose transition");
                    outcome.transition = Some(choice);
                    return outcome;
                }
                Err(reason) => {
                    tracing::warn!(path_id = request.path_id, node = %node.name, "generated code demoted to agent: {}", reason.0);
                    outcome.history.push(HistoryEntry::Refinement {
                        tick: snapshot.tick,
                        node: node.name.clone(),
                        reason: reason.0.clone(),
                        timestamp: snapshot.now,
                    });
                    outcome.refinements.push(RefinementSignal {
                        tick: snapshot.tick,
                        path_id: request.path_id,
                        node: node.name.clone(),
                        reason: reason.0,
                        confidence: reason.1,
                    });
                }
            }
        }

        self.run_agent(&request, node, snapshot, limits, execution_id, outcome)
            .await
    }

    /// Run a node's generated code. The error carries the refinement reason
    /// and the reported confidence, if any.
    async fn try_code(
        &self,
        request: &EffectRequest,
        node: &Node,
        code: &CodeImplementation,
        snapshot: &TickSnapshot,
        limits: &Limits,
    ) -> Result<ChosenTransition, (String, Option<f64>)> {
        let runner = self
            .code_runner
            .as_ref()
            .ok_or_else(|| ("no code runner configured".to_string(), None))?;
        let threshold = code.confidence_threshold.unwrap_or(limits.confidence_threshold);

        let context: serde_json::Map<String, serde_json::Value> = snapshot
            .context
            .iter()
            .filter(|(name, _)| ContextManager::permissions(&snapshot.definition, &node.name, name).read)
            .map(|(name, entry)| (name.clone(), Value::Object(entry.values.clone()).to_json()))
            .collect();
        let input = json!({
            "node": node.name,
            "attributes": node.attribute_object().to_json(),
            "candidates": request.candidates.iter().map(|c| c.target.clone()).collect::<Vec<_>>(),
            "context": context,
        });

        let output = runner
            .run(code, input, self.cancellation.child_token())
            .await
            .map_err(|e| (format!("generated code failed: {}", e), None))?;

        // Code that reports no confidence is taken at its word.
        let confidence = output.confidence.unwrap_or(1.0);
        if confidence < threshold {
            return Err((
                format!("confidence {:.2} below threshold {:.2}", confidence, threshold),
                Some(confidence),
            ));
        }

        let target = output
            .value
            .get("target")
            .and_then(|t| t.as_str())
            .or_else(|| output.value.as_str())
            .unwrap_or_default();
        let candidate = request
            .candidates
            .iter()
            .find(|c| c.target == target)
            .ok_or_else(|| {
                (
                    format!("generated code chose '{}', which is not an open transition", target),
                    Some(confidence),
                )
            })?;

        Ok(ChosenTransition {
            edge: candidate.edge,
            target: candidate.target.clone(),
            trigger: TransitionTrigger::Code,
            output: Some(output.value),
        })
    }

    async fn run_agent(
        &self,
        request: &EffectRequest,
        node: &Node,
        snapshot: &TickSnapshot,
        limits: &Limits,
        execution_id: ExecutionId,
        outcome: EffectOutcome,
    ) -> EffectOutcome {
        let definition = &snapshot.definition;
        let config = NodeConfig::from_node(node);
        let permissions = definition
            .all_nodes()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Context)
            .map(|n| (n.name.clone(), ContextManager::permissions(definition, &node.name, &n.name)))
            .filter(|(_, p)| p.any())
            .collect();

        let mut turn = Turn {
            request,
            snapshot,
            execution_id,
            policy: limits.stale_writes,
            permissions,
            meta: config.meta,
            tools: ControlGraph::build(definition).reachable_tools(definition, &node.name),
            working: definition.as_ref().clone(),
            view: ContextView::new(request.path_id, snapshot.context.clone()),
            outcome,
        };

        let prompt = Self::prompt(node, &request.candidates);
        let mut conversation = vec![AgentMessage::user(prompt.clone())];
        let mut rejections = 0;

        self.events.emit(ExecutionEvent::AgentInvoked {
            execution_id,
            path_id: request.path_id,
            node: node.name.clone(),
            candidates: request.candidates.len(),
        });

        for _ in 0..limits.max_agent_turns {
            let agent_request = AgentRequest {
                path_id: request.path_id,
                node: node.name.clone(),
                prompt: prompt.clone(),
                tools: self.catalog(&turn).await,
                conversation: conversation.clone(),
            };

            let response = match self.invoke_agent(agent_request, &config).await {
                Ok(response) => response,
                Err((code, message)) => {
                    turn.outcome.fail(code, message);
                    return turn.outcome;
                }
            };
            if self.cancellation.is_cancelled() {
                turn.outcome.fail(ReasonCode::Cancelled, "run cancelled");
                return turn.outcome;
            }

            conversation.push(AgentMessage::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            let mut chosen: Option<Candidate> = None;
            let mut rejected = false;
            for call in &response.tool_calls {
                if call.name == TRANSITION_TOOL {
                    let target = call
                        .input
                        .get("target")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    let reply = match (turn.find_candidate(target).cloned(), &chosen) {
                        (Some(candidate), None) => {
                            chosen = Some(candidate);
                            "transition accepted".to_string()
                        }
                        (Some(_), Some(first)) => {
                            format!("ignored: already moving to '{}'", first.target)
                        }
                        (None, _) => {
                            rejected = true;
                            format!(
                                "rejected: '{}' is not an open transition; choose one of {:?}",
                                target,
                                turn.candidate_names()
                            )
                        }
                    };
                    conversation.push(AgentMessage::tool_result(call.id.clone(), reply));
                    continue;
                }

                let result = self.call_tool(&mut turn, call).await;
                turn.record_tool_call(call, &result);
                let content = match &result {
                    Ok(value) => value.to_string(),
                    Err(e) => format!("error: {}", e),
                };
                conversation.push(AgentMessage::tool_result(call.id.clone(), content));
            }

            if chosen.is_none() && response.tool_calls.is_empty() {
                match turn.find_candidate(response.text.trim()).cloned() {
                    Some(candidate) => chosen = Some(candidate),
                    None => {
                        rejected = true;
                        conversation.push(AgentMessage::user(format!(
                            "Choose the next step by calling `{}` with one of {:?}.",
                            TRANSITION_TOOL,
                            turn.candidate_names()
                        )));
                    }
                }
            }

            if let Some(candidate) = chosen {
                let output = (!response.text.is_empty()).then(|| json!({ "text": response.text }));
                let mut outcome = turn.outcome;
                outcome.transition = Some(ChosenTransition {
                    edge: candidate.edge,
                    target: candidate.target,
                    trigger: TransitionTrigger::Agent,
                    output,
                });
                outcome.context_writes = turn.view.into_writes();
                return outcome;
            }

            if rejected {
                rejections += 1;
                tracing::warn!(path_id = request.path_id, node = %node.name, rejections, "agent chose an invalid transition");
                if rejections >= 2 {
                    turn.outcome.fail(
                        ReasonCode::AgentProtocol,
                        format!(
                            "agent chose an invalid transition twice; open transitions were {:?}",
                            turn.candidate_names()
                        ),
                    );
                    return turn.outcome;
                }
            }
        }

        let error = machinecore::AgentError::TurnsExhausted(limits.max_agent_turns);
        turn.outcome.fail(ReasonCode::AgentProtocol, error.to_string());
        turn.outcome
    }

    /// One agent call, bounded by the node's `@timeout` and retried per its
    /// `@retry`.
    async fn invoke_agent(
        &self,
        request: AgentRequest,
        config: &NodeConfig,
    ) -> Result<machinecore::AgentResponse, (ReasonCode, String)> {
        let attempts = config.retry.unwrap_or(0) + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let call = self.agent.invoke(request.clone());
            let result = match config.timeout_ms {
                Some(ms) => match timeout(Duration::from_millis(ms), call).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err((ReasonCode::Timeout, format!("agent call exceeded {}ms", ms)))
                    }
                },
                None => call.await,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(attempt, attempts, "agent invocation failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }
        Err((ReasonCode::AgentFailure, last_error))
    }

    fn prompt(node: &Node, candidates: &[Candidate]) -> String {
        let base = node
            .attribute("prompt")
            .or_else(|| node.attribute("description"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| format!("You are at '{}'.", node.name));
        let options: Vec<String> = candidates
            .iter()
            .map(|c| match &c.label {
                Some(label) => format!("{} ({})", c.target, label),
                None => c.target.clone(),
            })
            .collect();
        format!("{}\nNext steps: {}", base, options.join(", "))
    }

    async fn catalog(&self, turn: &Turn<'_>) -> Vec<ToolCatalogEntry> {
        let targets = turn.candidate_names();
        let mut catalog = vec![ToolCatalogEntry {
            name: TRANSITION_TOOL.to_string(),
            description: "Move to the next node. Call exactly once.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "target": { "type": "string", "enum": targets } },
                "required": ["target"],
            }),
        }];
        catalog.extend(self.registry.catalog(&turn.tools).await);

        let readable: Vec<&String> = turn
            .permissions
            .iter()
            .filter(|(_, p)| p.read)
            .map(|(n, _)| n)
            .collect();
        let writable: Vec<&String> = turn
            .permissions
            .iter()
            .filter(|(_, p)| p.can_write())
            .map(|(n, _)| n)
            .collect();
        if !readable.is_empty() {
            catalog.push(ToolCatalogEntry {
                name: READ_CONTEXT_TOOL.to_string(),
                description: "Read the committed values of a context node.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "node": { "type": "string", "enum": readable } },
                    "required": ["node"],
                }),
            });
        }
        if !writable.is_empty() {
            catalog.push(ToolCatalogEntry {
                name: WRITE_CONTEXT_TOOL.to_string(),
                description: "Stage values on a context node; visible to other paths next tick.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "node": { "type": "string", "enum": writable },
                        "values": { "type": "object" },
                        "version": { "type": "integer" },
                    },
                    "required": ["node", "values"],
                }),
            });
        }
        if turn.meta {
            for (name, description) in [
                (GET_DEFINITION_TOOL, "Return the current machine definition."),
                (UPDATE_DEFINITION_TOOL, "Replace the whole definition; takes effect next tick."),
                (ADD_NODE_TOOL, "Add a node, optionally under a parent."),
                (MODIFY_NODE_TOOL, "Change a node's kind, attributes or annotations."),
                (ADD_EDGE_TOOL, "Add an edge between existing nodes."),
                (CONSTRUCT_TOOL_TOOL, "Define a persistent tool, callable immediately."),
            ] {
                catalog.push(ToolCatalogEntry {
                    name: name.to_string(),
                    description: description.to_string(),
                    input_schema: json!({ "type": "object" }),
                });
            }
        }
        catalog
    }

    async fn call_tool(&self, turn: &mut Turn<'_>, call: &ToolCall) -> Result<serde_json::Value, String> {
        match call.name.as_str() {
            READ_CONTEXT_TOOL => Self::read_context(turn, &call.input).map_err(|e| e.to_string()),
            WRITE_CONTEXT_TOOL => Self::write_context(turn, &call.input).map_err(|e| e.to_string()),
            GET_DEFINITION_TOOL if turn.meta => {
                serde_json::to_value(&turn.working).map_err(|e| e.to_string())
            }
            UPDATE_DEFINITION_TOOL | ADD_NODE_TOOL | MODIFY_NODE_TOOL | ADD_EDGE_TOOL
            | CONSTRUCT_TOOL_TOOL
                if turn.meta =>
            {
                self.mutate(turn, &call.name, &call.input).await
            }
            name if turn.tools.iter().any(|t| t == name) => {
                let events = self.events.create_emitter(turn.execution_id, turn.request.path_id);
                let mut ctx = ToolContext::new(
                    turn.request.path_id,
                    turn.request.node.clone(),
                    call.input.clone(),
                    events.clone(),
                );
                ctx.cancellation = self.cancellation.child_token();
                ctx.agent = Some(self.agent.clone());
                ctx.invoker = Some(self.registry.clone() as Arc<dyn ToolInvoker>);

                let result = self.registry.invoke_tool(name, ctx).await;
                events.emit(PathEvent::ToolInvoked {
                    tool: name.to_string(),
                    succeeded: result.is_ok(),
                });
                let output = result.map_err(|e| e.to_string())?;
                if let Some(reason) = output.refinement.clone() {
                    tracing::info!(tool = %name, %reason, "tool fell back from its generated code");
                    turn.outcome.refinements.push(RefinementSignal {
                        tick: turn.snapshot.tick,
                        path_id: turn.request.path_id,
                        node: name.to_string(),
                        reason,
                        confidence: output.confidence,
                    });
                }
                Ok(output.value)
            }
            other => Err(format!("unknown tool '{}'", other)),
        }
    }

    fn read_context(turn: &Turn<'_>, input: &serde_json::Value) -> Result<serde_json::Value, ContextError> {
        let node = input.get("node").and_then(|n| n.as_str()).unwrap_or_default();
        let perms = turn.permissions.get(node).filter(|p| p.read).ok_or_else(|| {
            ContextError::PermissionDenied {
                decision: turn.request.node.clone(),
                node: node.to_string(),
                access: "read",
            }
        })?;
        let entry = turn.view.read(node).ok_or_else(|| ContextError::UnknownNode {
            node: node.to_string(),
        })?;
        let values: BTreeMap<String, Value> = entry
            .values
            .into_iter()
            .filter(|(k, _)| perms.allows_field(k))
            .collect();
        Ok(json!({
            "node": node,
            "version": entry.version,
            "values": Value::Object(values).to_json(),
        }))
    }

    fn write_context(turn: &mut Turn<'_>, input: &serde_json::Value) -> Result<serde_json::Value, ContextError> {
        let node = input.get("node").and_then(|n| n.as_str()).unwrap_or_default();
        let perms = turn
            .permissions
            .get(node)
            .filter(|p| p.can_write())
            .ok_or_else(|| ContextError::PermissionDenied {
                decision: turn.request.node.clone(),
                node: node.to_string(),
                access: "write",
            })?;

        let values: BTreeMap<String, Value> = match input.get("values") {
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
            _ => BTreeMap::new(),
        };
        if let Some(field) = values.keys().find(|k| !perms.allows_field(k)) {
            return Err(ContextError::FieldDenied {
                decision: turn.request.node.clone(),
                node: node.to_string(),
                field: field.clone(),
            });
        }

        let base = input.get("version").and_then(|v| v.as_u64());
        let version = turn.view.stage(node, values, base, turn.policy)?;
        Ok(json!({ "staged": true, "node": node, "base_version": version }))
    }

    async fn mutate(
        &self,
        turn: &mut Turn<'_>,
        tool: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let op = Self::parse_op(tool, input).map_err(|e| format!("malformed request: {}", e))?;
        let kind = op.kind();

        match MetaMutationManager::apply(&op, &turn.working) {
            Ok(next) => {
                turn.working = next;
                if let MutationOp::ConstructTool { name, .. } = &op {
                    if let Some(node) = turn.working.find_node(name) {
                        self.registry
                            .materialize_node(node)
                            .await
                            .map_err(|e| format!("tool recorded but not callable: {}", e))?;
                    }
                    if !turn.tools.contains(name) {
                        turn.tools.push(name.clone());
                    }
                }
                tracing::info!(path_id = turn.request.path_id, ?kind, "mutation accepted");
                turn.outcome.mutations.push(op);
                Ok(json!({ "accepted": true, "kind": kind, "effective": "next tick" }))
            }
            Err(e) => {
                tracing::warn!(path_id = turn.request.path_id, ?kind, error = %e, "mutation rejected");
                self.events.emit(ExecutionEvent::MutationRejected {
                    execution_id: turn.execution_id,
                    reason: e.to_string(),
                    tick: turn.snapshot.tick,
                });
                Err(format!("rejected: {}", e))
            }
        }
    }

    fn parse_op(tool: &str, input: &serde_json::Value) -> Result<MutationOp, serde_json::Error> {
        if tool == CONSTRUCT_TOOL_TOOL {
            let name: String = serde_json::from_value(input.get("name").cloned().unwrap_or_default())?;
            let spec: ToolSpec = serde_json::from_value(input.clone())?;
            return Ok(MutationOp::ConstructTool { name, spec });
        }
        let op = match tool {
            UPDATE_DEFINITION_TOOL => "replace_definition",
            other => other,
        };
        let mut payload = match input {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert("op".to_string(), json!(op));
        serde_json::from_value(serde_json::Value::Object(payload))
    }
}
