use crate::checkpoint::{CheckpointToken, StateManager};
use crate::context::ContextManager;
use crate::effects::EffectExecutor;
use crate::graph::ControlGraph;
use crate::loader;
use crate::mutation::MetaMutationManager;
use crate::registry::ToolRegistry;
use crate::scheduler::{PathScheduler, TickSnapshot};
use machinecore::{
    annotations, AgentClient, Clock, CodeRunner, DefinitionError, EventBus, ExecutionEvent,
    ExecutionState, GraphDefinition, Limits, MachineError, PathFailure, ReasonCode, RunOutcome,
    RunReport, SystemClock, TimeoutScope,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing machines
pub struct MachineRuntime {
    registry: Arc<ToolRegistry>,
    event_bus: Arc<EventBus>,
    scheduler: PathScheduler,
    executor: EffectExecutor,
    states: StateManager,
    config: RuntimeConfig,
    cancellation: CancellationToken,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// Agent or generated-code decisions resolved during the tick.
    pub effects: usize,
    pub context_writes: usize,
    pub mutations_committed: usize,
    pub mutations_rejected: usize,
    pub finished: bool,
}

impl MachineRuntime {
    /// Create a new runtime with default settings
    pub fn new(agent: Arc<dyn AgentClient>) -> Self {
        Self::with_config(agent, RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(agent: Arc<dyn AgentClient>, config: RuntimeConfig) -> Self {
        Self::with_registry(agent, Arc::new(ToolRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(
        agent: Arc<dyn AgentClient>,
        registry: Arc<ToolRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let cancellation = CancellationToken::new();
        let executor = EffectExecutor::new(
            agent,
            registry.clone(),
            config.code_runner.clone(),
            event_bus.clone(),
            cancellation.clone(),
        );

        Self {
            registry,
            scheduler: PathScheduler::new(event_bus.clone()),
            event_bus,
            executor,
            states: StateManager::new(),
            config,
            cancellation,
        }
    }

    /// Use a state manager with registered checkpoint migrations
    pub fn with_state_manager(mut self, states: StateManager) -> Self {
        self.states = states;
        self
    }

    /// Get access to the tool registry
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Validate a definition and build the initial state: limits resolved,
    /// tool nodes materialized, context seeded, one path per entry node.
    pub async fn start(&self, definition: GraphDefinition) -> Result<ExecutionState, MachineError> {
        loader::check(&definition)?;
        let limits = annotations::machine_limits(&definition, &self.config.limits)?;
        if definition.entry_nodes().is_empty() {
            return Err(DefinitionError::Invalid("no entry node".to_string()).into());
        }
        self.registry.materialize(&definition).await?;

        let graph = ControlGraph::build(&definition);
        for entry in definition.entry_nodes() {
            match graph.longest_path_from(&entry.name) {
                Some(bound) if bound as u64 > limits.max_path_steps => tracing::warn!(
                    entry = %entry.name,
                    bound,
                    max_path_steps = limits.max_path_steps,
                    "longest path from entry exceeds the per-path step limit"
                ),
                Some(bound) => tracing::debug!(entry = %entry.name, bound, "acyclic from entry"),
                None => tracing::debug!(entry = %entry.name, "cycles reachable from entry"),
            }
        }

        let now = self.config.clock.now();
        let mut state = ExecutionState::new(Arc::new(definition), limits, now);
        let definition = state.definition.clone();
        ContextManager::seed(&mut state.context, &definition);
        let paths = self.scheduler.spawn_entries(&mut state, now);

        tracing::info!(
            run_id = %state.metadata.run_id,
            title = %definition.title,
            paths = paths.len(),
            "Run started"
        );
        self.event_bus.emit(ExecutionEvent::RunStarted {
            execution_id: state.metadata.run_id,
            title: definition.title.clone(),
            paths: paths.len(),
            timestamp: now,
        });
        Ok(state)
    }

    /// Advance the run by one tick.
    pub async fn tick(&self, state: &mut ExecutionState) -> Result<TickReport, MachineError> {
        if state.is_finished() {
            return Ok(TickReport {
                tick: state.metadata.tick,
                finished: true,
                ..TickReport::default()
            });
        }

        state.metadata.tick += 1;
        let tick = state.metadata.tick;
        let execution_id = state.metadata.run_id;
        let snapshot = TickSnapshot::capture(state, tick, self.config.clock.now());

        if self.cancellation.is_cancelled() {
            let failure = PathFailure::new(
                ReasonCode::Cancelled,
                String::new(),
                "run cancelled",
                tick,
                snapshot.now,
            );
            self.scheduler.abort(state, failure);
            return Ok(self.finish_tick(state, TickReport::default()));
        }

        self.event_bus.emit(ExecutionEvent::TickStarted {
            execution_id,
            tick,
            active_paths: state.paths.iter().filter(|p| p.is_active()).count(),
        });

        let requests = self.scheduler.step(state, &snapshot);
        let mut report = TickReport {
            effects: requests.len(),
            ..TickReport::default()
        };

        let outcomes = if requests.is_empty() {
            Vec::new()
        } else {
            let limits = state.limits.clone();
            self.executor
                .execute_all(requests, &snapshot, &limits, execution_id)
                .await
        };

        if state.limits.timeout_scope == TimeoutScope::Run && outcomes.iter().any(|o| o.expired) {
            let timeout_ms = state.limits.timeout_ms.unwrap_or_default();
            tracing::warn!(timeout_ms, "run timed out with effects outstanding");
            let failure = PathFailure::new(
                ReasonCode::Timeout,
                String::new(),
                format!("run exceeded {}ms with agent calls outstanding", timeout_ms),
                tick,
                self.config.clock.now(),
            );
            self.scheduler.abort(state, failure);
        }

        // Time spent waiting on effects counts against timeouts.
        let settled = self.config.clock.now();
        if settled != snapshot.now {
            let late = TickSnapshot {
                now: settled,
                ..snapshot.clone()
            };
            self.scheduler.check_timeouts(state, &late);
        }

        let folded = self.scheduler.apply_outcomes(state, outcomes, &snapshot);

        let policy = state.limits.stale_writes;
        let commit = ContextManager::commit(&mut state.context, folded.writes, policy);
        report.context_writes = commit.applied.len();
        for (write, error) in commit.rejected {
            tracing::warn!(path_id = write.path_id, node = %write.node, "context write rejected: {}", error);
            if let Some(path) = state.path_mut(write.path_id) {
                path.record_warning(tick, format!("context write rejected: {}", error), snapshot.now);
            }
        }

        let mutations = MetaMutationManager::commit(state, folded.mutations, snapshot.now);
        report.mutations_committed = mutations.committed.len();
        report.mutations_rejected = mutations.rejected.len();
        for mutation in &mutations.committed {
            self.event_bus.emit(ExecutionEvent::MutationCommitted {
                execution_id,
                kind: mutation.kind,
                tick,
            });
        }
        for (path_id, kind, error) in &mutations.rejected {
            if let Some(path) = state.path_mut(*path_id) {
                path.record_warning(tick, format!("{:?} rejected at commit: {}", kind, error), snapshot.now);
            }
            self.event_bus.emit(ExecutionEvent::MutationRejected {
                execution_id,
                reason: error.to_string(),
                tick,
            });
        }
        if !mutations.committed.is_empty() {
            let definition = state.definition.clone();
            ContextManager::seed(&mut state.context, &definition);
            for name in &mutations.tools {
                if let Some(node) = definition.find_node(name) {
                    if let Err(e) = self.registry.materialize_node(node).await {
                        tracing::warn!(tool = %name, "committed tool could not be materialized: {}", e);
                    }
                }
            }
            tracing::info!(tick, committed = mutations.committed.len(), "Definition snapshot replaced");
        }

        self.scheduler.resolve_deadlocks(state, &snapshot);
        Ok(self.finish_tick(state, report))
    }

    fn finish_tick(&self, state: &ExecutionState, mut report: TickReport) -> TickReport {
        let tick = state.metadata.tick;
        report.tick = tick;
        report.finished = state.is_finished();
        self.event_bus.emit(ExecutionEvent::TickCompleted {
            execution_id: state.metadata.run_id,
            tick,
            effects: report.effects,
        });

        if report.finished {
            let outcome = state.outcome().unwrap_or(RunOutcome::Failed);
            tracing::info!(run_id = %state.metadata.run_id, ticks = tick, ?outcome, "Run finished");
            self.event_bus.emit(ExecutionEvent::RunCompleted {
                execution_id: state.metadata.run_id,
                outcome,
                ticks: tick,
                timestamp: self.config.clock.now(),
            });
        }
        report
    }

    /// Start a definition and tick it to completion.
    pub async fn run(&self, definition: GraphDefinition) -> Result<RunReport, MachineError> {
        let state = self.start(definition).await?;
        self.resume(state).await
    }

    /// Tick an existing state to completion.
    pub async fn resume(&self, mut state: ExecutionState) -> Result<RunReport, MachineError> {
        while !state.is_finished() {
            self.tick(&mut state).await?;
        }
        Ok(RunReport {
            outcome: state.outcome().unwrap_or(RunOutcome::Failed),
            state,
        })
    }

    /// Stop every run driven by this runtime at the next tick boundary.
    /// Outstanding agent calls see the cancellation through their tool
    /// contexts.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancellation.cancel();
    }

    pub fn checkpoint(&self, state: &ExecutionState) -> Result<CheckpointToken, MachineError> {
        Ok(self.states.checkpoint(state)?)
    }

    /// Restore a checkpoint and rebuild handlers for the tool nodes of its
    /// definition snapshot.
    pub async fn restore(&self, token: &CheckpointToken) -> Result<ExecutionState, MachineError> {
        let state = self.states.restore(token)?;
        self.registry.materialize(&state.definition).await?;
        tracing::info!(run_id = %state.metadata.run_id, tick = state.metadata.tick, "Run restored");
        Ok(state)
    }
}

/// Configuration for the runtime
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Defaults for limits the definition does not set itself
    pub limits: Limits,
    pub event_buffer_size: usize,
    pub clock: Arc<dyn Clock>,
    pub code_runner: Option<Arc<dyn CodeRunner>>,
}

impl RuntimeConfig {
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.code_runner = Some(runner);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            event_buffer_size: 1000,
            clock: Arc::new(SystemClock),
            code_runner: None,
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("limits", &self.limits)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("code_runner", &self.code_runner.is_some())
            .finish()
    }
}
