//! Path scheduling.
//!
//! One tick advances every active path once, oldest first, against the
//! definition snapshot and committed context taken at the start of the
//! tick. Automatic decisions are applied here; decisions that need the
//! agent are returned as effect requests and folded back by
//! [`PathScheduler::apply_outcomes`].

use crate::context::ContextManager;
use crate::effects::EffectOutcome;
use crate::mutation::PendingMutation;
use crate::sync::{Arrival, SynchronizationManager};
use crate::transition::{Candidate, Decision, TransitionEvaluator};
use chrono::{DateTime, Utc};
use machinecore::{
    ContextEntry, ContextWrite, EventBus, ExecutionEvent, ExecutionPath, ExecutionState,
    GraphDefinition, NodeConfig, PathFailure, PathId, PathStatus, ReasonCode, TimeoutScope,
    TransitionRecord, TransitionTrigger,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything a tick reads: fixed when the tick starts.
#[derive(Debug, Clone)]
pub struct TickSnapshot {
    pub tick: u64,
    pub now: DateTime<Utc>,
    pub definition: Arc<GraphDefinition>,
    pub context: Arc<BTreeMap<String, ContextEntry>>,
}

impl TickSnapshot {
    pub fn capture(state: &ExecutionState, tick: u64, now: DateTime<Utc>) -> Self {
        Self {
            tick,
            now,
            definition: state.definition.clone(),
            context: Arc::new(state.context.entries.clone()),
        }
    }
}

/// A path parked on a decision node until the effect executor answers.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectRequest {
    pub path_id: PathId,
    pub node: String,
    pub candidates: Vec<Candidate>,
    /// Time left before the run or path timeout expires, if one is set.
    pub budget: Option<std::time::Duration>,
}

/// Side effects collected from a tick's outcomes, committed between ticks.
#[derive(Debug, Default)]
pub struct FoldedEffects {
    pub writes: Vec<ContextWrite>,
    pub mutations: Vec<PendingMutation>,
}

/// Length of the repeating run ending in the candidate transition
/// `(from, to)`, if the candidate would occur more than `max_repeats` times
/// in it. Only periods of two or more transitions count, and only the last
/// `window` transitions are examined.
pub fn detect_cycle(
    path: &ExecutionPath,
    from: &str,
    to: &str,
    window: usize,
    max_repeats: u32,
) -> Option<usize> {
    let mut seq: Vec<(&str, &str)> = path
        .transitions()
        .filter(|t| t.trigger != TransitionTrigger::Enter)
        .map(|t| (t.from.as_str(), t.to.as_str()))
        .collect();
    let seq = seq.split_off(seq.len().saturating_sub(window));
    let seq: Vec<(&str, &str)> = seq.into_iter().chain(std::iter::once((from, to))).collect();
    let n = seq.len();

    for period in 2..=n / 2 {
        let mut run = 0;
        while run + period < n && seq[n - 1 - run] == seq[n - 1 - run - period] {
            run += 1;
        }
        let span = run + period;
        if span < 2 * period {
            continue;
        }
        let occurrences = seq[n - span..].iter().filter(|k| **k == (from, to)).count();
        if occurrences > max_repeats as usize {
            return Some(occurrences);
        }
    }
    None
}

/// Owns path lifecycle: creation on fork, advancement, retirement and
/// limit enforcement.
pub struct PathScheduler {
    events: Arc<EventBus>,
}

impl PathScheduler {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }

    /// One path per entry node, already entered down to the first leaf of
    /// hierarchical entries.
    pub fn spawn_entries(&self, state: &mut ExecutionState, now: DateTime<Utc>) -> Vec<PathId> {
        let definition = state.definition.clone();
        let mut ids = Vec::new();
        for entry in definition.entry_nodes() {
            let id = state.spawn_path(entry.name.clone(), None, now);
            let mut previous = entry.name.clone();
            for child in TransitionEvaluator::entry_chain(&definition, &entry.name) {
                if let Some(path) = state.path_mut(id) {
                    path.record_transition(TransitionRecord {
                        tick: 0,
                        from: previous,
                        to: child.clone(),
                        trigger: TransitionTrigger::Enter,
                        timestamp: now,
                        output: None,
                    });
                }
                previous = child;
            }
            self.events.emit(ExecutionEvent::PathCreated {
                execution_id: state.metadata.run_id,
                path_id: id,
                node: previous,
                parent: None,
            });
            ids.push(id);
        }
        ids
    }

    /// Advance every path that is active at the start of the tick.
    pub fn step(&self, state: &mut ExecutionState, snapshot: &TickSnapshot) -> Vec<EffectRequest> {
        let mut effects = Vec::new();
        self.check_timeouts(state, snapshot);

        let ids: Vec<PathId> = state
            .paths
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.id)
            .collect();

        for id in ids {
            if state.metadata.aborted {
                break;
            }
            let Some(path) = state.path(id) else {
                continue;
            };
            if !path.is_active() {
                continue;
            }
            if let Some(failure) = self.safety_check(state, path, snapshot) {
                self.fail_path(state, id, failure, snapshot);
                continue;
            }

            let node = path.current_node.clone();
            let ctx = ContextManager::eval_context(&snapshot.definition, &snapshot.context, path);
            let evaluation = TransitionEvaluator::decide(&snapshot.definition, &node, &ctx);

            for warning in &evaluation.warnings {
                tracing::warn!(
                    path_id = id,
                    node = %node,
                    expression = %warning.expression,
                    "guard evaluation failed: {}",
                    warning.message
                );
                if let Some(path) = state.path_mut(id) {
                    path.record_warning(
                        snapshot.tick,
                        format!("guard '{}' treated as false: {}", warning.expression, warning.message),
                        snapshot.now,
                    );
                }
                self.events.emit(ExecutionEvent::GuardWarning {
                    execution_id: state.metadata.run_id,
                    path_id: id,
                    expression: warning.expression.clone(),
                    message: warning.message.clone(),
                });
            }

            if evaluation.decision != Decision::Terminal {
                state.metadata.total_steps += 1;
                if let Some(path) = state.path_mut(id) {
                    path.step_count += 1;
                }
            }

            tracing::debug!(path_id = id, node = %node, decision = ?evaluation.decision, "path decision");
            match evaluation.decision {
                Decision::Auto { target, .. } => {
                    if let Err(failure) = self.advance(state, id, &target, TransitionTrigger::Auto, snapshot, None) {
                        self.fail_path(state, id, failure, snapshot);
                    }
                }
                Decision::Fork { targets, .. } => self.fork(state, id, &node, targets, snapshot),
                Decision::Barrier { edge, barrier } => {
                    let arrival = SynchronizationManager::arrive(
                        &mut state.barriers,
                        &snapshot.definition,
                        &barrier.id,
                        barrier.merge,
                        id,
                        edge,
                    );
                    self.handle_arrival(state, id, &barrier.id, arrival, snapshot);
                }
                Decision::RequiresAgent { candidates } => effects.push(EffectRequest {
                    path_id: id,
                    node,
                    candidates,
                    budget: Self::budget(state, id, snapshot),
                }),
                Decision::Blocked => {}
                Decision::Terminal => self.complete(state, id, snapshot),
            }
        }
        effects
    }

    fn safety_check(
        &self,
        state: &ExecutionState,
        path: &ExecutionPath,
        snapshot: &TickSnapshot,
    ) -> Option<PathFailure> {
        let limits = &state.limits;
        let failure = |message: String| {
            PathFailure::new(
                ReasonCode::LimitExceeded,
                path.current_node.clone(),
                message,
                snapshot.tick,
                snapshot.now,
            )
        };

        if state.metadata.total_steps >= limits.max_steps {
            return Some(
                failure(format!("global step limit of {} reached", limits.max_steps)).with_limit(
                    "max_steps",
                    limits.max_steps,
                    state.metadata.total_steps,
                ),
            );
        }
        if path.step_count >= limits.max_path_steps {
            return Some(
                failure(format!("path step limit of {} reached", limits.max_path_steps)).with_limit(
                    "max_path_steps",
                    limits.max_path_steps,
                    path.step_count,
                ),
            );
        }
        let invocations = path.invocations_of(&path.current_node);
        if invocations > limits.max_node_invocations {
            return Some(
                failure(format!(
                    "node '{}' entered {} times, limit {}",
                    path.current_node, invocations, limits.max_node_invocations
                ))
                .with_limit("max_node_invocations", limits.max_node_invocations, invocations),
            );
        }
        None
    }

    /// Remaining time under the configured timeout for an effect issued by
    /// path `id` in this tick.
    pub fn budget(state: &ExecutionState, id: PathId, snapshot: &TickSnapshot) -> Option<std::time::Duration> {
        let timeout_ms = state.limits.timeout_ms?;
        let since = match state.limits.timeout_scope {
            TimeoutScope::Run => state.metadata.started_at,
            TimeoutScope::Path => state.path(id)?.start_time,
        };
        let elapsed = (snapshot.now - since).num_milliseconds().max(0) as u64;
        Some(std::time::Duration::from_millis(timeout_ms.saturating_sub(elapsed)))
    }

    /// Fail paths whose time is up. A run-scoped timeout aborts the run.
    pub fn check_timeouts(&self, state: &mut ExecutionState, snapshot: &TickSnapshot) {
        let Some(timeout_ms) = state.limits.timeout_ms else {
            return;
        };
        let elapsed = |since: DateTime<Utc>| (snapshot.now - since).num_milliseconds().max(0) as u64;

        match state.limits.timeout_scope {
            TimeoutScope::Run => {
                let elapsed = elapsed(state.metadata.started_at);
                if elapsed > timeout_ms && !state.metadata.aborted && state.live_paths().next().is_some() {
                    tracing::warn!(elapsed, timeout_ms, "run timed out");
                    let failure = PathFailure::new(
                        ReasonCode::Timeout,
                        String::new(),
                        format!("run exceeded {}ms", timeout_ms),
                        snapshot.tick,
                        snapshot.now,
                    )
                    .with_limit("timeout_ms", timeout_ms, elapsed);
                    self.abort(state, failure);
                }
            }
            TimeoutScope::Path => {
                let expired: Vec<(PathId, String, u64)> = state
                    .live_paths()
                    .map(|p| (p.id, p.current_node.clone(), elapsed(p.start_time)))
                    .filter(|(_, _, e)| *e > timeout_ms)
                    .collect();
                for (id, node, elapsed) in expired {
                    let failure = PathFailure::new(
                        ReasonCode::Timeout,
                        node,
                        format!("path exceeded {}ms", timeout_ms),
                        snapshot.tick,
                        snapshot.now,
                    )
                    .with_limit("timeout_ms", timeout_ms, elapsed);
                    self.fail_path(state, id, failure, snapshot);
                }
            }
        }
    }

    /// Paths still waiting at a barrier once nothing else can move will
    /// wait forever; fail them.
    pub fn resolve_deadlocks(&self, state: &mut ExecutionState, snapshot: &TickSnapshot) {
        if state.paths.iter().any(|p| p.is_active()) {
            return;
        }
        let stuck: Vec<(PathId, String, String)> = state
            .paths
            .iter()
            .filter(|p| p.status == PathStatus::WaitingAtBarrier)
            .map(|p| (p.id, p.current_node.clone(), p.barrier.clone().unwrap_or_default()))
            .collect();
        for (id, node, barrier) in stuck {
            let (arrived, required) = state
                .barriers
                .get(&barrier)
                .map(|b| (b.waiting.len(), b.required_count))
                .unwrap_or((0, 0));
            let failure = PathFailure::new(
                ReasonCode::Deadlock,
                node,
                format!(
                    "barrier '{}' can no longer be released ({} of {} arrived)",
                    barrier, arrived, required
                ),
                snapshot.tick,
                snapshot.now,
            )
            .with_limit("barrier_arrivals", required as u64, arrived as u64);
            self.fail_path(state, id, failure, snapshot);
        }
    }

    /// Fold effect results back into the state, in path order. Results for
    /// paths that stopped being active while the call was outstanding are
    /// discarded.
    pub fn apply_outcomes(
        &self,
        state: &mut ExecutionState,
        mut outcomes: Vec<EffectOutcome>,
        snapshot: &TickSnapshot,
    ) -> FoldedEffects {
        let order: BTreeMap<PathId, usize> =
            state.paths.iter().enumerate().map(|(i, p)| (p.id, i)).collect();
        outcomes.sort_by_key(|o| order.get(&o.path_id).copied().unwrap_or(usize::MAX));

        let mut folded = FoldedEffects::default();
        for outcome in outcomes {
            let id = outcome.path_id;
            let Some(path) = state.path_mut(id) else {
                continue;
            };
            if !path.is_active() {
                tracing::warn!(path_id = id, status = ?path.status, "discarding late effect result");
                path.record_warning(snapshot.tick, "late agent result discarded", snapshot.now);
                continue;
            }
            path.history.extend(outcome.history);
            state.refinements.extend(outcome.refinements);

            if let Some((code, message)) = outcome.failure {
                let node = state
                    .path(id)
                    .map(|p| p.current_node.clone())
                    .unwrap_or_default();
                let failure = PathFailure::new(code, node, message, snapshot.tick, snapshot.now);
                self.fail_path(state, id, failure, snapshot);
                continue;
            }

            folded.writes.extend(outcome.context_writes);
            folded.mutations.extend(
                outcome
                    .mutations
                    .into_iter()
                    .map(|op| PendingMutation { path_id: id, op }),
            );

            if let Some(choice) = outcome.transition {
                if let Err(failure) =
                    self.advance(state, id, &choice.target, choice.trigger, snapshot, choice.output)
                {
                    self.fail_path(state, id, failure, snapshot);
                }
            }
        }
        folded
    }

    /// Move a path along an edge, entering hierarchical targets and
    /// retiring the path if it lands on a terminal node.
    fn advance(
        &self,
        state: &mut ExecutionState,
        id: PathId,
        target: &str,
        trigger: TransitionTrigger,
        snapshot: &TickSnapshot,
        output: Option<serde_json::Value>,
    ) -> Result<(), PathFailure> {
        let window = state.limits.cycle_window;
        let max_repeats = state.limits.max_cycle_repeats;
        let execution_id = state.metadata.run_id;
        let Some(path) = state.path_mut(id) else {
            return Ok(());
        };
        let from = path.current_node.clone();

        if let Some(count) = detect_cycle(path, &from, target, window, max_repeats) {
            return Err(PathFailure::new(
                ReasonCode::CycleDetected,
                from.clone(),
                format!("transition {} -> {} repeated {} times", from, target, count),
                snapshot.tick,
                snapshot.now,
            )
            .with_limit("max_cycle_repeats", max_repeats as u64, count as u64));
        }

        let mut hops = vec![(from, target.to_string(), trigger, output)];
        let mut previous = target.to_string();
        for child in TransitionEvaluator::entry_chain(&snapshot.definition, target) {
            hops.push((previous, child.clone(), TransitionTrigger::Enter, None));
            previous = child;
        }

        for (from, to, trigger, output) in hops {
            path.record_transition(TransitionRecord {
                tick: snapshot.tick,
                from: from.clone(),
                to: to.clone(),
                trigger,
                timestamp: snapshot.now,
                output,
            });
            self.events.emit(ExecutionEvent::PathTransitioned {
                execution_id,
                path_id: id,
                from,
                to,
                trigger,
                tick: snapshot.tick,
            });
        }

        if Self::is_terminal(&snapshot.definition, &previous) {
            self.complete(state, id, snapshot);
        }
        Ok(())
    }

    /// A node with nowhere to go: marked final, or without transition edges
    /// of its own or inherited.
    pub fn is_terminal(definition: &GraphDefinition, node: &str) -> bool {
        match definition.find_node(node) {
            Some(n) => {
                NodeConfig::from_node(n).terminal
                    || TransitionEvaluator::effective_edges(definition, node).0.is_empty()
            }
            None => false,
        }
    }

    fn fork(
        &self,
        state: &mut ExecutionState,
        id: PathId,
        node: &str,
        targets: Vec<String>,
        snapshot: &TickSnapshot,
    ) {
        let live = state.live_paths().count();
        let after = live - 1 + targets.len();
        if after > state.limits.max_concurrent_paths {
            let failure = PathFailure::new(
                ReasonCode::LimitExceeded,
                node,
                format!(
                    "fork to {} targets would exceed {} concurrent paths",
                    targets.len(),
                    state.limits.max_concurrent_paths
                ),
                snapshot.tick,
                snapshot.now,
            )
            .with_limit(
                "max_concurrent_paths",
                state.limits.max_concurrent_paths as u64,
                after as u64,
            );
            self.fail_path(state, id, failure, snapshot);
            return;
        }

        if let Some(parent) = state.path_mut(id) {
            parent.status = PathStatus::Forked;
        }
        let mut children = Vec::new();
        for target in targets {
            let child = state.spawn_path(node, Some(id), snapshot.now);
            self.events.emit(ExecutionEvent::PathCreated {
                execution_id: state.metadata.run_id,
                path_id: child,
                node: node.to_string(),
                parent: Some(id),
            });
            if let Err(failure) = self.advance(state, child, &target, TransitionTrigger::Fork, snapshot, None) {
                self.fail_path(state, child, failure, snapshot);
            }
            children.push(child);
        }
        tracing::info!(path_id = id, ?children, "path forked");
        self.events.emit(ExecutionEvent::PathForked {
            execution_id: state.metadata.run_id,
            path_id: id,
            children,
            tick: snapshot.tick,
        });
    }

    fn handle_arrival(
        &self,
        state: &mut ExecutionState,
        id: PathId,
        barrier: &str,
        arrival: Arrival,
        snapshot: &TickSnapshot,
    ) {
        match arrival {
            Arrival::Waiting { arrived, required } => {
                tracing::debug!(path_id = id, barrier, arrived, required, "waiting at barrier");
                if let Some(path) = state.path_mut(id) {
                    path.status = PathStatus::WaitingAtBarrier;
                    path.barrier = Some(barrier.to_string());
                }
                self.events.emit(ExecutionEvent::PathWaiting {
                    execution_id: state.metadata.run_id,
                    path_id: id,
                    barrier: barrier.to_string(),
                    tick: snapshot.tick,
                });
            }
            Arrival::Released(release) => {
                let released: Vec<PathId> = release.paths.iter().map(|(p, _)| *p).collect();
                tracing::info!(barrier, ?released, merge = release.merge, "barrier released");
                self.events.emit(ExecutionEvent::BarrierReleased {
                    execution_id: state.metadata.run_id,
                    barrier: release.barrier.clone(),
                    released,
                    tick: snapshot.tick,
                });

                for (i, (path_id, target)) in release.paths.into_iter().enumerate() {
                    let Some(path) = state.path_mut(path_id) else {
                        continue;
                    };
                    path.barrier = None;
                    if release.merge && i > 0 {
                        path.status = PathStatus::Merged;
                        continue;
                    }
                    path.status = PathStatus::Active;
                    if let Err(failure) =
                        self.advance(state, path_id, &target, TransitionTrigger::Barrier, snapshot, None)
                    {
                        self.fail_path(state, path_id, failure, snapshot);
                    }
                }
            }
        }
    }

    fn complete(&self, state: &mut ExecutionState, id: PathId, snapshot: &TickSnapshot) {
        let Some(path) = state.path_mut(id) else {
            return;
        };
        path.status = PathStatus::Completed;
        let node = path.current_node.clone();
        tracing::info!(path_id = id, node = %node, "path completed");
        self.events.emit(ExecutionEvent::PathCompleted {
            execution_id: state.metadata.run_id,
            path_id: id,
            node,
            tick: snapshot.tick,
        });
    }

    /// Fail one path. Under fail-fast, or for a fatal limit, the failure
    /// takes the rest of the run down with it.
    pub fn fail_path(&self, state: &mut ExecutionState, id: PathId, failure: PathFailure, snapshot: &TickSnapshot) {
        if !self.fail_one(state, id, failure.clone()) {
            return;
        }
        let fatal_limit = state.limits.limits_fatal
            && matches!(
                failure.code,
                ReasonCode::LimitExceeded | ReasonCode::CycleDetected | ReasonCode::Timeout
            );
        if state.limits.fail_fast || fatal_limit {
            let abort = PathFailure::new(
                ReasonCode::Cancelled,
                String::new(),
                format!("run aborted after path {} failed: {}", id, failure.message),
                snapshot.tick,
                snapshot.now,
            );
            self.abort(state, abort);
        }
    }

    fn fail_one(&self, state: &mut ExecutionState, id: PathId, failure: PathFailure) -> bool {
        let Some(path) = state.path_mut(id) else {
            return false;
        };
        if !path.status.is_live() {
            return false;
        }
        let mut failure = failure;
        if failure.node.is_empty() {
            failure.node = path.current_node.clone();
        }
        tracing::error!(path_id = id, code = ?failure.code, node = %failure.node, "path failed: {}", failure.message);
        let (code, message) = (failure.code, failure.message.clone());
        path.fail(failure);

        SynchronizationManager::withdraw(&mut state.barriers, id);
        state.metadata.error_count += 1;
        self.events.emit(ExecutionEvent::PathFailed {
            execution_id: state.metadata.run_id,
            path_id: id,
            code,
            message,
            tick: state.metadata.tick,
        });
        true
    }

    /// Fail every live path with `failure` and mark the run aborted.
    pub fn abort(&self, state: &mut ExecutionState, failure: PathFailure) {
        let live: Vec<PathId> = state.live_paths().map(|p| p.id).collect();
        for id in live {
            self.fail_one(state, id, failure.clone());
        }
        state.metadata.aborted = true;
    }
}
