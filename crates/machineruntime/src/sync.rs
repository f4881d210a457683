use machinecore::{
    BarrierArrival, BarrierState, DefinitionError, EdgeConfig, GraphDefinition, PathId,
};
use std::collections::BTreeMap;

/// Result of a path arriving at a barrier.
#[derive(Debug, Clone, PartialEq)]
pub enum Arrival {
    Waiting { arrived: usize, required: usize },
    Released(Release),
}

/// Paths let through a barrier, in arrival order, each with the target of
/// the edge it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub barrier: String,
    pub merge: bool,
    pub paths: Vec<(PathId, String)>,
}

/// Barrier rendezvous. Barrier state lives in `ExecutionState.barriers`;
/// entries are created on first arrival and removed on release.
pub struct SynchronizationManager;

impl SynchronizationManager {
    /// Number of distinct edges carrying barrier `id`.
    pub fn required_count(definition: &GraphDefinition, id: &str) -> usize {
        Self::barrier_edges(definition)
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn barrier_edges(definition: &GraphDefinition) -> BTreeMap<String, Vec<(usize, EdgeConfig)>> {
        let mut by_id: BTreeMap<String, Vec<(usize, EdgeConfig)>> = BTreeMap::new();
        for (i, edge) in definition.edges.iter().enumerate() {
            let config = EdgeConfig::from_edge(edge);
            if let Some(barrier) = &config.barrier {
                by_id.entry(barrier.id.clone()).or_default().push((i, config));
            }
        }
        by_id
    }

    /// Load-time barrier checks: a stated arrival count must match the
    /// number of edges sharing the id, merge semantics must agree across
    /// those edges, and merging barriers need one shared target.
    pub fn validate(definition: &GraphDefinition) -> Result<(), DefinitionError> {
        for (id, edges) in Self::barrier_edges(definition) {
            let required = edges.len();
            let mut merge = None;
            let mut targets = Vec::new();

            for (i, config) in &edges {
                let Some(barrier) = &config.barrier else {
                    continue;
                };
                if let Some(expected) = barrier.expected {
                    if expected != required {
                        return Err(DefinitionError::InvalidBarrier {
                            barrier: id.clone(),
                            reason: format!(
                                "declares {} arrivals but {} edges share the id",
                                expected, required
                            ),
                        });
                    }
                }
                match merge {
                    None => merge = Some(barrier.merge),
                    Some(m) if m != barrier.merge => {
                        return Err(DefinitionError::InvalidBarrier {
                            barrier: id.clone(),
                            reason: "edges disagree on merge semantics".to_string(),
                        })
                    }
                    _ => {}
                }
                if definition.edges[*i].target.is_multiple() {
                    return Err(DefinitionError::InvalidBarrier {
                        barrier: id.clone(),
                        reason: format!("edge {} has more than one target", i),
                    });
                }
                targets.push(definition.edges[*i].primary_target().to_string());
            }

            if merge == Some(true) {
                targets.sort();
                targets.dedup();
                if targets.len() > 1 {
                    return Err(DefinitionError::InvalidBarrier {
                        barrier: id,
                        reason: "merging barrier edges must share a single target".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Register an arrival. Releases every waiting path at once when the
    /// required count is reached; a path arriving twice counts once.
    pub fn arrive(
        barriers: &mut BTreeMap<String, BarrierState>,
        definition: &GraphDefinition,
        id: &str,
        merge: bool,
        path_id: PathId,
        edge: usize,
    ) -> Arrival {
        let required = Self::required_count(definition, id).max(1);
        let state = barriers.entry(id.to_string()).or_insert_with(|| BarrierState {
            id: id.to_string(),
            required_count: required,
            merge,
            waiting: Vec::new(),
        });

        if !state.waiting.iter().any(|a| a.path_id == path_id) {
            state.waiting.push(BarrierArrival { path_id, edge });
        }

        let arrived = state.waiting.len();
        if arrived < state.required_count {
            return Arrival::Waiting {
                arrived,
                required: state.required_count,
            };
        }

        let Some(state) = barriers.remove(id) else {
            return Arrival::Waiting { arrived, required };
        };
        let paths = state
            .waiting
            .iter()
            .map(|arrival| {
                let target = definition
                    .edges
                    .get(arrival.edge)
                    .map(|e| e.primary_target().to_string())
                    .unwrap_or_default();
                (arrival.path_id, target)
            })
            .collect();
        Arrival::Released(Release {
            barrier: state.id,
            merge: state.merge,
            paths,
        })
    }

    /// Drop a path from every waiting set, e.g. after it timed out.
    pub fn withdraw(barriers: &mut BTreeMap<String, BarrierState>, path_id: PathId) {
        for state in barriers.values_mut() {
            state.waiting.retain(|a| a.path_id != path_id);
        }
        barriers.retain(|_, state| !state.waiting.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinecore::{Annotation, Edge, Node, NodeKind, Value};

    fn barrier_def(merge: bool) -> GraphDefinition {
        let name = if merge { "join" } else { "barrier" };
        let mut def = GraphDefinition::new("sync");
        def.add_node(Node::new("FetchData", NodeKind::Entry))
            .add_node(Node::new("FetchConfig", NodeKind::Entry))
            .add_node(Node::new("WaitPoint", NodeKind::Control))
            .add_edge(
                Edge::new("FetchData", "WaitPoint")
                    .with_annotation(Annotation::with_value(name, "sync")),
            )
            .add_edge(
                Edge::new("FetchConfig", "WaitPoint")
                    .with_annotation(Annotation::with_value(name, "sync")),
            );
        def
    }

    #[test]
    fn required_count_is_edge_count() {
        let def = barrier_def(false);
        assert_eq!(SynchronizationManager::required_count(&def, "sync"), 2);
        assert_eq!(SynchronizationManager::required_count(&def, "other"), 0);
        assert!(SynchronizationManager::validate(&def).is_ok());
    }

    #[test]
    fn release_is_order_independent() {
        let def = barrier_def(false);
        for order in [[(1, 0), (2, 1)], [(2, 1), (1, 0)]] {
            let mut barriers = BTreeMap::new();
            let (first, second) = (order[0], order[1]);

            let arrival = SynchronizationManager::arrive(&mut barriers, &def, "sync", false, first.0, first.1);
            assert_eq!(arrival, Arrival::Waiting { arrived: 1, required: 2 });
            assert!(barriers.contains_key("sync"));

            match SynchronizationManager::arrive(&mut barriers, &def, "sync", false, second.0, second.1) {
                Arrival::Released(release) => {
                    assert_eq!(release.paths.len(), 2);
                    assert!(release.paths.iter().all(|(_, t)| t == "WaitPoint"));
                    assert!(!release.merge);
                }
                other => panic!("expected release, got {:?}", other),
            }
            assert!(barriers.is_empty());
        }
    }

    #[test]
    fn duplicate_arrival_counts_once() {
        let def = barrier_def(false);
        let mut barriers = BTreeMap::new();
        SynchronizationManager::arrive(&mut barriers, &def, "sync", false, 1, 0);
        let again = SynchronizationManager::arrive(&mut barriers, &def, "sync", false, 1, 0);
        assert_eq!(again, Arrival::Waiting { arrived: 1, required: 2 });
    }

    #[test]
    fn stated_count_must_match_edges() {
        let mut def = barrier_def(false);
        def.edges[0].annotations = vec![Annotation::with_value(
            "barrier",
            Value::Array(vec![Value::from("sync"), Value::from(3.0)]),
        )];
        assert!(matches!(
            SynchronizationManager::validate(&def),
            Err(DefinitionError::InvalidBarrier { .. })
        ));
    }

    #[test]
    fn merge_barrier_needs_shared_target() {
        let mut def = barrier_def(true);
        assert!(SynchronizationManager::validate(&def).is_ok());

        def.add_node(Node::new("Elsewhere", NodeKind::Control));
        def.edges[1].target = "Elsewhere".into();
        assert!(SynchronizationManager::validate(&def).is_err());
    }

    #[test]
    fn withdraw_removes_waiting_path() {
        let def = barrier_def(false);
        let mut barriers = BTreeMap::new();
        SynchronizationManager::arrive(&mut barriers, &def, "sync", false, 1, 0);
        SynchronizationManager::withdraw(&mut barriers, 1);
        assert!(barriers.is_empty());
    }
}
