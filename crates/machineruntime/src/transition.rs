//! Transition evaluation.
//!
//! A pure function of the definition snapshot and the committed attribute
//! context: given the node a path sits on, decide whether it moves
//! automatically, forks, heads for a barrier, needs the agent, or is done.

use machinecore::annotations::BarrierSpec;
use machinecore::expression::evaluate_guard;
use machinecore::{
    Edge, EdgeConfig, EvalContext, ExpressionError, GraphDefinition, GuardPolarity, NodeConfig,
    NodeKind,
};

/// An edge offered to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub edge: usize,
    pub target: String,
    pub label: Option<String>,
    pub priority: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Auto { edge: usize, target: String },
    Fork { edges: Vec<usize>, targets: Vec<String> },
    Barrier { edge: usize, barrier: BarrierSpec },
    RequiresAgent { candidates: Vec<Candidate> },
    /// Every guard failed on a node marked `@hold`; the path stays put and
    /// is evaluated again next tick.
    Blocked,
    Terminal,
}

/// A guard that could not be evaluated and was treated as false.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardWarning {
    /// Declaration index of the edge; `None` when the node itself vanished.
    pub edge: Option<usize>,
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub warnings: Vec<GuardWarning>,
}

impl Evaluation {
    fn new(decision: Decision, warnings: Vec<GuardWarning>) -> Self {
        Self { decision, warnings }
    }
}

pub struct TransitionEvaluator;

impl TransitionEvaluator {
    /// Decide what a path at `node` does next.
    pub fn decide(definition: &GraphDefinition, node: &str, ctx: &EvalContext) -> Evaluation {
        let Some(current) = definition.find_node(node) else {
            return Evaluation::new(
                Decision::Terminal,
                vec![GuardWarning {
                    edge: None,
                    expression: String::new(),
                    message: format!("node '{}' no longer exists", node),
                }],
            );
        };
        if NodeConfig::from_node(current).terminal {
            return Evaluation::new(Decision::Terminal, Vec::new());
        }

        let (edges, inherited) = Self::effective_edges(definition, node);
        if edges.is_empty() {
            return Evaluation::new(Decision::Terminal, Vec::new());
        }

        let parallel = NodeConfig::from_node(current).parallel;
        let mut warnings = Vec::new();
        let mut free = Vec::new();
        let mut barriers = Vec::new();

        for (i, edge) in edges {
            let config = EdgeConfig::from_edge(edge);
            if config.barrier.is_some() {
                barriers.push((i, edge, config));
            } else {
                free.push((i, edge, config));
            }
        }

        let mut passing = Vec::new();
        for (i, edge, config) in &free {
            match Self::guard_passes(edge, ctx) {
                Ok(true) => passing.push((*i, *edge, config)),
                Ok(false) => {}
                Err(e) => warnings.push(GuardWarning {
                    edge: Some(*i),
                    expression: edge
                        .guard
                        .as_ref()
                        .map(|g| g.expression.clone())
                        .unwrap_or_default(),
                    message: e.to_string(),
                }),
            }
        }

        let is_fork = |edge: &Edge, config: &EdgeConfig| {
            config.fork || edge.target.is_multiple() || parallel
        };

        // Single edge out of an automatic node, or out of a node that ends
        // its hierarchical scope.
        let auto_node = matches!(current.kind, NodeKind::Control | NodeKind::Entry);
        if free.len() == 1 && (auto_node || inherited) {
            if let Some((i, edge, config)) = passing.first() {
                if !is_fork(*edge, *config) {
                    return Evaluation::new(
                        Decision::Auto {
                            edge: *i,
                            target: edge.primary_target().to_string(),
                        },
                        warnings,
                    );
                }
            }
        }

        if let Some((i, edge, _)) = passing
            .iter()
            .find(|(_, edge, config)| config.automatic && !is_fork(*edge, *config))
        {
            return Evaluation::new(
                Decision::Auto {
                    edge: *i,
                    target: edge.primary_target().to_string(),
                },
                warnings,
            );
        }

        let forks: Vec<_> = passing
            .iter()
            .filter(|(_, edge, config)| is_fork(*edge, *config))
            .collect();
        if !forks.is_empty() {
            let edges = forks.iter().map(|(i, _, _)| *i).collect();
            let targets = forks
                .iter()
                .flat_map(|(_, edge, _)| edge.target.names().iter().cloned())
                .collect();
            return Evaluation::new(Decision::Fork { edges, targets }, warnings);
        }

        if let Some((i, _, config)) = barriers.into_iter().next() {
            if let Some(barrier) = config.barrier {
                return Evaluation::new(Decision::Barrier { edge: i, barrier }, warnings);
            }
        }

        if passing.is_empty() {
            let decision = if NodeConfig::from_node(current).hold {
                Decision::Blocked
            } else {
                Decision::Terminal
            };
            return Evaluation::new(decision, warnings);
        }

        if current.kind.requires_agent() {
            let candidates = passing
                .iter()
                .map(|(i, edge, config)| Candidate {
                    edge: *i,
                    target: edge.primary_target().to_string(),
                    label: edge.label.clone(),
                    priority: config.priority,
                })
                .collect();
            return Evaluation::new(Decision::RequiresAgent { candidates }, warnings);
        }

        // Automatic nodes with several open edges take the highest priority,
        // then the first declared.
        let best = passing
            .iter()
            .enumerate()
            .max_by_key(|(pos, (_, _, config))| (config.priority, std::cmp::Reverse(*pos)))
            .map(|(_, entry)| entry);
        match best {
            Some((i, edge, _)) => Evaluation::new(
                Decision::Auto {
                    edge: *i,
                    target: edge.primary_target().to_string(),
                },
                warnings,
            ),
            None => Evaluation::new(Decision::Terminal, warnings),
        }
    }

    /// Outbound transition edges of `node`; when it has none, those of its
    /// nearest ancestor that has some. The flag is set in the second case.
    pub fn effective_edges<'a>(
        definition: &'a GraphDefinition,
        node: &str,
    ) -> (Vec<(usize, &'a Edge)>, bool) {
        let own: Vec<_> = definition
            .edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| edge.source == node && definition.is_transition_edge(edge))
            .collect();
        if !own.is_empty() {
            return (own, false);
        }

        let mut current = node.to_string();
        while let Some(parent) = definition.parent_of(&current) {
            let edges: Vec<_> = definition
                .edges
                .iter()
                .enumerate()
                .filter(|(_, edge)| edge.source == parent.name && definition.is_transition_edge(edge))
                .collect();
            if !edges.is_empty() {
                return (edges, true);
            }
            current = parent.name.clone();
        }
        (Vec::new(), false)
    }

    /// Evaluate an edge guard; `unless` guards are negated. Edges without a
    /// guard always pass.
    pub fn guard_passes(edge: &Edge, ctx: &EvalContext) -> Result<bool, ExpressionError> {
        let Some(guard) = &edge.guard else {
            return Ok(true);
        };
        let value = evaluate_guard(&guard.expression, ctx)?;
        Ok(match guard.polarity {
            GuardPolarity::If => value,
            GuardPolarity::Unless => !value,
        })
    }

    /// Follow auto-entry into hierarchical nodes: the first flow child,
    /// recursively. Returns the chain of entered children.
    pub fn entry_chain(definition: &GraphDefinition, target: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = definition.find_node(target);
        while let Some(node) = current {
            match node.children.iter().find(|child| child.kind.is_flow()) {
                Some(child) => {
                    chain.push(child.name.clone());
                    current = Some(child);
                }
                None => break,
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinecore::{Annotation, Node};

    fn ctx() -> EvalContext {
        EvalContext::new().with("retries", 2.0).with("ready", true)
    }

    fn decide(def: &GraphDefinition, node: &str) -> Evaluation {
        TransitionEvaluator::decide(def, node, &ctx())
    }

    #[test]
    fn single_edge_from_control_is_auto() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Control))
            .add_node(Node::new("B", NodeKind::Control))
            .connect("A", "B");

        assert_eq!(
            decide(&def, "A").decision,
            Decision::Auto {
                edge: 0,
                target: "B".to_string()
            }
        );
        assert_eq!(decide(&def, "B").decision, Decision::Terminal);
    }

    #[test]
    fn automatic_edges_break_ties_by_declaration_order() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Decision))
            .add_node(Node::new("B", NodeKind::Control))
            .add_node(Node::new("C", NodeKind::Control))
            .add_edge(
                Edge::new("A", "B")
                    .when("retries > 1")
                    .with_annotation(Annotation::flag("auto")),
            )
            .add_edge(
                Edge::new("A", "C")
                    .when("retries > 1 && ready")
                    .with_annotation(Annotation::flag("Automatic")),
            );

        assert_eq!(
            decide(&def, "A").decision,
            Decision::Auto {
                edge: 0,
                target: "B".to_string()
            }
        );
    }

    #[test]
    fn fork_edges_spawn_every_target() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Control))
            .add_node(Node::new("B", NodeKind::Control))
            .add_node(Node::new("C", NodeKind::Control))
            .add_edge(Edge::fork("A", vec!["B", "C"]));

        assert_eq!(
            decide(&def, "A").decision,
            Decision::Fork {
                edges: vec![0],
                targets: vec!["B".to_string(), "C".to_string()]
            }
        );
    }

    #[test]
    fn barrier_edges_ignore_guards() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Entry))
            .add_node(Node::new("W", NodeKind::Control))
            .add_edge(
                Edge::new("A", "W")
                    .when("missing > 3")
                    .with_annotation(Annotation::with_value("sync", "gate")),
            );

        match decide(&def, "A").decision {
            Decision::Barrier { edge, barrier } => {
                assert_eq!(edge, 0);
                assert_eq!(barrier.id, "gate");
                assert!(!barrier.merge);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn decision_nodes_only_see_passing_candidates() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Decision))
            .add_node(Node::new("B", NodeKind::Control))
            .add_node(Node::new("C", NodeKind::Control))
            .add_node(Node::new("D", NodeKind::Control))
            .add_edge(Edge::new("A", "B").when("retries < 5"))
            .add_edge(Edge::new("A", "C").unless("ready"))
            .add_edge(Edge::new("A", "D").with_label("give up"));

        match decide(&def, "A").decision {
            Decision::RequiresAgent { candidates } => {
                let targets: Vec<_> = candidates.iter().map(|c| c.target.as_str()).collect();
                assert_eq!(targets, vec!["B", "D"]);
                assert_eq!(candidates[1].label.as_deref(), Some("give up"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn malformed_guard_is_false_with_warning() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Control))
            .add_node(Node::new("B", NodeKind::Control))
            .add_edge(Edge::new("A", "B").when("retries >"));

        let evaluation = decide(&def, "A");
        assert_eq!(evaluation.decision, Decision::Terminal);
        assert_eq!(evaluation.warnings.len(), 1);
        assert_eq!(evaluation.warnings[0].edge, Some(0));
        assert_eq!(evaluation.warnings[0].expression, "retries >");
    }

    #[test]
    fn failed_guards_end_the_path_unless_held() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Control))
            .add_node(Node::new("Held", NodeKind::Control).with_annotation(Annotation::flag("hold")))
            .add_node(Node::new("B", NodeKind::Control))
            .add_edge(Edge::new("A", "B").when("false"))
            .add_edge(Edge::new("Held", "B").when("false"));

        let open = decide(&def, "A");
        assert_eq!(open.decision, Decision::Terminal);
        assert!(open.warnings.is_empty());
        assert_eq!(decide(&def, "Held").decision, Decision::Blocked);
    }

    #[test]
    fn vanished_node_warns_without_an_edge() {
        let def = GraphDefinition::new("m");
        let evaluation = decide(&def, "Gone");
        assert_eq!(evaluation.decision, Decision::Terminal);
        assert_eq!(evaluation.warnings[0].edge, None);
    }

    #[test]
    fn children_inherit_parent_edges() {
        let mut def = GraphDefinition::new("m");
        def.add_node(
            Node::new("Phase", NodeKind::Control)
                .with_child(Node::new("Inner", NodeKind::Decision)),
        )
        .add_node(Node::new("Next", NodeKind::Control))
        .connect("Phase", "Next");

        assert_eq!(TransitionEvaluator::entry_chain(&def, "Phase"), vec!["Inner"]);
        assert_eq!(
            decide(&def, "Inner").decision,
            Decision::Auto {
                edge: 0,
                target: "Next".to_string()
            }
        );
    }

    #[test]
    fn data_edges_are_not_transitions() {
        let mut def = GraphDefinition::new("m");
        def.add_node(Node::new("A", NodeKind::Decision))
            .add_node(Node::new("Store", NodeKind::Context))
            .connect("A", "Store");

        assert_eq!(decide(&def, "A").decision, Decision::Terminal);
    }
}
