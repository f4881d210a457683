use machinecore::{GraphDefinition, NodeKind};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};

/// What an edge in the analysis graph stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRole {
    /// Control moves between flow nodes.
    Transition,
    /// Data edge touching a context, tool or note node.
    Data,
}

/// Directed view of a definition for load-time analysis.
pub struct ControlGraph {
    graph: DiGraph<String, (usize, EdgeRole)>,
    index: BTreeMap<String, NodeIndex>,
}

impl ControlGraph {
    /// Build a dependency graph from the definition. Fork edges contribute
    /// one graph edge per target.
    pub fn build(definition: &GraphDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for node in definition.all_nodes() {
            let idx = graph.add_node(node.name.clone());
            index.insert(node.name.clone(), idx);
        }

        for (i, edge) in definition.edges.iter().enumerate() {
            let role = if definition.is_transition_edge(edge) {
                EdgeRole::Transition
            } else {
                EdgeRole::Data
            };
            let Some(&from) = index.get(&edge.source) else {
                continue;
            };
            for target in edge.target.names() {
                if let Some(&to) = index.get(target) {
                    graph.add_edge(from, to, (i, role));
                }
            }
        }

        Self { graph, index }
    }

    fn transition_graph(&self) -> DiGraph<String, ()> {
        let mut filtered = DiGraph::new();
        let mut map = BTreeMap::new();
        for idx in self.graph.node_indices() {
            map.insert(idx, filtered.add_node(self.graph[idx].clone()));
        }
        for edge in self.graph.edge_references() {
            if edge.weight().1 == EdgeRole::Transition {
                filtered.add_edge(map[&edge.source()], map[&edge.target()], ());
            }
        }
        filtered
    }

    /// Whether control flow contains no cycle.
    pub fn is_acyclic(&self) -> bool {
        toposort(&self.transition_graph(), None).is_ok()
    }

    /// Number of transitions on the longest control-flow path starting at
    /// `start`, or `None` when the control flow is cyclic.
    pub fn longest_path_from(&self, start: &str) -> Option<usize> {
        let graph = self.transition_graph();
        let order = toposort(&graph, None).ok()?;
        let start = graph.node_indices().find(|i| graph[*i] == start)?;

        let mut depth: BTreeMap<NodeIndex, usize> = BTreeMap::new();
        depth.insert(start, 0);
        for idx in order {
            let Some(&d) = depth.get(&idx) else {
                continue;
            };
            for next in graph.neighbors_directed(idx, Direction::Outgoing) {
                let entry = depth.entry(next).or_insert(0);
                *entry = (*entry).max(d + 1);
            }
        }
        depth.values().copied().max()
    }

    /// Tool nodes a node can reach through data edges, plus global tools
    /// (tool nodes nothing points at), in name order.
    pub fn reachable_tools(&self, definition: &GraphDefinition, node: &str) -> Vec<String> {
        let is_tool = |name: &str| {
            definition
                .find_node(name)
                .is_some_and(|n| n.kind == NodeKind::Tool)
        };
        let mut tools = BTreeSet::new();

        // Edges declared on an ancestor apply to its children.
        let mut scope = vec![node.to_string()];
        let mut current = node;
        while let Some(parent) = definition.parent_of(current) {
            scope.push(parent.name.clone());
            current = &parent.name;
        }

        for origin in &scope {
            let Some(&start) = self.index.get(origin) else {
                continue;
            };
            for edge in self.graph.edges_directed(start, Direction::Outgoing) {
                if !is_tool(&self.graph[edge.target()]) {
                    continue;
                }
                // Tools may compose further tools.
                let mut dfs = Dfs::new(&self.graph, edge.target());
                while let Some(idx) = dfs.next(&self.graph) {
                    if is_tool(&self.graph[idx]) {
                        tools.insert(self.graph[idx].clone());
                    }
                }
            }
        }

        for (name, idx) in &self.index {
            if is_tool(name)
                && self
                    .graph
                    .neighbors_directed(*idx, Direction::Incoming)
                    .next()
                    .is_none()
            {
                tools.insert(name.clone());
            }
        }

        tools.into_iter().collect()
    }
}
