use crate::{DefinitionError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Complete graph definition: one immutable snapshot of the machine.
///
/// The runtime never edits a snapshot in place; meta-mutations build a new
/// value and swap it in between ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphDefinition {
    pub title: String,
    pub attributes: Vec<Attribute>,
    pub annotations: Vec<Annotation>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphDefinition {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            attributes: Vec::new(),
            annotations: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(source, EdgeTarget::Single(target.into())));
        self
    }

    /// Machine-level attribute, matched case-insensitively ignoring `_`/`-`.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        find_attribute(&self.attributes, name)
    }

    /// All nodes in depth-first declaration order, children after parents.
    pub fn all_nodes(&self) -> Vec<&Node> {
        fn walk<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                walk(&node.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        fn search<'a>(nodes: &'a [Node], name: &str) -> Option<&'a Node> {
            for node in nodes {
                if node.name == name {
                    return Some(node);
                }
                if let Some(found) = search(&node.children, name) {
                    return Some(found);
                }
            }
            None
        }
        search(&self.nodes, name)
    }

    pub fn find_node_mut(&mut self, name: &str) -> Option<&mut Node> {
        fn search<'a>(nodes: &'a mut [Node], name: &str) -> Option<&'a mut Node> {
            for node in nodes {
                if node.name == name {
                    return Some(node);
                }
                if let Some(found) = search(&mut node.children, name) {
                    return Some(found);
                }
            }
            None
        }
        search(&mut self.nodes, name)
    }

    /// The hierarchical parent owning `name`, if any.
    pub fn parent_of(&self, name: &str) -> Option<&Node> {
        self.all_nodes()
            .into_iter()
            .find(|node| node.children.iter().any(|child| child.name == name))
    }

    pub fn outbound_edges<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (usize, &'a Edge)> + 'a {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, edge)| edge.source == name)
    }

    pub fn inbound_edges<'a>(&'a self, name: &'a str) -> impl Iterator<Item = (usize, &'a Edge)> + 'a {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, edge)| edge.target.contains(name))
    }

    /// Whether an edge moves control between flow nodes, as opposed to a
    /// data edge touching a context, tool or note node.
    pub fn is_transition_edge(&self, edge: &Edge) -> bool {
        let flow = |name: &str| self.find_node(name).is_some_and(|n| n.kind.is_flow());
        flow(&edge.source) && edge.target.names().iter().all(|t| flow(t))
    }

    /// Nodes where execution starts: every `entry` node, or nodes annotated
    /// `@entry`/`@start`. Falls back to the first top-level flow node.
    pub fn entry_nodes(&self) -> Vec<&Node> {
        let entries: Vec<&Node> = self
            .all_nodes()
            .into_iter()
            .filter(|node| node.kind == NodeKind::Entry || node.has_annotation("entry") || node.has_annotation("start"))
            .collect();
        if !entries.is_empty() {
            return entries;
        }
        self.nodes.iter().filter(|n| n.kind.is_flow()).take(1).collect()
    }

    pub fn tool_nodes(&self) -> Vec<&Node> {
        self.all_nodes()
            .into_iter()
            .filter(|node| node.kind == NodeKind::Tool)
            .collect()
    }

    /// Structural well-formedness: non-empty title, unique node names,
    /// resolvable edges and complete tool nodes.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.title.trim().is_empty() {
            return Err(DefinitionError::MissingField("title".to_string()));
        }

        let mut index: BTreeMap<&str, &Node> = BTreeMap::new();
        for node in self.all_nodes() {
            if node.name.trim().is_empty() {
                return Err(DefinitionError::MissingField("node.name".to_string()));
            }
            if index.insert(node.name.as_str(), node).is_some() {
                return Err(DefinitionError::DuplicateNode(node.name.clone()));
            }
            if node.kind == NodeKind::Tool && node.tool.is_none() {
                return Err(DefinitionError::MissingToolSpec(node.name.clone()));
            }
        }

        for (i, edge) in self.edges.iter().enumerate() {
            if !index.contains_key(edge.source.as_str()) {
                return Err(DefinitionError::UnresolvedEdge {
                    edge: i,
                    endpoint: edge.source.clone(),
                });
            }
            if edge.target.names().is_empty() {
                return Err(DefinitionError::Invalid(format!("edge {} has no target", i)));
            }
            for target in edge.target.names() {
                if !index.contains_key(target.as_str()) {
                    return Err(DefinitionError::UnresolvedEdge {
                        edge: i,
                        endpoint: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Normalize an attribute or annotation key: lowercase, `_`/`-` removed.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

pub(crate) fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a Value> {
    let wanted = normalize_key(name);
    attributes
        .iter()
        .find(|attr| normalize_key(&attr.name) == wanted)
        .map(|attr| &attr.value)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub value: Value,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
            value: value.into(),
        }
    }
}

/// A modifier on a machine, node or edge (`@auto`, `@barrier("sync")`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Annotation {
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn with_value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Needs the external agent to pick the outgoing transition.
    Decision,
    /// Resolves automatically.
    Control,
    /// Shared state read and written through the context manager.
    Context,
    /// Execution starts here.
    Entry,
    /// Callable tool offered to decision nodes.
    Tool,
    /// Documentation only.
    Note,
}

impl NodeKind {
    /// Nodes a path can occupy.
    pub fn is_flow(&self) -> bool {
        matches!(self, NodeKind::Decision | NodeKind::Control | NodeKind::Entry)
    }

    pub fn requires_agent(&self) -> bool {
        matches!(self, NodeKind::Decision)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Decision => "decision",
            NodeKind::Control => "control",
            NodeKind::Context => "context",
            NodeKind::Entry => "entry",
            NodeKind::Tool => "tool",
            NodeKind::Note => "note",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolSpec>,
    /// Generated code tried before asking the agent (decision nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeImplementation>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: Vec::new(),
            annotations: Vec::new(),
            children: Vec::new(),
            tool: None,
            code: None,
        }
    }

    pub fn tool(name: impl Into<String>, spec: ToolSpec) -> Self {
        let mut node = Self::new(name, NodeKind::Tool);
        node.tool = Some(spec);
        node
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_code(mut self, code: CodeImplementation) -> Self {
        self.code = Some(code);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        find_attribute(&self.attributes, name)
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations
            .iter()
            .any(|a| normalize_key(&a.name) == normalize_key(name))
    }

    /// Attributes as an object value, in declaration order of first wins.
    pub fn attribute_object(&self) -> Value {
        let mut map = BTreeMap::new();
        for attr in &self.attributes {
            map.entry(attr.name.clone()).or_insert_with(|| attr.value.clone());
        }
        Value::Object(map)
    }
}

/// Target of an edge: one node, or several for a fork.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EdgeTarget {
    Single(String),
    Multiple(Vec<String>),
}

impl EdgeTarget {
    pub fn names(&self) -> &[String] {
        match self {
            EdgeTarget::Single(name) => std::slice::from_ref(name),
            EdgeTarget::Multiple(names) => names,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    pub fn is_multiple(&self) -> bool {
        self.names().len() > 1
    }
}

impl From<&str> for EdgeTarget {
    fn from(s: &str) -> Self {
        EdgeTarget::Single(s.to_string())
    }
}

impl From<String> for EdgeTarget {
    fn from(s: String) -> Self {
        EdgeTarget::Single(s)
    }
}

impl From<Vec<String>> for EdgeTarget {
    fn from(names: Vec<String>) -> Self {
        EdgeTarget::Multiple(names)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuardPolarity {
    #[default]
    If,
    Unless,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guard {
    pub expression: String,
    #[serde(default)]
    pub polarity: GuardPolarity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: EdgeTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<EdgeTarget>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            guard: None,
            annotations: Vec::new(),
            label: None,
        }
    }

    pub fn fork(source: impl Into<String>, targets: Vec<&str>) -> Self {
        Self::new(
            source,
            EdgeTarget::Multiple(targets.into_iter().map(String::from).collect()),
        )
        .with_annotation(Annotation::flag("fork"))
    }

    pub fn when(mut self, expression: impl Into<String>) -> Self {
        self.guard = Some(Guard {
            expression: expression.into(),
            polarity: GuardPolarity::If,
        });
        self
    }

    pub fn unless(mut self, expression: impl Into<String>) -> Self {
        self.guard = Some(Guard {
            expression: expression.into(),
            polarity: GuardPolarity::Unless,
        });
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// First target name; forks have more than one.
    pub fn primary_target(&self) -> &str {
        self.target.names().first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStrategy {
    Agent,
    GeneratedCode,
    Composition,
}

impl fmt::Display for ImplementationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImplementationStrategy::Agent => "agent",
            ImplementationStrategy::GeneratedCode => "generated_code",
            ImplementationStrategy::Composition => "composition",
        };
        write!(f, "{}", s)
    }
}

/// Persisted definition of a tool node; re-materialized into a handler
/// whenever an engine starts from a definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: serde_json::Value,
    pub implementation: ToolImplementation,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl ToolSpec {
    pub fn strategy(&self) -> ImplementationStrategy {
        match self.implementation {
            ToolImplementation::Agent { .. } => ImplementationStrategy::Agent,
            ToolImplementation::GeneratedCode(_) => ImplementationStrategy::GeneratedCode,
            ToolImplementation::Composition { .. } => ImplementationStrategy::Composition,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ToolImplementation {
    Agent { prompt: String },
    GeneratedCode(CodeImplementation),
    Composition { steps: Vec<CompositionStep> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeImplementation {
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositionStep {
    pub tool: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> GraphDefinition {
        let mut def = GraphDefinition::new("sample");
        def.add_node(Node::new("Start", NodeKind::Entry))
            .add_node(
                Node::new("Phase", NodeKind::Control)
                    .with_child(Node::new("Inner", NodeKind::Control)),
            )
            .add_node(Node::new("Memory", NodeKind::Context))
            .connect("Start", "Phase")
            .connect("Inner", "Memory");
        def
    }

    #[test]
    fn validates_well_formed_definition() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn rejects_unresolved_edges() {
        let mut def = sample();
        def.connect("Start", "Nowhere");
        assert_eq!(
            def.validate(),
            Err(DefinitionError::UnresolvedEdge {
                edge: 2,
                endpoint: "Nowhere".to_string()
            })
        );
    }

    #[test]
    fn rejects_duplicate_names_across_hierarchy() {
        let mut def = sample();
        def.add_node(Node::new("Inner", NodeKind::Decision));
        assert_eq!(
            def.validate(),
            Err(DefinitionError::DuplicateNode("Inner".to_string()))
        );
    }

    #[test]
    fn data_edges_are_not_transitions() {
        let def = sample();
        assert!(def.is_transition_edge(&def.edges[0]));
        assert!(!def.is_transition_edge(&def.edges[1]));
    }

    #[test]
    fn parent_lookup_walks_hierarchy() {
        let def = sample();
        assert_eq!(def.parent_of("Inner").map(|n| n.name.as_str()), Some("Phase"));
        assert!(def.parent_of("Start").is_none());
    }

    #[test]
    fn deserializes_json_shape() {
        let def: GraphDefinition = serde_json::from_value(json!({
            "title": "t",
            "attributes": [{"name": "maxSteps", "value": 10}],
            "annotations": [],
            "nodes": [
                {"name": "A", "kind": "entry"},
                {"name": "B", "kind": "control"},
                {"name": "C", "kind": "control"}
            ],
            "edges": [
                {"source": "A", "target": ["B", "C"], "annotations": [{"name": "fork"}]},
                {"source": "B", "target": "C", "guard": {"expression": "x > 1", "polarity": "unless"}}
            ]
        }))
        .unwrap();
        assert_eq!(def.attribute("max_steps"), Some(&Value::Number(10.0)));
        assert!(def.edges[0].target.is_multiple());
        assert_eq!(def.edges[1].guard.as_ref().unwrap().polarity, GuardPolarity::Unless);
    }

    #[test]
    fn missing_top_level_field_fails_to_parse() {
        let parsed: Result<GraphDefinition, _> =
            serde_json::from_value(json!({"title": "t", "nodes": [], "edges": []}));
        assert!(parsed.is_err());
    }

    #[test]
    fn replacement_definition_needs_every_top_level_field() {
        let partial = json!({
            "op": "replace_definition",
            "definition": {"title": "t", "nodes": [], "edges": []}
        });
        assert!(serde_json::from_value::<crate::MutationOp>(partial).is_err());

        let complete = json!({
            "op": "replace_definition",
            "definition": {"title": "t", "attributes": [], "annotations": [], "nodes": [], "edges": []}
        });
        assert!(serde_json::from_value::<crate::MutationOp>(complete).is_ok());
    }
}
