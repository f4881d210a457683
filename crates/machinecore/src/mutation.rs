use crate::{Annotation, Attribute, Edge, GraphDefinition, Guard, Node, NodeKind, PathId, ToolSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    AddNode,
    ModifyNode,
    AddEdge,
    ModifyEdge,
    ToolConstructed,
    DefinitionReplaced,
}

/// Append-only audit record of a committed change to the definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_id: Option<PathId>,
}

/// A requested change to the running definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    ReplaceDefinition {
        definition: GraphDefinition,
    },
    AddNode {
        node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    ModifyNode {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<NodeKind>,
        /// Upserted by name.
        #[serde(default)]
        attributes: Vec<Attribute>,
        /// Appended unless already present.
        #[serde(default)]
        annotations: Vec<Annotation>,
    },
    AddEdge {
        edge: Edge,
    },
    ModifyEdge {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guard: Option<Guard>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotations: Option<Vec<Annotation>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    ConstructTool {
        name: String,
        spec: ToolSpec,
    },
}

impl MutationOp {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationOp::ReplaceDefinition { .. } => MutationKind::DefinitionReplaced,
            MutationOp::AddNode { .. } => MutationKind::AddNode,
            MutationOp::ModifyNode { .. } => MutationKind::ModifyNode,
            MutationOp::AddEdge { .. } => MutationKind::AddEdge,
            MutationOp::ModifyEdge { .. } => MutationKind::ModifyEdge,
            MutationOp::ConstructTool { .. } => MutationKind::ToolConstructed,
        }
    }
}
