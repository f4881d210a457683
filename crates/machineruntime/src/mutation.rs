use crate::sync::SynchronizationManager;
use chrono::{DateTime, Utc};
use machinecore::{
    DefinitionError, ExecutionState, GraphDefinition, Mutation, MutationError, MutationKind,
    MutationOp, Node, NodeKind, PathId,
};
use std::sync::Arc;

/// A mutation recorded against the snapshot it will replace.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub path_id: PathId,
    pub op: MutationOp,
}

#[derive(Debug, Default)]
pub struct MutationCommit {
    pub committed: Vec<Mutation>,
    pub rejected: Vec<(PathId, MutationKind, MutationError)>,
    /// Tool nodes added or changed by the committed operations.
    pub tools: Vec<String>,
}

/// Applies edits to definition snapshots. Nothing here touches a snapshot
/// in place: every operation works on a copy, and `commit` swaps the new
/// snapshot into the state in one assignment.
pub struct MetaMutationManager;

impl MetaMutationManager {
    /// Apply one operation to a copy of `definition`, validating the result.
    pub fn apply(op: &MutationOp, definition: &GraphDefinition) -> Result<GraphDefinition, MutationError> {
        let mut next = match op {
            MutationOp::ReplaceDefinition { definition } => definition.clone(),
            _ => definition.clone(),
        };

        match op {
            MutationOp::ReplaceDefinition { .. } => {}
            MutationOp::AddNode { node, parent } => {
                if next.find_node(&node.name).is_some() {
                    return Err(MutationError::NodeExists(node.name.clone()));
                }
                match parent {
                    Some(parent) => next
                        .find_node_mut(parent)
                        .ok_or_else(|| DefinitionError::NodeNotFound(parent.clone()))?
                        .children
                        .push(node.clone()),
                    None => next.nodes.push(node.clone()),
                }
            }
            MutationOp::ModifyNode {
                name,
                kind,
                attributes,
                annotations,
            } => {
                let node = next
                    .find_node_mut(name)
                    .ok_or_else(|| DefinitionError::NodeNotFound(name.clone()))?;
                if let Some(kind) = kind {
                    node.kind = *kind;
                }
                for attr in attributes {
                    match node.attributes.iter_mut().find(|a| a.name == attr.name) {
                        Some(existing) => *existing = attr.clone(),
                        None => node.attributes.push(attr.clone()),
                    }
                }
                for annotation in annotations {
                    if !node.annotations.contains(annotation) {
                        node.annotations.push(annotation.clone());
                    }
                }
            }
            MutationOp::AddEdge { edge } => {
                next.edges.push(edge.clone());
            }
            MutationOp::ModifyEdge {
                index,
                guard,
                annotations,
                label,
            } => {
                let edge = next
                    .edges
                    .get_mut(*index)
                    .ok_or(MutationError::EdgeNotFound(*index))?;
                if guard.is_some() {
                    edge.guard = guard.clone();
                }
                if let Some(annotations) = annotations {
                    edge.annotations = annotations.clone();
                }
                if label.is_some() {
                    edge.label = label.clone();
                }
            }
            MutationOp::ConstructTool { name, spec } => match next.find_node_mut(name) {
                Some(existing) if existing.kind == NodeKind::Tool => {
                    existing.tool = Some(spec.clone());
                }
                Some(_) => return Err(MutationError::NodeExists(name.clone())),
                None => next.nodes.push(Node::tool(name.clone(), spec.clone())),
            },
        }

        next.validate()?;
        SynchronizationManager::validate(&next)?;
        Ok(next)
    }

    pub fn record(op: &MutationOp, tick: u64, path_id: Option<PathId>, now: DateTime<Utc>) -> Mutation {
        Mutation {
            kind: op.kind(),
            payload: serde_json::to_value(op).unwrap_or_default(),
            timestamp: now,
            tick,
            path_id,
        }
    }

    /// Tool nodes an operation defines.
    pub fn tools_of(op: &MutationOp) -> Vec<String> {
        match op {
            MutationOp::ConstructTool { name, .. } => vec![name.clone()],
            MutationOp::AddNode { node, .. } if node.kind == NodeKind::Tool => {
                vec![node.name.clone()]
            }
            MutationOp::ReplaceDefinition { definition } => definition
                .tool_nodes()
                .into_iter()
                .map(|n| n.name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Apply pending operations in order on top of the current snapshot
    /// and swap the result in. Each operation is re-validated against the
    /// snapshot produced by the ones before it; a rejected operation leaves
    /// that snapshot untouched.
    pub fn commit(state: &mut ExecutionState, pending: Vec<PendingMutation>, now: DateTime<Utc>) -> MutationCommit {
        let mut result = MutationCommit::default();
        if pending.is_empty() {
            return result;
        }

        let tick = state.metadata.tick;
        let mut working = state.definition.as_ref().clone();
        for PendingMutation { path_id, op } in pending {
            match Self::apply(&op, &working) {
                Ok(next) => {
                    working = next;
                    result.tools.extend(Self::tools_of(&op));
                    result.committed.push(Self::record(&op, tick, Some(path_id), now));
                }
                Err(e) => {
                    tracing::warn!(path_id, kind = ?op.kind(), error = %e, "mutation rejected at commit");
                    result.rejected.push((path_id, op.kind(), e));
                }
            }
        }

        if !result.committed.is_empty() {
            state.definition = Arc::new(working);
            state.mutations.extend(result.committed.iter().cloned());
        }
        result
    }
}
