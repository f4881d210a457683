//! Shared-state access.
//!
//! Context nodes hold versioned values. Reads during a tick see the
//! snapshot committed before the tick plus the reader's own staged writes;
//! writes become visible to other paths only after the tick commits.

use machinecore::{
    ContextEntry, ContextStore, ContextWrite, EvalContext, ExecutionPath, GraphDefinition,
    NodeKind, PathId, StaleWritePolicy, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("'{node}' is not a context node")]
    UnknownNode { node: String },

    #[error("'{decision}' may not {access} '{node}'")]
    PermissionDenied {
        decision: String,
        node: String,
        access: &'static str,
    },

    #[error("'{decision}' may not write field '{field}' of '{node}'")]
    FieldDenied {
        decision: String,
        node: String,
        field: String,
    },

    #[error("stale write to '{node}': based on version {base}, current is {current}")]
    Stale { node: String, base: u64, current: u64 },
}

/// Access a decision node has to one context node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub store: bool,
    /// Field restriction; `None` means every field.
    pub fields: Option<BTreeSet<String>>,
}

impl Permissions {
    pub fn can_write(&self) -> bool {
        self.write || self.store
    }

    pub fn any(&self) -> bool {
        self.read || self.can_write()
    }

    pub fn allows_field(&self, field: &str) -> bool {
        self.fields.as_ref().map_or(true, |f| f.contains(field))
    }

    fn merge(&mut self, other: Permissions) {
        self.read |= other.read;
        self.write |= other.write;
        self.store |= other.store;
    }
}

/// Permission keywords mined from an edge label, with any field list given
/// after a colon or in parentheses: `"write: status, count"`,
/// `"reads(total)"`.
fn parse_label(label: &str) -> Option<(Permissions, Option<BTreeSet<String>>)> {
    let (verbs, fields) = match label.find([':', '(']) {
        Some(pos) => (&label[..pos], Some(&label[pos + 1..])),
        None => (label, None),
    };

    let mut perms = Permissions::default();
    for word in verbs.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        match word {
            "read" | "reads" | "get" | "load" => perms.read = true,
            "write" | "writes" | "update" | "set" => perms.write = true,
            "store" | "stores" | "save" | "persist" => perms.store = true,
            "readwrite" | "rw" => {
                perms.read = true;
                perms.write = true;
            }
            _ => {}
        }
    }
    if !perms.any() {
        return None;
    }

    let fields = fields
        .map(|rest| {
            rest.trim_end()
                .trim_end_matches(')')
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect::<BTreeSet<_>>()
        })
        .filter(|f| !f.is_empty());
    Some((perms, fields))
}

pub struct ContextManager;

impl ContextManager {
    /// Permissions of `decision` (or any of its ancestors) on `state_node`.
    /// Edge direction decides by default: decision to context grants write
    /// and store, context to decision grants read. Label keywords override.
    pub fn permissions(definition: &GraphDefinition, decision: &str, state_node: &str) -> Permissions {
        let mut scope = vec![decision.to_string()];
        let mut current = decision.to_string();
        while let Some(parent) = definition.parent_of(&current) {
            scope.push(parent.name.clone());
            current = parent.name.clone();
        }

        let mut result = Permissions::default();
        let mut fields: Option<BTreeSet<String>> = Some(BTreeSet::new());
        let mut any_edge = false;

        for edge in &definition.edges {
            let outbound = scope.contains(&edge.source) && edge.target.contains(state_node);
            let inbound = edge.source == state_node
                && scope.iter().any(|name| edge.target.contains(name));
            if !outbound && !inbound {
                continue;
            }
            any_edge = true;

            let (perms, edge_fields) = match edge.label.as_deref().and_then(parse_label) {
                Some(parsed) => parsed,
                None if outbound => (
                    Permissions {
                        write: true,
                        store: true,
                        ..Permissions::default()
                    },
                    None,
                ),
                None => (
                    Permissions {
                        read: true,
                        ..Permissions::default()
                    },
                    None,
                ),
            };
            result.merge(perms);
            fields = match (fields, edge_fields) {
                (Some(mut acc), Some(more)) => {
                    acc.extend(more);
                    Some(acc)
                }
                _ => None,
            };
        }

        if any_edge {
            result.fields = fields;
        }
        result
    }

    /// Create version-0 entries for context nodes not yet in the store,
    /// seeded from their attributes.
    pub fn seed(store: &mut ContextStore, definition: &GraphDefinition) {
        for node in definition.all_nodes() {
            if node.kind != NodeKind::Context || store.entries.contains_key(&node.name) {
                continue;
            }
            let values = node
                .attributes
                .iter()
                .map(|attr| (attr.name.clone(), attr.value.clone()))
                .collect();
            store
                .entries
                .insert(node.name.clone(), ContextEntry { version: 0, values });
        }
    }

    /// Apply staged writes in order. Queued writes from the previous commit
    /// go first, rebased onto the current version.
    pub fn commit(
        store: &mut ContextStore,
        writes: Vec<ContextWrite>,
        policy: StaleWritePolicy,
    ) -> CommitReport {
        let mut report = CommitReport::default();

        for mut write in std::mem::take(&mut store.queued) {
            let entry = store.entries.entry(write.node.clone()).or_default();
            write.base_version = entry.version;
            Self::apply(entry, &write);
            report.applied.push(write);
        }

        for write in writes {
            let entry = store.entries.entry(write.node.clone()).or_default();
            if write.base_version < entry.version {
                let error = ContextError::Stale {
                    node: write.node.clone(),
                    base: write.base_version,
                    current: entry.version,
                };
                match policy {
                    StaleWritePolicy::Fail => report.rejected.push((write, error)),
                    StaleWritePolicy::Queue => {
                        report.queued += 1;
                        store.queued.push(write);
                    }
                }
                continue;
            }
            Self::apply(entry, &write);
            report.applied.push(write);
        }
        report
    }

    fn apply(entry: &mut ContextEntry, write: &ContextWrite) {
        for (key, value) in &write.values {
            entry.values.insert(key.clone(), value.clone());
        }
        entry.version += 1;
    }

    /// Attribute context for guard evaluation at `node`: machine attributes,
    /// every node's attributes qualified by node name, committed context
    /// values (overriding context-node attributes) and finally the current
    /// node's own attributes unqualified.
    pub fn eval_context(
        definition: &GraphDefinition,
        committed: &BTreeMap<String, ContextEntry>,
        path: &ExecutionPath,
    ) -> EvalContext {
        let mut ctx = EvalContext::new();
        for attr in &definition.attributes {
            ctx.insert(attr.name.clone(), attr.value.clone());
        }
        for node in definition.all_nodes() {
            let mut values = match node.attribute_object() {
                Value::Object(map) => map,
                _ => BTreeMap::new(),
            };
            if let Some(entry) = committed.get(&node.name) {
                values.extend(entry.values.clone());
            }
            ctx.insert(node.name.clone(), Value::Object(values));
        }
        if let Some(Value::Object(own)) = definition
            .find_node(&path.current_node)
            .map(|node| node.attribute_object())
        {
            ctx.extend_object(None, &own);
        }
        ctx.insert("steps", path.step_count as f64);
        ctx
    }
}

#[derive(Debug, Default)]
pub struct CommitReport {
    pub applied: Vec<ContextWrite>,
    pub rejected: Vec<(ContextWrite, ContextError)>,
    pub queued: usize,
}

/// One path's view of shared state during a tick.
#[derive(Debug, Clone)]
pub struct ContextView {
    path_id: PathId,
    committed: Arc<BTreeMap<String, ContextEntry>>,
    staged: Vec<ContextWrite>,
}

impl ContextView {
    pub fn new(path_id: PathId, committed: Arc<BTreeMap<String, ContextEntry>>) -> Self {
        Self {
            path_id,
            committed,
            staged: Vec::new(),
        }
    }

    /// Committed version plus this path's own staged writes.
    pub fn read(&self, node: &str) -> Option<ContextEntry> {
        let mut entry = self.committed.get(node).cloned()?;
        for write in self.staged.iter().filter(|w| w.node == node) {
            entry.values.extend(write.values.clone());
        }
        Some(entry)
    }

    pub fn committed_version(&self, node: &str) -> Option<u64> {
        self.committed.get(node).map(|e| e.version)
    }

    /// Stage a write. `base_version` defaults to the committed version the
    /// path read; an older base is stale and rejected under `Fail`.
    pub fn stage(
        &mut self,
        node: &str,
        values: BTreeMap<String, Value>,
        base_version: Option<u64>,
        policy: StaleWritePolicy,
    ) -> Result<u64, ContextError> {
        let current = self
            .committed_version(node)
            .ok_or_else(|| ContextError::UnknownNode {
                node: node.to_string(),
            })?;
        let base = base_version.unwrap_or(current);
        if base < current && policy == StaleWritePolicy::Fail {
            return Err(ContextError::Stale {
                node: node.to_string(),
                base,
                current,
            });
        }
        self.staged.push(ContextWrite {
            path_id: self.path_id,
            node: node.to_string(),
            values,
            base_version: base,
        });
        Ok(base)
    }

    /// Staged writes, at most one per node: repeated writes to a node in
    /// one turn are folded together and keep the oldest base version.
    pub fn into_writes(self) -> Vec<ContextWrite> {
        let mut folded: Vec<ContextWrite> = Vec::new();
        for write in self.staged {
            match folded.iter_mut().find(|w| w.node == write.node) {
                Some(existing) => {
                    existing.values.extend(write.values);
                    existing.base_version = existing.base_version.min(write.base_version);
                }
                None => folded.push(write),
            }
        }
        folded
    }
}
