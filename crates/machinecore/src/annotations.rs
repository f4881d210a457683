//! Annotation processing.
//!
//! Turns the free-form annotations on machines, nodes and edges into typed
//! configuration. Names are case-insensitive and aliases collapse onto one
//! canonical kind. Everything here is a pure function of the definition.

use crate::definition::normalize_key;
use crate::{
    Annotation, DefinitionError, Edge, GraphDefinition, Limits, Node, StaleWritePolicy,
    TimeoutScope, Value,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationKind {
    Automatic,
    Barrier,
    /// A barrier whose release collapses the arriving paths into one.
    Join,
    Merge,
    Fork,
    Priority,
    Retry,
    Timeout,
    Meta,
    Final,
    Entry,
    FailFast,
    /// Node waits on failed guards instead of ending the path.
    Hold,
    Other(String),
}

pub fn classify(name: &str) -> AnnotationKind {
    match normalize_key(name).as_str() {
        "auto" | "automatic" => AnnotationKind::Automatic,
        "barrier" | "sync" | "wait" => AnnotationKind::Barrier,
        "join" => AnnotationKind::Join,
        "merge" => AnnotationKind::Merge,
        "fork" | "parallel" | "fanout" => AnnotationKind::Fork,
        "priority" => AnnotationKind::Priority,
        "retry" | "retries" => AnnotationKind::Retry,
        "timeout" => AnnotationKind::Timeout,
        "meta" => AnnotationKind::Meta,
        "final" | "terminal" => AnnotationKind::Final,
        "entry" | "start" | "init" => AnnotationKind::Entry,
        "failfast" => AnnotationKind::FailFast,
        "hold" | "await" => AnnotationKind::Hold,
        other => AnnotationKind::Other(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BarrierSpec {
    pub id: String,
    pub merge: bool,
    /// Arrival count stated on the annotation, checked against the
    /// number of edges sharing the id at load time.
    pub expected: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EdgeConfig {
    pub automatic: bool,
    pub fork: bool,
    pub barrier: Option<BarrierSpec>,
    pub priority: i64,
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl EdgeConfig {
    pub fn from_edge(edge: &Edge) -> Self {
        let mut config = EdgeConfig::default();
        let mut merge = false;
        for annotation in &edge.annotations {
            match classify(&annotation.name) {
                AnnotationKind::Automatic => config.automatic = true,
                AnnotationKind::Fork => config.fork = true,
                AnnotationKind::Barrier | AnnotationKind::Join => {
                    let (id, expected) = barrier_parts(annotation, edge);
                    merge |= classify(&annotation.name) == AnnotationKind::Join;
                    config.barrier = Some(BarrierSpec {
                        id,
                        merge: false,
                        expected,
                    });
                }
                AnnotationKind::Merge => merge = true,
                AnnotationKind::Priority => {
                    config.priority = number(annotation).map(|n| n as i64).unwrap_or(0)
                }
                AnnotationKind::Retry => config.retry = number(annotation).map(|n| n as u32),
                AnnotationKind::Timeout => {
                    config.timeout_ms = annotation.value.as_ref().and_then(duration_ms)
                }
                _ => {}
            }
        }
        if let Some(barrier) = config.barrier.as_mut() {
            barrier.merge = merge;
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeConfig {
    pub parallel: bool,
    pub meta: bool,
    pub terminal: bool,
    pub entry: bool,
    pub hold: bool,
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl NodeConfig {
    pub fn from_node(node: &Node) -> Self {
        let mut config = NodeConfig::default();
        for annotation in &node.annotations {
            match classify(&annotation.name) {
                AnnotationKind::Fork => config.parallel = true,
                AnnotationKind::Meta => config.meta = true,
                AnnotationKind::Final => config.terminal = true,
                AnnotationKind::Entry => config.entry = true,
                AnnotationKind::Hold => config.hold = true,
                AnnotationKind::Retry => config.retry = number(annotation).map(|n| n as u32),
                AnnotationKind::Timeout => {
                    config.timeout_ms = annotation.value.as_ref().and_then(duration_ms)
                }
                _ => {}
            }
        }
        config
    }
}

/// `@barrier("sync")`, `@barrier(["sync", 2])`, `@barrier({"id": "sync",
/// "count": 2})`; a bare `@barrier` is keyed by the edge's target.
fn barrier_parts(annotation: &Annotation, edge: &Edge) -> (String, Option<usize>) {
    match &annotation.value {
        Some(Value::String(id)) => (id.clone(), None),
        Some(Value::Array(items)) => {
            let id = items
                .first()
                .map(|v| v.to_string())
                .unwrap_or_else(|| edge.primary_target().to_string());
            let count = items.get(1).and_then(Value::as_f64).map(|n| n as usize);
            (id, count)
        }
        Some(Value::Object(map)) => {
            let id = map
                .get("id")
                .map(|v| v.to_string())
                .unwrap_or_else(|| edge.primary_target().to_string());
            let count = map.get("count").and_then(Value::as_f64).map(|n| n as usize);
            (id, count)
        }
        Some(other) if !other.is_null() => (other.to_string(), None),
        _ => (edge.primary_target().to_string(), None),
    }
}

fn number(annotation: &Annotation) -> Option<f64> {
    match annotation.value.as_ref()? {
        Value::Number(n) => Some(*n),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Durations are milliseconds when numeric; strings accept `ms`, `s`, `m`
/// and `h` suffixes.
pub fn duration_ms(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) if *n >= 0.0 => Some(*n as u64),
        Value::String(s) => {
            let s = s.trim().to_lowercase();
            let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
            let (digits, unit) = s.split_at(split);
            let amount: f64 = digits.parse().ok()?;
            let factor = match unit.trim() {
                "" | "ms" => 1.0,
                "s" | "sec" | "secs" => 1_000.0,
                "m" | "min" | "mins" => 60_000.0,
                "h" | "hr" | "hrs" => 3_600_000.0,
                _ => return None,
            };
            Some((amount * factor) as u64)
        }
        _ => None,
    }
}

fn as_u64(name: &str, value: &Value) -> Result<u64, DefinitionError> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
        .ok_or_else(|| DefinitionError::InvalidAttribute {
            name: name.to_string(),
            reason: format!("expected a non-negative number, got {}", value.type_name()),
        })
}

fn as_bool(name: &str, value: &Value) -> Result<bool, DefinitionError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(DefinitionError::InvalidAttribute {
            name: name.to_string(),
            reason: format!("expected a boolean, got {}", other.type_name()),
        }),
    }
}

/// Merge machine-level attributes and annotations over caller defaults.
/// Values set by the definition take precedence.
pub fn machine_limits(definition: &GraphDefinition, defaults: &Limits) -> Result<Limits, DefinitionError> {
    let mut limits = defaults.clone();

    for attr in &definition.attributes {
        let name = attr.name.as_str();
        let value = &attr.value;
        match normalize_key(name).as_str() {
            "maxsteps" => limits.max_steps = as_u64(name, value)?,
            "maxpathsteps" | "maxstepsperpath" => limits.max_path_steps = as_u64(name, value)?,
            "maxnodeinvocations" | "maxinvocations" => {
                limits.max_node_invocations = as_u64(name, value)?
            }
            "timeout" | "timeoutms" => {
                limits.timeout_ms = Some(duration_ms(value).ok_or_else(|| {
                    DefinitionError::InvalidAttribute {
                        name: name.to_string(),
                        reason: "expected a duration".to_string(),
                    }
                })?)
            }
            "timeoutscope" => {
                limits.timeout_scope = match value.as_str().map(normalize_key).as_deref() {
                    Some("run") => TimeoutScope::Run,
                    Some("path") => TimeoutScope::Path,
                    _ => {
                        return Err(DefinitionError::InvalidAttribute {
                            name: name.to_string(),
                            reason: "expected 'run' or 'path'".to_string(),
                        })
                    }
                }
            }
            "cyclewindow" => limits.cycle_window = as_u64(name, value)? as usize,
            "maxcyclerepeats" | "cyclerepeats" => {
                limits.max_cycle_repeats = as_u64(name, value)? as u32
            }
            "maxconcurrentpaths" | "maxpaths" => {
                limits.max_concurrent_paths = as_u64(name, value)? as usize
            }
            "failfast" => limits.fail_fast = as_bool(name, value)?,
            "limitsfatal" => limits.limits_fatal = as_bool(name, value)?,
            "stalewrites" | "stalewritepolicy" => {
                limits.stale_writes = match value.as_str().map(normalize_key).as_deref() {
                    Some("fail") | Some("failfast") => StaleWritePolicy::Fail,
                    Some("queue") => StaleWritePolicy::Queue,
                    _ => {
                        return Err(DefinitionError::InvalidAttribute {
                            name: name.to_string(),
                            reason: "expected 'fail' or 'queue'".to_string(),
                        })
                    }
                }
            }
            "confidencethreshold" => {
                limits.confidence_threshold = value.as_f64().ok_or_else(|| {
                    DefinitionError::InvalidAttribute {
                        name: name.to_string(),
                        reason: "expected a number".to_string(),
                    }
                })?
            }
            "maxagentturns" => limits.max_agent_turns = as_u64(name, value)? as usize,
            _ => {}
        }
    }

    if definition
        .annotations
        .iter()
        .any(|a| classify(&a.name) == AnnotationKind::FailFast)
    {
        limits.fail_fast = true;
    }

    // A repeat can only be observed inside a window that holds it.
    let needed = (limits.max_cycle_repeats as usize + 1) * 2;
    if limits.cycle_window < needed {
        limits.cycle_window = needed;
    }
    Ok(limits)
}
