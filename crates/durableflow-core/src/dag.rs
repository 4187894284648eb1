// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Data-flow validation (§9 design notes).
//!
//! The teacher crate builds a `petgraph`-backed DAG from each step's
//! `depends_on` list and rejects cycles before execution. This workflow
//! format has no `depends_on` edges — nesting order *is* the dependency
//! order, so a document can never itself encode a cycle. What it *can* do
//! is reference an artifact key that is never written before the point a
//! step reads it. `WorkflowDag` repurposes the same `petgraph` dependency
//! for that check: one node per store key, one edge per
//! `${artifacts.<key>}` reference found inside a later step's resolved
//! input, and a topological check that every referenced key has an edge
//! from a producer that appears earlier in the graph.

use crate::workflow::{StepGraph, StepNode};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use std::collections::HashMap;

/// A reference from one step's input to another step's output artifact
/// that could not be resolved against any step appearing earlier in the
/// graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    /// The step whose input contains the reference.
    pub consumer: String,
    /// The artifact key referenced (with any `artifacts.` prefix stripped).
    pub key: String,
}

/// A validated view of a step graph's data-flow edges.
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    dangling: Vec<DanglingReference>,
}

impl WorkflowDag {
    /// Builds a DAG from a parsed step graph, walking it in document order
    /// so a store key only becomes resolvable to later steps once its
    /// producing step has been visited.
    pub fn from_steps(graph: &StepGraph) -> Self {
        let mut dag = DiGraph::new();
        let mut index_of = HashMap::new();
        let mut dangling = Vec::new();

        let mut produced: Vec<String> = Vec::new();
        walk_nodes(&graph.steps, &mut dag, &mut index_of, &mut produced, &mut dangling);

        Self {
            graph: dag,
            index_of,
            dangling,
        }
    }

    /// Artifact references that were never produced by an earlier step.
    /// Non-fatal by itself (§9 Open Questions: the executor does not
    /// enforce this ahead of time) but useful as a pre-flight diagnostic.
    pub fn dangling_references(&self) -> &[DanglingReference] {
        &self.dangling
    }

    /// Whether the resulting reference graph contains a cycle. Document
    /// nesting cannot itself produce one, so this is expected to always be
    /// `false`; kept as a defensive check rather than an invariant assumed
    /// silently.
    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Number of distinct artifact-producing steps tracked.
    pub fn node_count(&self) -> usize {
        self.index_of.len()
    }
}

fn walk_nodes(
    nodes: &[StepNode],
    dag: &mut DiGraph<String, ()>,
    index_of: &mut HashMap<String, NodeIndex>,
    produced: &mut Vec<String>,
    dangling: &mut Vec<DanglingReference>,
) {
    for node in nodes {
        match node {
            StepNode::Call(step) => {
                check_input(&step.name, &Value::Object(step.input.clone()), produced, dag, index_of, dangling);
                record_producer(&step.store_key, dag, index_of, produced);
            }
            StepNode::Transform(step) => {
                check_input(&step.name, &Value::Object(step.input.clone()), produced, dag, index_of, dangling);
                record_producer(&step.store_key, dag, index_of, produced);
            }
            StepNode::Parallel(step) => {
                // Branches run concurrently against the same artifacts
                // snapshot, so each is checked against the same `produced`
                // baseline rather than threading through one another.
                for branch in &step.branches {
                    let mut branch_produced = produced.clone();
                    walk_nodes(branch, dag, index_of, &mut branch_produced, dangling);
                    for key in branch_produced {
                        if !produced.contains(&key) {
                            produced.push(key);
                        }
                    }
                }
            }
            StepNode::Loop(step) => {
                walk_nodes(&step.steps, dag, index_of, produced, dangling);
                record_producer(&step.output_key, dag, index_of, produced);
            }
            StepNode::Conditional(step) => {
                walk_nodes(&step.then_steps, dag, index_of, produced, dangling);
                walk_nodes(&step.else_steps, dag, index_of, produced, dangling);
            }
        }
    }
}

fn record_producer(
    store_key: &str,
    dag: &mut DiGraph<String, ()>,
    index_of: &mut HashMap<String, NodeIndex>,
    produced: &mut Vec<String>,
) {
    let key = crate::workflow::strip_artifacts_prefix(store_key).to_string();
    index_of
        .entry(key.clone())
        .or_insert_with(|| dag.add_node(key.clone()));
    if !produced.contains(&key) {
        produced.push(key);
    }
}

fn check_input(
    consumer: &str,
    input: &Value,
    produced: &[String],
    dag: &mut DiGraph<String, ()>,
    index_of: &mut HashMap<String, NodeIndex>,
    dangling: &mut Vec<DanglingReference>,
) {
    for key in referenced_keys(input) {
        if produced.contains(&key) {
            let consumer_idx = *index_of
                .entry(consumer.to_string())
                .or_insert_with(|| dag.add_node(consumer.to_string()));
            let producer_idx = *index_of
                .entry(key.clone())
                .or_insert_with(|| dag.add_node(key.clone()));
            dag.add_edge(producer_idx, consumer_idx, ());
        } else {
            dangling.push(DanglingReference {
                consumer: consumer.to_string(),
                key,
            });
        }
    }
}

/// Scans a resolved-template `Value` tree for `${artifacts.<key>}` /
/// `${<key>}` references, returning the top-level key each names.
fn referenced_keys(value: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(value, &mut keys);
    keys
}

fn collect_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                let after = &rest[start + 2..];
                if let Some(end) = after.find('}') {
                    let path = &after[..end];
                    if let Some(key) = top_level_artifact_key(path) {
                        out.push(key);
                    }
                    rest = &after[end + 1..];
                } else {
                    break;
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_keys(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_keys(v, out)),
        _ => {}
    }
}

fn top_level_artifact_key(path: &str) -> Option<String> {
    let stripped = path
        .strip_prefix("artifacts.")
        .or_else(|| path.strip_prefix("context."))
        .unwrap_or(path);
    if path.starts_with("input.") {
        return None;
    }
    stripped.split('.').next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{CallStep, StepGraph, StepNode};
    use serde_json::json;

    fn call(name: &str, store_key: &str, input: Value) -> StepNode {
        StepNode::Call(CallStep {
            name: name.to_string(),
            agent_id: name.to_string(),
            input: input.as_object().cloned().unwrap_or_default(),
            store_key: store_key.to_string(),
            retry: None,
        })
    }

    #[test]
    fn resolvable_reference_yields_an_edge() {
        let graph = StepGraph {
            steps: vec![
                call("first", "artifacts.first", json!({})),
                call("second", "artifacts.second", json!({"q": "${artifacts.first}"})),
            ],
        };
        let dag = WorkflowDag::from_steps(&graph);
        assert!(dag.dangling_references().is_empty());
        assert!(!dag.has_cycle());
        assert_eq!(dag.node_count(), 3);
    }

    #[test]
    fn forward_reference_is_dangling() {
        let graph = StepGraph {
            steps: vec![call(
                "first",
                "artifacts.first",
                json!({"q": "${artifacts.second}"}),
            )],
        };
        let dag = WorkflowDag::from_steps(&graph);
        assert_eq!(
            dag.dangling_references(),
            &[DanglingReference {
                consumer: "first".to_string(),
                key: "second".to_string(),
            }]
        );
    }

    #[test]
    fn input_prefixed_references_are_not_tracked() {
        let graph = StepGraph {
            steps: vec![call("first", "artifacts.first", json!({"q": "${input.x}"}))],
        };
        let dag = WorkflowDag::from_steps(&graph);
        assert!(dag.dangling_references().is_empty());
    }
}
