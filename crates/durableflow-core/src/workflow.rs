// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Step graph data model (§3, §4.2).
//!
//! Generalizes the teacher crate's flat `Step { step_type, depends_on, ... }`
//! DAG into the five structurally nested node kinds the workflow document
//! format requires: `Call`, `Parallel`, `Loop`, `Conditional`, `Transform`.
//! Nesting replaces explicit `depends_on` edges — order within a sequence
//! *is* the dependency order, and `Parallel`/`Loop` carry their own nested
//! sequences rather than being flagged on a flat step list.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// One node in a step graph. Tagged-variant dispatch (§9 design notes):
/// adding a step type is a closed, compile-checked change via an exhaustive
/// `match` in the orchestration executor.
#[derive(Debug, Clone)]
pub enum StepNode {
    /// Invoke a sub-agent.
    Call(CallStep),
    /// Execute branches concurrently against shared artifacts.
    Parallel(ParallelStep),
    /// Iterate a resolved sequence, running nested steps per item.
    Loop(LoopStep),
    /// Evaluate a condition and run one of two branches.
    Conditional(ConditionalStep),
    /// Invoke a registered deterministic transform.
    Transform(TransformStep),
}

impl StepNode {
    /// The human-facing name derived from this node's enclosing header,
    /// used to build start-of-step progress messages (§4.9 step 4).
    pub fn name(&self) -> &str {
        match self {
            StepNode::Call(s) => &s.name,
            StepNode::Parallel(s) => &s.name,
            StepNode::Loop(s) => &s.name,
            StepNode::Conditional(s) => &s.name,
            StepNode::Transform(s) => &s.name,
        }
    }
}

/// How a `Call` step should react when its retry policy is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Re-raise, halting the enclosing run.
    Abort,
    /// Store `null` (or the fallback artifact) and continue.
    Continue,
}

impl Default for OnFailure {
    fn default() -> Self {
        Self::Abort
    }
}

/// A `Call` step's retry policy (§4.2 step 5). Defaults: 1 attempt,
/// 1000 ms delay, x1 multiplier, abort on exhaustion.
#[derive(Debug, Clone)]
pub struct CallRetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// What to do once retries are exhausted.
    pub on_failure: OnFailure,
    /// Artifact key to copy into `storeKey` when `on_failure == Continue`
    /// and no prior value exists to fall back to literally.
    pub fallback_store: Option<String>,
}

impl Default for CallRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 1000,
            backoff_multiplier: 1.0,
            on_failure: OnFailure::Abort,
            fallback_store: None,
        }
    }
}

/// Invoke a sub-agent identified by `agent_id`.
#[derive(Debug, Clone)]
pub struct CallStep {
    /// Name derived from the enclosing header.
    pub name: String,
    /// The sub-agent's id.
    pub agent_id: String,
    /// Input-template mapping, resolved against the current context before
    /// invocation.
    pub input: Map<String, Value>,
    /// Artifact key the result is stored under. Defaults to
    /// `artifacts.<last-slash-segment-of-agentId>` when omitted in the
    /// document.
    pub store_key: String,
    /// Optional retry policy.
    pub retry: Option<CallRetryPolicy>,
}

/// An ordered set of branches executed concurrently against shared
/// artifacts.
#[derive(Debug, Clone)]
pub struct ParallelStep {
    /// Name derived from the enclosing header.
    pub name: String,
    /// Each branch is itself a step sequence.
    pub branches: Vec<Vec<StepNode>>,
}

/// Where a `Loop` step's iteration sequence comes from.
#[derive(Debug, Clone)]
pub enum LoopSource {
    /// A literal array given directly in the document.
    Literal(Vec<Value>),
    /// A template path resolved at execution time to a sequence.
    Path(String),
}

/// Concurrency mode for a `Loop` step's iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Each iteration runs against an isolated artifacts view, concurrently.
    Parallel,
    /// Each iteration mutates the shared artifacts in place, in order.
    Sequential,
}

impl Default for LoopMode {
    fn default() -> Self {
        Self::Parallel
    }
}

/// Iterate a resolved sequence, binding `item` (and `item_index`) and
/// running the nested steps once per item.
#[derive(Debug, Clone)]
pub struct LoopStep {
    /// Name derived from the enclosing header.
    pub name: String,
    /// The sequence to iterate.
    pub over: LoopSource,
    /// Variable name bound to the current item (default `"item"`).
    pub item_var: String,
    /// Concurrency mode.
    pub mode: LoopMode,
    /// Nested steps run once per iteration.
    pub steps: Vec<StepNode>,
    /// Artifact key the collected sequence is stored under. Defaults to
    /// `artifacts.loopResult`.
    pub output_key: String,
}

/// A boolean expression and two branches.
#[derive(Debug, Clone)]
pub struct ConditionalStep {
    /// Name derived from the enclosing header.
    pub name: String,
    /// The condition text, evaluated by the template resolver.
    pub condition: String,
    /// Steps run when the condition is true.
    pub then_steps: Vec<StepNode>,
    /// Steps run when the condition is false, if any.
    pub else_steps: Vec<StepNode>,
}

/// Invoke a registered deterministic transform function.
#[derive(Debug, Clone)]
pub struct TransformStep {
    /// Name derived from the enclosing header.
    pub name: String,
    /// The transform's registered id.
    pub transform_id: String,
    /// Input-template mapping.
    pub input: Map<String, Value>,
    /// Artifact key the result is stored under.
    pub store_key: String,
}

/// The parsed step graph for one workflow document: an ordered top-level
/// sequence of nodes. Workflow graphs are strict trees/DAGs by
/// construction (§9) — there is no cycle handling because the document's
/// nesting cannot express one.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    /// Top-level steps, in document order.
    pub steps: Vec<StepNode>,
}

impl StepGraph {
    /// Number of top-level steps, used for the progress-range split in
    /// §4.9 (`[10 + i*80/N, 10 + (i+1)*80/N]`).
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Derives the default store key for a `Call` step: the last `/`-segment
/// of the agent id, under `artifacts.`.
pub fn default_call_store_key(agent_id: &str) -> String {
    let segment = agent_id.rsplit('/').next().unwrap_or(agent_id);
    format!("artifacts.{segment}")
}

/// The default output key for a `Loop` step.
pub const DEFAULT_LOOP_OUTPUT_KEY: &str = "artifacts.loopResult";

/// Strips a leading `artifacts.` / `input.` prefix from a storage key,
/// since artifact reads/writes inside [`crate::context::ExecutionContext`]
/// operate relative to the artifacts map already.
pub fn strip_artifacts_prefix(key: &str) -> &str {
    key.strip_prefix("artifacts.").unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_key_uses_last_segment() {
        assert_eq!(
            default_call_store_key("team/researcher"),
            "artifacts.researcher"
        );
        assert_eq!(default_call_store_key("researcher"), "artifacts.researcher");
    }

    #[test]
    fn strip_prefix_removes_artifacts() {
        assert_eq!(strip_artifacts_prefix("artifacts.foo"), "foo");
        assert_eq!(strip_artifacts_prefix("foo"), "foo");
    }
}
