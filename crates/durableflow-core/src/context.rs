// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Orchestration context (§3): the `input` / `artifacts` pair every step
//! reads and writes against, plus the dot-notation read helper used by
//! skip-synthesis output selection (§4.9 step 5).

use crate::template;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

/// The two-slot context every step sees: the original input (read-only)
/// and the artifacts map (append-only; a step may only overwrite the key
/// it owns).
#[derive(Clone)]
pub struct ExecutionContext {
    input: Arc<Value>,
    artifacts: Arc<DashMap<String, Value>>,
}

impl ExecutionContext {
    /// Builds a fresh context with `artifacts = { input }` per §4.9 step 3.
    pub fn new(input: Value) -> Self {
        Self {
            input: Arc::new(input),
            artifacts: Arc::new(DashMap::new()),
        }
    }

    /// The original input value.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Reads an artifact by top-level key (no dot-notation).
    pub fn get(&self, key: &str) -> Option<Value> {
        self.artifacts.get(key).map(|v| v.clone())
    }

    /// Writes an artifact, overwriting any prior value for the same key.
    /// Per §3's invariant, callers are expected to only ever call this with
    /// the key they themselves own.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.artifacts.insert(key.into(), value);
    }

    /// Reads an artifact via dot-notation (`"final.value"` reads
    /// `artifacts["final"]["value"]`). Returns `None` if any segment along
    /// the way is absent, which the caller (skip-synthesis output
    /// selection) treats as a fatal "artifact not found".
    pub fn get_dotted(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for seg in segments {
            current = current.get(seg)?.clone();
        }
        Some(current)
    }

    /// Snapshot of the artifacts map as a JSON object, e.g. to feed a
    /// synthesis worker's input.
    pub fn artifacts_snapshot(&self) -> Value {
        let map: Map<String, Value> = self
            .artifacts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Value::Object(map)
    }

    /// Top-level artifact keys currently present, for diagnostics (e.g. a
    /// fatal "artifact not found" error listing what *is* available).
    pub fn artifact_keys(&self) -> Vec<String> {
        self.artifacts.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolves an input-template mapping against this context (§4.1).
    pub fn resolve_input_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        template::resolve_input_map(map, &self.input, &self.artifacts_snapshot())
    }

    /// Resolves a single `${...}`-bearing string against this context.
    pub fn resolve_string(&self, s: &str) -> String {
        template::resolve_string(s, &self.input, &self.artifacts_snapshot())
    }

    /// Evaluates a boolean condition against this context (§4.1). Total:
    /// never panics, defaults to `false` on any failure.
    pub fn evaluate_condition(&self, condition: &str) -> bool {
        template::evaluate_condition(condition, &self.input, &self.artifacts_snapshot())
    }

    /// Resolves a template path (e.g. a `Loop`'s `over: "${input.items}"`)
    /// directly to a [`Value`], preserving its type rather than
    /// stringifying it.
    pub fn resolve_path(&self, path: &str) -> Value {
        template::resolve_path(path, &self.input, &self.artifacts_snapshot())
    }

    /// Builds an isolated view for one parallel-loop iteration: a shallow
    /// copy of the current artifacts, extended with the bound iteration
    /// variables (§4.8 step 3). Writes inside the returned context do not
    /// propagate back to `self`.
    pub fn fork_for_loop_iteration(&self, item_var: &str, item: Value, index: usize) -> Self {
        let forked = Self::new((*self.input).clone());
        for entry in self.artifacts.iter() {
            forked.set(entry.key().clone(), entry.value().clone());
        }
        forked.set(item_var, item);
        forked.set(format!("{item_var}_index"), Value::from(index));
        forked
    }
}
