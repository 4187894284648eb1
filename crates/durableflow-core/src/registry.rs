// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Step registry (§4.3): three independent name → value tables shared
//! across a process — output/input schemas, deterministic transforms, and
//! per-agent tool sets. Registration is idempotent with last-write-wins;
//! there is no "already registered" error, matching the teacher's
//! `DashMap`-backed tool registry pattern.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::OrchestratorError;

/// An opaque schema handle. Validation is deliberately untyped here: the
/// registry only needs to prove a schema *exists* under a name for a
/// `Call`/`Transform` step to reference it; what it validates against is a
/// collaborator concern (§1 Non-goals — concrete schema engines are out of
/// scope).
#[derive(Clone)]
pub struct SchemaHandle {
    name: String,
    schema: Arc<Value>,
}

impl SchemaHandle {
    /// Wraps a raw JSON schema document under a registry name.
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema: Arc::new(schema),
        }
    }

    /// The name this handle was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying schema document.
    pub fn schema(&self) -> &Value {
        &self.schema
    }
}

/// A deterministic transform: a pure async function from a resolved input
/// map to a JSON value. Boxed so the registry can hold heterogeneous
/// transform implementations behind one table.
pub type TransformFn =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, OrchestratorError>> + Send + Sync>;

/// Name → value tables for schemas, transforms, and per-agent tool sets.
/// Cheap to clone (every table is an `Arc`-backed `DashMap`); intended to be
/// built once and shared across concurrently-running workflow runs.
#[derive(Clone, Default)]
pub struct StepRegistry {
    schemas: Arc<DashMap<String, SchemaHandle>>,
    transforms: Arc<DashMap<String, TransformFn>>,
    tool_sets: Arc<DashMap<String, Vec<String>>>,
}

impl StepRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a schema under `name`. Idempotent:
    /// re-registering the same name simply overwrites the prior handle.
    pub fn register_schema(&self, handle: SchemaHandle) {
        self.schemas.insert(handle.name().to_string(), handle);
    }

    /// Looks up a previously-registered schema.
    pub fn schema(&self, name: &str) -> Option<SchemaHandle> {
        self.schemas.get(name).map(|e| e.clone())
    }

    /// Registers (or replaces) a transform under `id`.
    pub fn register_transform(&self, id: impl Into<String>, f: TransformFn) {
        self.transforms.insert(id.into(), f);
    }

    /// Looks up a previously-registered transform, or
    /// [`OrchestratorError::UnknownTransform`] if none is registered.
    pub fn transform(&self, id: &str) -> Result<TransformFn, OrchestratorError> {
        self.transforms
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| OrchestratorError::UnknownTransform(id.to_string()))
    }

    /// Registers (or replaces) the tool-name list available to an agent.
    pub fn register_tool_set(&self, agent_id: impl Into<String>, tools: Vec<String>) {
        self.tool_sets.insert(agent_id.into(), tools);
    }

    /// Looks up the tool-name list registered for an agent, defaulting to
    /// an empty set when none has been registered.
    pub fn tool_set(&self, agent_id: &str) -> Vec<String> {
        self.tool_sets
            .get(agent_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}
