// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Nested-manager bridge (§4.10).
//!
//! When a `Call` targets a sub-agent that itself has a workflow, the
//! orchestration executor hands off to this module instead of invoking the
//! worker executor directly. The child run shares the parent's single
//! progress channel (rather than a separately piped stream) via
//! [`crate::progress::ProgressWriter::scoped`], so every chunk the child
//! emits already carries the `<childAgentId>:` prefix and is already
//! mapped into the parent `Call` step's reserved range by the time it
//! reaches the shared channel — there is no separate relay loop pumping
//! one stream into another.

use crate::error::{OrchestratorError, Result};
use crate::entry;
use crate::manifest::AgentManifest;
use crate::orchestrator::OrchestratorEnv;
use crate::worker::AgentRuntime;
use serde_json::Value;
use std::sync::Arc;

/// Starts and awaits a child workflow run for `manifest`, re-emitting its
/// progress under the `<childAgentId>:` namespace on the parent's stream,
/// and returns its output as the enclosing `Call` step's result.
///
/// The recursive call into [`entry::run_workflow`] is boxed: `Call` →
/// orchestration executor → this bridge → workflow entry point → (if the
/// grandchild is itself a manager) `Call` again, an indirect cycle the
/// compiler can only size when one leg of it is heap-indirected.
pub async fn run_nested_manager<R: AgentRuntime>(
    manifest: Arc<AgentManifest>,
    input: Value,
    env: &mut OrchestratorEnv<'_, R>,
) -> Result<Value> {
    let agent_id = manifest.id.clone();
    let mut child_writer = env.writer.scoped(&agent_id, env.range.unwrap_or((0, 100)));

    let outcome = Box::pin(entry::run_workflow(
        manifest,
        input,
        env.runtime,
        env.registry,
        env.load_manifest,
        &mut child_writer,
        env.durability,
    ))
    .await
    .map_err(|err| OrchestratorError::NestedManagerFailed {
        agent_id: agent_id.clone(),
        reason: err.to_string(),
    })?;

    Ok(outcome.output)
}
