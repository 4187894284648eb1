// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Workflow entry point (§4.9): dispatches worker vs. manager mode and
//! owns the `[0,10] / [10,90] / [90,98] / [98,100]` global progress-range
//! reservation for manager mode.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::manifest::AgentManifest;
use crate::orchestrator::{execute_steps, DurabilityHandle, ManifestLoader, OrchestratorEnv};
use crate::progress::ProgressWriter;
use crate::registry::StepRegistry;
use crate::skills;
use crate::worker::{run_worker, AgentInvocation, AgentOutcome, AgentRuntime, AgentUsage};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// The `{ output, usage }` result of one top-level run (§4.9 step 6 / §7).
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub output: Value,
    pub usage: Option<AgentUsage>,
}

/// Runs one agent to completion: worker mode if its manifest has no step
/// graph, manager mode otherwise. Writes every progress chunk for the run
/// onto `writer`, including the terminal finish/error chunk (§4.9 step 6).
pub async fn run_workflow<R: AgentRuntime>(
    manifest: Arc<AgentManifest>,
    input: Value,
    runtime: &R,
    registry: &StepRegistry,
    load_manifest: &ManifestLoader,
    writer: &mut ProgressWriter,
    durability: Option<DurabilityHandle<'_>>,
) -> Result<WorkflowOutcome> {
    let result = if manifest.is_manager() {
        run_manager(manifest.clone(), input, runtime, registry, load_manifest, writer, durability).await
    } else {
        run_worker_mode(manifest.clone(), input, runtime, writer).await
    };

    match &result {
        Ok(outcome) => {
            writer.write_finish(outcome.output.clone()).await;
        }
        Err(err) => {
            writer.write_error(err.code(), err.to_string()).await;
        }
    }
    result
}

/// §4.9 step 2: worker mode. A single LLM invocation, standalone (no
/// range), a lightweight finish chunk on success.
async fn run_worker_mode<R: AgentRuntime>(
    manifest: Arc<AgentManifest>,
    input: Value,
    runtime: &R,
    writer: &mut ProgressWriter,
) -> Result<WorkflowOutcome> {
    let own_skills = skills::load_own_skills(&manifest).await;
    let system_prompt = skills::build_system_prompt(&manifest.base_instructions, &own_skills);
    let invocation = AgentInvocation {
        agent_id: manifest.id.clone(),
        system_prompt,
        input,
        max_steps: manifest.config.max_steps.unwrap_or(10),
    };
    let AgentOutcome { output, usage } = run_worker(runtime, invocation, None, None, writer).await?;
    Ok(WorkflowOutcome { output, usage })
}

/// §4.9 steps 3-6: manager mode. Reserves `[0,10]` for init, `[10,90]`
/// split evenly across the N top-level steps, `[90,98]` for synthesis,
/// `[98,100]` for completion.
async fn run_manager<R: AgentRuntime>(
    manifest: Arc<AgentManifest>,
    input: Value,
    runtime: &R,
    registry: &StepRegistry,
    load_manifest: &ManifestLoader,
    writer: &mut ProgressWriter,
    durability: Option<DurabilityHandle<'_>>,
) -> Result<WorkflowOutcome> {
    let graph = manifest
        .step_graph
        .as_ref()
        .expect("run_manager only called when is_manager() is true");

    writer.write_progress("init", "starting workflow", 10).await;
    let context = ExecutionContext::new(input);
    context.set("input", context.input().clone());

    let step_count = graph.len().max(1) as u8;
    for (index, node) in graph.steps.iter().enumerate() {
        let start = 10 + (index as u16 * 80 / step_count as u16) as u8;
        let end = 10 + ((index as u16 + 1) * 80 / step_count as u16) as u8;
        let message = start_of_step_message(node);
        writer.write_progress(node.name(), &message, start).await;
        info!(step = node.name(), start, end, "entering workflow step");

        let mut env = OrchestratorEnv {
            context: &context,
            registry,
            runtime,
            load_manifest,
            writer: &mut *writer,
            range: Some((start, end)),
            durability,
        };
        execute_steps(std::slice::from_ref(node), &mut env).await?;
        writer.write_progress(node.name(), "step completed", end).await;
    }

    let output = if manifest.config.skip_synthesis {
        let artifact_key = manifest
            .config
            .output_artifact
            .as_deref()
            .unwrap_or_default();
        context.get_dotted(artifact_key).ok_or_else(|| OrchestratorError::ArtifactNotFound {
            key: artifact_key.to_string(),
            available: context.artifact_keys(),
        })?
    } else {
        writer.write_progress("synthesis", "synthesizing final output", 90).await;
        let manager_skills = skills::aggregate_manager_skills(&manifest, graph, |agent_id| async move {
            (load_manifest)(agent_id).await.ok().map(|arc| (*arc).clone())
        })
        .await;
        let system_prompt = skills::build_system_prompt(&manifest.base_instructions, &manager_skills);
        let invocation = AgentInvocation {
            agent_id: format!("{}/synthesis", manifest.id),
            system_prompt,
            input: context.artifacts_snapshot(),
            max_steps: manifest.config.max_steps.unwrap_or(10),
        };
        let outcome = run_worker(runtime, invocation, Some("synthesis"), Some((90, 98)), writer).await?;
        outcome.output
    };

    writer.write_progress("complete", "workflow complete", 100).await;
    Ok(WorkflowOutcome { output, usage: None })
}

fn start_of_step_message(node: &crate::workflow::StepNode) -> String {
    use crate::workflow::StepNode;
    match node {
        StepNode::Call(step) => format!("calling agent {}", step.agent_id),
        StepNode::Parallel(_) => format!("running {} in parallel", node.name()),
        StepNode::Loop(_) => format!("looping over {}", node.name()),
        StepNode::Conditional(_) => format!("evaluating {}", node.name()),
        StepNode::Transform(step) => format!("transforming via {}", step.transform_id),
    }
}
