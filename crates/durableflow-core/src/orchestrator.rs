// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Orchestration executor (§4.8): dispatches each node of a [`StepGraph`]
//! to its handler, mutating a shared [`ExecutionContext`] as steps
//! complete.

use crate::bridge::run_nested_manager;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::manifest::AgentManifest;
use crate::progress::ProgressWriter;
use crate::registry::StepRegistry;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::skills;
use crate::worker::{run_worker, AgentInvocation, AgentRuntime};
use crate::workflow::{
    CallStep, ConditionalStep, LoopMode, LoopSource, LoopStep, OnFailure, ParallelStep, StepNode,
    TransformStep,
};
use durableflow_state::{DurabilityStore, RunId};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolves an agent id to its loaded manifest. Supplied by the caller
/// (the workflow entry point, which owns the manifest cache's base path)
/// rather than this module reaching into filesystem concerns itself.
pub type ManifestLoader =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<AgentManifest>>> + Send + Sync>;

/// A durability store bound to the run it is persisting bookkeeping for
/// (§6). `OrchestratorEnv::durability` is `None` for runs started without a
/// configured store, in which case retry bookkeeping lives only in
/// `artifacts._retryState` for the lifetime of the in-process run.
#[derive(Clone, Copy)]
pub struct DurabilityHandle<'a> {
    pub store: &'a (dyn DurabilityStore + 'a),
    pub run_id: &'a RunId,
}

/// Everything one call to [`execute_steps`] needs beyond the step list
/// itself: the running context, registries, and collaborator handles.
pub struct OrchestratorEnv<'a, R: AgentRuntime> {
    pub context: &'a ExecutionContext,
    pub registry: &'a StepRegistry,
    pub runtime: &'a R,
    pub load_manifest: &'a ManifestLoader,
    pub writer: &'a mut ProgressWriter,
    /// The global progress range reserved for whichever top-level step is
    /// currently executing (§4.9 step 4), if any. Consulted only by
    /// [`crate::bridge::run_nested_manager`], which maps a nested
    /// manager's own `[0, 100]`-scale progress into this slice (§8).
    pub range: Option<(u8, u8)>,
    /// The durability store backing this run, if one is configured
    /// (spec.md:157, §6). `execute_call` persists `_retryState[stepId]`
    /// through this handle across attempts so a crash between retries does
    /// not lose the attempt count.
    pub durability: Option<DurabilityHandle<'a>>,
}

/// Executes an ordered sequence of steps against the shared context,
/// dispatching each node by an exhaustive match over [`StepNode`] (§4.8).
pub async fn execute_steps<R: AgentRuntime>(steps: &[StepNode], env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    for node in steps {
        match node {
            StepNode::Call(step) => execute_call(step, env).await?,
            StepNode::Parallel(step) => execute_parallel(step, env).await?,
            StepNode::Loop(step) => execute_loop(step, env).await?,
            StepNode::Conditional(step) => execute_conditional(step, env).await?,
            StepNode::Transform(step) => execute_transform(step, env).await?,
        }
    }
    Ok(())
}

async fn execute_call<R: AgentRuntime>(step: &CallStep, env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    let key = crate::workflow::strip_artifacts_prefix(&step.store_key).to_string();
    let retry = step.retry.clone().unwrap_or_default();

    match run_call_with_retry(step, &retry, env).await {
        Ok(result) => {
            env.context.set(key, result);
            Ok(())
        }
        Err(err) => match retry.on_failure {
            OnFailure::Abort => Err(err),
            OnFailure::Continue => {
                warn!(step = %step.name, error = %err, "call failed; continuing per onFailure=continue");
                let fallback = match &retry.fallback_store {
                    Some(fallback_key) => env
                        .context
                        .get(crate::workflow::strip_artifacts_prefix(fallback_key))
                        .unwrap_or(Value::Null),
                    None => Value::Null,
                };
                env.context.set(key.clone(), fallback);
                env.context.set(format!("{key}_error"), Value::String(err.to_string()));
                Ok(())
            }
        },
    }
}

async fn run_call_with_retry<R: AgentRuntime>(
    step: &CallStep,
    retry: &crate::workflow::CallRetryPolicy,
    env: &mut OrchestratorEnv<'_, R>,
) -> Result<Value> {
    let policy = RetryPolicy::new(
        retry.max_attempts,
        std::time::Duration::from_millis(retry.delay_ms),
        retry.backoff_multiplier,
        std::time::Duration::from_secs(60),
    );
    let executor = RetryExecutor::new(policy);

    let resolved_input = env.context.resolve_input_map(&step.input);
    let context = env.context.clone();
    let durability = env.durability;

    executor
        .execute(move || {
            let resolved_input = resolved_input.clone();
            async move {
                record_retry_attempt(durability, &context, &step.name).await;
                invoke_call_once(step, resolved_input, env).await
            }
        })
        .await
}

/// Persists `artifacts._retryState[stepId]` with the attempt now under way
/// (spec.md:157, spec.md:201), mirroring the count into the configured
/// durability store when one is present so a process restart mid-retry does
/// not lose how many attempts were already made.
async fn record_retry_attempt(durability: Option<DurabilityHandle<'_>>, context: &ExecutionContext, step_id: &str) {
    let attempts = match durability {
        Some(handle) => match handle.store.bump_step_attempts(handle.run_id, step_id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(step = %step_id, error = %err, "durability store failed to record retry attempt");
                next_local_attempt(context, step_id)
            }
        },
        None => next_local_attempt(context, step_id),
    };

    let mut retry_state = context
        .get("_retryState")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    retry_state.insert(step_id.to_string(), Value::from(attempts));
    context.set("_retryState", Value::Object(retry_state));
}

fn next_local_attempt(context: &ExecutionContext, step_id: &str) -> u32 {
    let previous = context
        .get("_retryState")
        .and_then(|v| v.get(step_id).and_then(Value::as_u64))
        .unwrap_or(0);
    previous as u32 + 1
}

async fn invoke_call_once<R: AgentRuntime>(
    step: &CallStep,
    resolved_input: serde_json::Map<String, Value>,
    env: &mut OrchestratorEnv<'_, R>,
) -> Result<Value> {
    let manifest = (env.load_manifest)(step.agent_id.clone()).await?;

    if manifest.is_manager() {
        run_nested_manager(manifest, Value::Object(resolved_input), env).await
    } else {
        let own_skills = skills::load_own_skills(&manifest).await;
        let system_prompt = skills::build_system_prompt(&manifest.base_instructions, &own_skills);
        let invocation = AgentInvocation {
            agent_id: step.agent_id.clone(),
            system_prompt,
            input: Value::Object(resolved_input),
            max_steps: manifest.config.max_steps.unwrap_or(10),
        };
        let outcome = run_worker(env.runtime, invocation, None, env.range, env.writer).await?;
        Ok(outcome.output)
    }
}

async fn execute_parallel<R: AgentRuntime>(step: &ParallelStep, env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    // Branches share the same artifacts map (§4.8, §5): `ExecutionContext`
    // is an `Arc`/`DashMap` handle, cheap to clone per branch, so each
    // concurrently-polled future still writes into the one shared map.
    // Branches must not overlap on `storeKey` (a workflow-author invariant
    // the engine does not enforce); the registry/runtime/load_manifest
    // references and the progress range are `Copy`/shared and fine to hand
    // to every branch.
    let mut writers: Vec<ProgressWriter> = step.branches.iter().map(|_| env.writer.fork()).collect();
    let results = futures::future::join_all(step.branches.iter().zip(writers.iter_mut()).map(
        |(branch, writer)| {
            let context = env.context.clone();
            async move {
                let mut branch_env = OrchestratorEnv {
                    context: &context,
                    registry: env.registry,
                    runtime: env.runtime,
                    load_manifest: env.load_manifest,
                    writer,
                    range: env.range,
                    durability: env.durability,
                };
                execute_steps(branch, &mut branch_env).await
            }
        },
    ))
    .await;
    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(())
}

async fn execute_loop<R: AgentRuntime>(step: &LoopStep, env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    let items = match &step.over {
        LoopSource::Literal(items) => items.clone(),
        LoopSource::Path(path) => match env.context.resolve_path(path) {
            Value::Array(items) => items,
            other => {
                return Err(OrchestratorError::InvalidStepConfig {
                    step_id: step.name.clone(),
                    reason: format!("loop `over` did not resolve to an array: {other}"),
                })
            }
        },
    };

    let result_key = result_key_for(step);
    let output_key = crate::workflow::strip_artifacts_prefix(&step.output_key).to_string();

    let mut collected = Vec::with_capacity(items.len());
    match step.mode {
        LoopMode::Sequential => {
            for (index, item) in items.into_iter().enumerate() {
                env.context.set(&step.item_var, item.clone());
                env.context.set(format!("{}_index", step.item_var), Value::from(index));
                execute_steps(&step.steps, env).await?;
                collected.push(collect_iteration_result(env.context, &result_key, &step.item_var));
            }
        }
        LoopMode::Parallel => {
            // Each iteration gets an isolated artifacts view (§4.8 step 3)
            // via `fork_for_loop_iteration`, so iterations run genuinely
            // concurrently (§5) without ever seeing each other's writes,
            // regardless of completion order; `collected` is rebuilt in
            // source order from the per-iteration forks afterward so loop
            // output order never depends on scheduling order.
            let items: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
            let forks: Vec<ExecutionContext> = items
                .iter()
                .map(|(index, item)| env.context.fork_for_loop_iteration(&step.item_var, item.clone(), *index))
                .collect();
            let mut writers: Vec<ProgressWriter> = items.iter().map(|_| env.writer.fork()).collect();

            let results = futures::future::join_all(forks.iter().zip(writers.iter_mut()).map(|(forked, writer)| {
                async move {
                    let mut iter_env = OrchestratorEnv {
                        context: forked,
                        registry: env.registry,
                        runtime: env.runtime,
                        load_manifest: env.load_manifest,
                        writer,
                        range: env.range,
                        durability: env.durability,
                    };
                    execute_steps(&step.steps, &mut iter_env).await
                }
            }))
            .await;
            results.into_iter().collect::<Result<Vec<()>>>()?;

            for forked in &forks {
                collected.push(collect_iteration_result(forked, &result_key, &step.item_var));
            }
        }
    }

    env.context.set(output_key, Value::Array(collected));
    Ok(())
}

fn result_key_for(step: &LoopStep) -> Option<String> {
    step.steps.iter().find_map(|node| match node {
        StepNode::Call(c) => Some(crate::workflow::strip_artifacts_prefix(&c.store_key).to_string()),
        StepNode::Transform(t) => Some(crate::workflow::strip_artifacts_prefix(&t.store_key).to_string()),
        _ => None,
    })
}

fn collect_iteration_result(context: &ExecutionContext, result_key: &Option<String>, item_var: &str) -> Value {
    match result_key {
        Some(key) => context.get(key).unwrap_or(Value::Null),
        None => context.get(item_var).unwrap_or(Value::Null),
    }
}

async fn execute_conditional<R: AgentRuntime>(step: &ConditionalStep, env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    if env.context.evaluate_condition(&step.condition) {
        execute_steps(&step.then_steps, env).await
    } else {
        execute_steps(&step.else_steps, env).await
    }
}

async fn execute_transform<R: AgentRuntime>(step: &TransformStep, env: &mut OrchestratorEnv<'_, R>) -> Result<()> {
    let resolved = env.context.resolve_input_map(&step.input);
    let transform = env.registry.transform(&step.transform_id)?;
    let result = transform(resolved).await?;
    let key = crate::workflow::strip_artifacts_prefix(&step.store_key).to_string();
    env.context.set(key, result);
    info!(step = %step.name, transform = %step.transform_id, "transform completed");
    Ok(())
}
