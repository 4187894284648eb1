// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios exercising [`durableflow_core::run_workflow`]
//! against a shared in-memory manifest set, without touching the
//! filesystem-backed manifest loader.

use durableflow_core::manifest::{ExecutionConfig, InterfaceRefs, ProgressConfig, SkillsConfig};
use durableflow_core::orchestrator::ManifestLoader;
use durableflow_core::progress::ProgressEvent;
use durableflow_core::worker::MockAgentRuntime;
use durableflow_core::workflow::{
    CallRetryPolicy, CallStep, ConditionalStep, LoopMode, LoopSource, LoopStep, OnFailure,
    ParallelStep, StepGraph, StepNode, TransformStep,
};
use durableflow_core::{run_workflow, AgentManifest, ProgressWriter, StepRegistry};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

fn worker_manifest(id: &str) -> Arc<AgentManifest> {
    Arc::new(AgentManifest {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        path: PathBuf::from("."),
        interface: InterfaceRefs {
            input: format!("{id}:input"),
            output: format!("{id}:output"),
        },
        base_instructions: format!("You are {id}."),
        step_graph: None,
        config: ExecutionConfig::default(),
        skills: SkillsConfig::default(),
        progress: ProgressConfig::default(),
        mcp_servers: serde_json::Value::Null,
        tools: serde_json::Value::Null,
    })
}

fn manager_manifest(id: &str, graph: StepGraph, config: ExecutionConfig) -> Arc<AgentManifest> {
    Arc::new(AgentManifest {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        path: PathBuf::from("."),
        interface: InterfaceRefs {
            input: format!("{id}:input"),
            output: format!("{id}:output"),
        },
        base_instructions: format!("You lead {id}."),
        step_graph: Some(graph),
        config,
        skills: SkillsConfig::default(),
        progress: ProgressConfig::default(),
        mcp_servers: serde_json::Value::Null,
        tools: serde_json::Value::Null,
    })
}

fn call_step(name: &str, agent_id: &str, store_key: &str) -> StepNode {
    StepNode::Call(CallStep {
        name: name.to_string(),
        agent_id: agent_id.to_string(),
        input: Map::new(),
        store_key: store_key.to_string(),
        retry: None,
    })
}

/// A `ManifestLoader` backed by a fixed in-memory table, standing in for
/// the filesystem-backed loader [`durableflow_core::manifest::load_manifest`]
/// would otherwise build (§4.5).
fn loader_for(table: HashMap<String, Arc<AgentManifest>>) -> ManifestLoader {
    Arc::new(move |agent_id: String| {
        let table = table.clone();
        Box::pin(async move {
            table
                .get(&agent_id)
                .cloned()
                .ok_or_else(|| durableflow_core::OrchestratorError::UnknownAgent(agent_id))
        })
    })
}

/// §8 scenario: a linear chain of two `Call` steps, each feeding the next,
/// synthesized into a final output.
#[tokio::test]
async fn linear_call_chain_produces_synthesized_output() {
    let graph = StepGraph {
        steps: vec![
            call_step("research", "team/researcher", "artifacts.researcher"),
            call_step("write", "team/writer", "artifacts.writer"),
        ],
    };
    let manifest = manager_manifest("team/lead", graph, ExecutionConfig::default());

    let mut table = HashMap::new();
    table.insert("team/researcher".to_string(), worker_manifest("team/researcher"));
    table.insert("team/writer".to_string(), worker_manifest("team/writer"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::succeeding(json!({"final": "the report"}));
    let registry = StepRegistry::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({"topic": "rust"}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!({"final": "the report"}));

    let mut steps_seen = Vec::new();
    let mut saw_finish = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            ProgressEvent::Progress { step, .. } => steps_seen.push(step),
            ProgressEvent::Finish { output } => {
                saw_finish = true;
                assert_eq!(output, json!({"final": "the report"}));
            }
            ProgressEvent::Error { .. } => panic!("unexpected error chunk"),
        }
    }
    assert!(saw_finish);
    assert!(steps_seen.iter().any(|s| s == "init"));
    assert!(steps_seen.iter().any(|s| s == "research"));
    assert!(steps_seen.iter().any(|s| s == "write"));
    assert!(steps_seen.iter().any(|s| s == "synthesis"));
}

/// §8 scenario: a `Parallel` step's branches all complete and their
/// results are all visible afterwards, regardless of declaration order.
#[tokio::test]
async fn parallel_branches_all_complete_against_shared_artifacts() {
    let parallel = StepNode::Parallel(ParallelStep {
        name: "gather".to_string(),
        branches: vec![
            vec![call_step("a", "team/alpha", "artifacts.alpha")],
            vec![call_step("b", "team/beta", "artifacts.beta")],
        ],
    });
    let graph = StepGraph { steps: vec![parallel] };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("alpha".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let mut table = HashMap::new();
    table.insert("team/alpha".to_string(), worker_manifest("team/alpha"));
    table.insert("team/beta".to_string(), worker_manifest("team/beta"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::succeeding(json!("done"));
    let registry = StepRegistry::new();
    let (tx, _rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("done"));
}

/// §8 scenario: a `Loop` in parallel mode still preserves the order of
/// its source array in its collected output, even though each iteration
/// runs against an isolated context.
#[tokio::test]
async fn parallel_loop_preserves_source_order() {
    let registry = StepRegistry::new();
    registry.register_transform(
        "square",
        Arc::new(|input: Map<String, serde_json::Value>| {
            Box::pin(async move {
                let n = input.get("item").and_then(serde_json::Value::as_i64).unwrap_or(0);
                Ok(json!(n * n))
            })
        }),
    );

    let loop_step = StepNode::Loop(LoopStep {
        name: "square all".to_string(),
        over: LoopSource::Literal(vec![json!(1), json!(2), json!(3)]),
        item_var: "item".to_string(),
        mode: LoopMode::Parallel,
        steps: vec![StepNode::Transform(TransformStep {
            name: "square".to_string(),
            transform_id: "square".to_string(),
            input: json!({"item": "${item}"}).as_object().cloned().unwrap(),
            store_key: "artifacts.squared".to_string(),
        })],
        output_key: "artifacts.loopResult".to_string(),
    });
    let graph = StepGraph { steps: vec![loop_step] };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("loopResult".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let loader = loader_for(HashMap::new());
    let runtime = MockAgentRuntime::succeeding(json!(null));
    let (tx, _rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!([1, 4, 9]));
}

/// §8 scenario: a `Call` step whose retries are exhausted and whose
/// `onFailure` is `continue` stores a fallback value plus a sibling
/// `<storeKey>_error` artifact, rather than aborting the run.
#[tokio::test]
async fn retry_exhaustion_with_continue_stores_fallback_and_error() {
    let step = StepNode::Call(CallStep {
        name: "flaky".to_string(),
        agent_id: "team/flaky".to_string(),
        input: Map::new(),
        store_key: "artifacts.flaky".to_string(),
        retry: Some(CallRetryPolicy {
            max_attempts: 2,
            delay_ms: 1,
            backoff_multiplier: 1.0,
            on_failure: OnFailure::Continue,
            fallback_store: None,
        }),
    });
    let graph = StepGraph { steps: vec![step] };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("flaky".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let mut table = HashMap::new();
    table.insert("team/flaky".to_string(), worker_manifest("team/flaky"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::failing("provider unavailable");
    let registry = StepRegistry::new();
    let (tx, _rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    // `skipSynthesis` reads `artifacts.flaky` directly, which the
    // fallback path set to `null` (no `fallbackStore` configured).
    assert_eq!(outcome.output, json!(null));
}

/// §8 scenario: a `Call` step whose retries are exhausted and whose
/// `onFailure` is `abort` (the default) propagates the failure as the
/// workflow's terminal error.
#[tokio::test]
async fn retry_exhaustion_with_abort_fails_the_run() {
    let step = StepNode::Call(CallStep {
        name: "flaky".to_string(),
        agent_id: "team/flaky".to_string(),
        input: Map::new(),
        store_key: "artifacts.flaky".to_string(),
        retry: None,
    });
    let graph = StepGraph { steps: vec![step] };
    let manifest = manager_manifest("team/lead", graph, ExecutionConfig::default());

    let mut table = HashMap::new();
    table.insert("team/flaky".to_string(), worker_manifest("team/flaky"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::failing("provider unavailable");
    let registry = StepRegistry::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let result = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None).await;
    assert!(result.is_err());

    let mut saw_error_chunk = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ProgressEvent::Error { .. }) {
            saw_error_chunk = true;
        }
    }
    assert!(saw_error_chunk);
}

/// §8 scenario: a nested manager's progress chunks are namespaced by its
/// agent id, and its local progress stays contained inside the parent
/// step's reserved global range.
#[tokio::test]
async fn nested_manager_progress_is_namespaced_and_range_contained() {
    let child_graph = StepGraph {
        steps: vec![call_step("research", "team/researcher", "artifacts.researcher")],
    };
    let mut child_config = ExecutionConfig::default();
    child_config.skip_synthesis = true;
    child_config.output_artifact = Some("researcher".to_string());
    let child_manifest = manager_manifest("team/research-squad", child_graph, child_config);

    let parent_graph = StepGraph {
        steps: vec![call_step("delegate", "team/research-squad", "artifacts.squad")],
    };
    let parent_manifest = manager_manifest("team/lead", parent_graph, ExecutionConfig::default());

    let mut table = HashMap::new();
    table.insert("team/research-squad".to_string(), child_manifest);
    table.insert("team/researcher".to_string(), worker_manifest("team/researcher"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::succeeding(json!({"findings": "many"}));
    let registry = StepRegistry::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(parent_manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!({"findings": "many"}));

    let mut namespaced_progresses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Progress { step, estimated_progress, .. } = event {
            if step.starts_with("team/research-squad:") {
                namespaced_progresses.push(estimated_progress);
            }
        }
    }
    assert!(!namespaced_progresses.is_empty());
    // The `delegate` Call is the only top-level step, so it owns the
    // entire [10, 90] manager range; every chunk the child emits must
    // land inside it.
    for p in namespaced_progresses {
        assert!(p >= 10 && p <= 90, "child progress {p} escaped its parent's range");
    }
}

/// §8 scenario: `skipSynthesis` with a present artifact returns it
/// directly, with no synthesis worker invocation.
#[tokio::test]
async fn skip_synthesis_returns_artifact_without_synthesis_call() {
    let graph = StepGraph {
        steps: vec![call_step("research", "team/researcher", "artifacts.researcher")],
    };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("researcher".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let mut table = HashMap::new();
    table.insert("team/researcher".to_string(), worker_manifest("team/researcher"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::succeeding(json!({"summary": "ok"}));
    let registry = StepRegistry::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!({"summary": "ok"}));

    let mut saw_synthesis = false;
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Progress { step, .. } = event {
            if step == "synthesis" || step.ends_with(":synthesis") {
                saw_synthesis = true;
            }
        }
    }
    assert!(!saw_synthesis);
}

/// §8 scenario: `skipSynthesis` with a missing artifact is a fatal error
/// for the whole run, surfaced as a terminal error chunk.
#[tokio::test]
async fn skip_synthesis_missing_artifact_fails_the_run() {
    let graph = StepGraph { steps: vec![] };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("nope".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let loader = loader_for(HashMap::new());
    let runtime = MockAgentRuntime::succeeding(json!(null));
    let registry = StepRegistry::new();
    let (tx, mut rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let result = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None).await;
    assert!(matches!(
        result,
        Err(durableflow_core::OrchestratorError::ArtifactNotFound { .. })
    ));

    let mut saw_error_chunk = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ProgressEvent::Error { .. }) {
            saw_error_chunk = true;
        }
    }
    assert!(saw_error_chunk);
}

/// §8 scenario: a `Conditional` step whose condition reads a prior
/// artifact dispatches to the right branch.
#[tokio::test]
async fn conditional_step_reads_prior_artifact_to_choose_branch() {
    let conditional = StepNode::Conditional(ConditionalStep {
        name: "check score".to_string(),
        condition: "${score} > 5".to_string(),
        then_steps: vec![call_step("high", "team/high-path", "artifacts.result")],
        else_steps: vec![call_step("low", "team/low-path", "artifacts.result")],
    });
    let graph = StepGraph {
        steps: vec![
            StepNode::Transform(TransformStep {
                name: "seed score".to_string(),
                transform_id: "seed".to_string(),
                input: Map::new(),
                store_key: "artifacts.score".to_string(),
            }),
            conditional,
        ],
    };
    let mut config = ExecutionConfig::default();
    config.skip_synthesis = true;
    config.output_artifact = Some("result".to_string());
    let manifest = manager_manifest("team/lead", graph, config);

    let registry = StepRegistry::new();
    registry.register_transform("seed", Arc::new(|_input| Box::pin(async { Ok(json!(10)) })));

    let mut table = HashMap::new();
    table.insert("team/high-path".to_string(), worker_manifest("team/high-path"));
    table.insert("team/low-path".to_string(), worker_manifest("team/low-path"));
    let loader = loader_for(table);

    let runtime = MockAgentRuntime::succeeding(json!("took the high path"));
    let (tx, _rx) = mpsc::channel(64);
    let mut writer = ProgressWriter::new(tx);

    let outcome = run_workflow(manifest, json!({}), &runtime, &registry, &loader, &mut writer, None)
        .await
        .unwrap();
    assert_eq!(outcome.output, json!("took the high path"));
}
