// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Worker executor (§4.6): runs one LLM-driven agent to structured
//! completion, consuming its partial-output and tool-event streams
//! concurrently and mapping whatever progress it reports onto the
//! workflow's progress stream.
//!
//! The model/tool-server boundary is an external collaborator (§1); this
//! module only defines the [`AgentRuntime`] trait it depends on, plus a
//! [`MockAgentRuntime`] reference implementation used in tests.

use crate::error::{OrchestratorError, Result};
use crate::progress::ProgressWriter;
use crate::retry::{RetryExecutor, RetryPolicy};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// One request to run a worker to completion.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// The agent id being invoked, for logging and progress namespacing.
    pub agent_id: String,
    /// The fully assembled system prompt: base instructions, skill
    /// sections, and the standard progress-reporting instruction (§4.6
    /// step 2).
    pub system_prompt: String,
    /// The resolved input for this call.
    pub input: Value,
    /// Bound on tool-call iterations.
    pub max_steps: u32,
}

/// One tool invocation observed on the tool-event stream.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    /// The tool's name.
    pub tool_name: String,
}

/// One successive value on the partial-output stream: a progressively
/// filled structured output, optionally carrying an in-band `_progress`
/// field matching the progress-chunk shape (§3).
#[derive(Debug, Clone)]
pub struct PartialOutput {
    /// The partial structured value so far.
    pub value: Value,
    /// `_progress` field, if the model reported one.
    pub progress: Option<InBandProgress>,
}

/// The `_progress` shape a model may embed in a partial output.
#[derive(Debug, Clone)]
pub struct InBandProgress {
    pub user_message: String,
    pub estimated_progress: u8,
}

/// Token usage reported by (or estimated for) one worker invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// The final result of a worker invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: Value,
    pub usage: Option<AgentUsage>,
}

/// The live handle an [`AgentRuntime`] returns: two event streams plus a
/// one-shot for the terminal result, driven concurrently by the worker
/// executor (§4.6 step 6).
pub struct AgentInvocationHandle {
    pub partial_outputs: mpsc::Receiver<PartialOutput>,
    pub tool_events: mpsc::Receiver<ToolEvent>,
    pub result: oneshot::Receiver<std::result::Result<AgentOutcome, OrchestratorError>>,
}

/// The boundary to the external LLM/tool-server collaborator (§6). The
/// core depends only on this trait; concrete provider adapters are out of
/// scope (§1).
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Starts an invocation, returning a handle to its concurrent streams.
    async fn invoke(&self, invocation: AgentInvocation) -> AgentInvocationHandle;
}

/// Runs one worker invocation to completion, emitting range-mapped,
/// deduplicated progress along the way (§4.6).
///
/// `range` is `None` for a standalone (not-in-workflow) worker, which may
/// report up to and including 100%; `Some((start, end))` for a worker
/// running inside a workflow step, which never reports past 95% of its
/// assigned range — the enclosing manager owns the run's terminal 100%.
pub async fn run_worker<R: AgentRuntime>(
    runtime: &R,
    invocation: AgentInvocation,
    step_prefix: Option<&str>,
    range: Option<(u8, u8)>,
    writer: &mut ProgressWriter,
) -> Result<AgentOutcome> {
    let executor = RetryExecutor::new(RetryPolicy::exponential_worker_default());
    let system_len = invocation.system_prompt.len();
    let input_len = invocation.input.to_string().len();

    executor
        .execute(|| drive_one_attempt(runtime, &invocation, step_prefix, range, writer, system_len, input_len))
        .await
}

async fn drive_one_attempt<R: AgentRuntime>(
    runtime: &R,
    invocation: &AgentInvocation,
    step_prefix: Option<&str>,
    range: Option<(u8, u8)>,
    writer: &mut ProgressWriter,
    system_len: usize,
    input_len: usize,
) -> Result<AgentOutcome> {
    let mut handle = runtime.invoke(invocation.clone()).await;
    let step_id = namespaced_step(step_prefix, &invocation.agent_id);

    let mut ai_driven_progress_seen = false;
    let mut current_local_progress: u8 = 0;

    loop {
        tokio::select! {
            partial = handle.partial_outputs.recv() => {
                match partial {
                    Some(PartialOutput { progress: Some(p), .. }) => {
                        ai_driven_progress_seen = true;
                        current_local_progress = p.estimated_progress.min(cap_for(range));
                        emit(writer, &step_id, &p.user_message, current_local_progress, range, None).await;
                    }
                    Some(_) => {}
                    None => continue,
                }
            }
            tool_event = handle.tool_events.recv() => {
                match tool_event {
                    Some(ToolEvent { tool_name }) => {
                        if !ai_driven_progress_seen {
                            current_local_progress = (current_local_progress + 10).min(80);
                            emit(
                                writer,
                                &step_id,
                                &format!("calling tool {tool_name}"),
                                current_local_progress,
                                range,
                                Some(tool_name.clone()),
                            )
                            .await;
                        }
                    }
                    None => continue,
                }
            }
            result = &mut handle.result => {
                let mut outcome = result.map_err(|_| {
                    OrchestratorError::NoStructuredOutput(invocation.agent_id.clone())
                })??;

                if outcome.usage.is_none() {
                    let output_len = outcome.output.to_string().len();
                    let estimated = ((system_len + input_len + output_len) as f64 / 4.0).ceil() as u64;
                    outcome.usage = Some(AgentUsage { prompt_tokens: estimated, completion_tokens: 0 });
                }

                let completion_local = if range.is_some() { 95 } else { 100 };
                emit(writer, &step_id, "completed", completion_local, range, None).await;

                return Ok(outcome);
            }
        }
    }
}

fn cap_for(range: Option<(u8, u8)>) -> u8 {
    if range.is_some() {
        95
    } else {
        100
    }
}

fn namespaced_step(prefix: Option<&str>, agent_id: &str) -> String {
    match prefix {
        Some(p) => format!("{p}:{agent_id}"),
        None => agent_id.to_string(),
    }
}

async fn emit(
    writer: &mut ProgressWriter,
    step_id: &str,
    message: &str,
    local_progress: u8,
    range: Option<(u8, u8)>,
    tool_name: Option<String>,
) {
    let global = match range {
        Some((start, end)) => crate::progress::map_range(start, end, local_progress),
        None => local_progress,
    };
    let wrote = match tool_name {
        Some(name) => writer.write_tool_progress(step_id, message, global, &name).await,
        None => writer.write_progress(step_id, message, global).await,
    };
    if !wrote {
        warn!(step = %step_id, "progress channel closed; dropping chunk");
    }
}

/// A deterministic, in-process [`AgentRuntime`] used by tests: returns a
/// fixed output after emitting a scripted sequence of partial outputs and
/// tool events.
pub struct MockAgentRuntime {
    pub partials: Vec<PartialOutput>,
    pub tool_events: Vec<ToolEvent>,
    pub outcome: std::result::Result<AgentOutcome, OrchestratorError>,
}

impl MockAgentRuntime {
    pub fn succeeding(output: Value) -> Self {
        Self {
            partials: Vec::new(),
            tool_events: Vec::new(),
            outcome: Ok(AgentOutcome { output, usage: None }),
        }
    }

    /// An agent that always fails, e.g. to exercise `onFailure: continue`
    /// fallback handling in integration tests.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            partials: Vec::new(),
            tool_events: Vec::new(),
            outcome: Err(OrchestratorError::other(message.into())),
        }
    }
}

#[async_trait]
impl AgentRuntime for MockAgentRuntime {
    async fn invoke(&self, _invocation: AgentInvocation) -> AgentInvocationHandle {
        let (partial_tx, partial_rx) = mpsc::channel(16);
        let (tool_tx, tool_rx) = mpsc::channel(16);
        let (result_tx, result_rx) = oneshot::channel();

        for p in self.partials.clone() {
            let _ = partial_tx.send(p).await;
        }
        drop(partial_tx);
        for e in self.tool_events.clone() {
            let _ = tool_tx.send(e).await;
        }
        drop(tool_tx);

        let outcome = match &self.outcome {
            Ok(o) => Ok(o.clone()),
            Err(e) => Err(OrchestratorError::other(e.to_string())),
        };
        let _ = result_tx.send(outcome);

        AgentInvocationHandle {
            partial_outputs: partial_rx,
            tool_events: tool_rx,
            result: result_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation() -> AgentInvocation {
        AgentInvocation {
            agent_id: "researcher".to_string(),
            system_prompt: "be helpful".to_string(),
            input: json!({"topic": "rust"}),
            max_steps: 5,
        }
    }

    #[tokio::test]
    async fn worker_emits_completion_at_95_percent_of_its_range() {
        let runtime = MockAgentRuntime::succeeding(json!({"summary": "ok"}));
        let (tx, mut rx) = mpsc::channel(16);
        let mut writer = ProgressWriter::new(tx);

        let outcome = run_worker(&runtime, invocation(), None, Some((10, 90)), &mut writer)
            .await
            .unwrap();
        assert_eq!(outcome.output, json!({"summary": "ok"}));
        assert!(outcome.usage.is_some());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        // local 95% of [10, 90] -> 10 + 0.95*80 = 85.5, rounds to 86.
        assert!(matches!(
            last,
            Some(crate::progress::ProgressEvent::Progress { estimated_progress: 86, .. })
        ));
    }

    #[tokio::test]
    async fn standalone_worker_may_report_100_percent() {
        let runtime = MockAgentRuntime::succeeding(json!({"summary": "ok"}));
        let (tx, mut rx) = mpsc::channel(16);
        let mut writer = ProgressWriter::new(tx);

        run_worker(&runtime, invocation(), None, None, &mut writer).await.unwrap();

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(crate::progress::ProgressEvent::Progress { estimated_progress: 100, .. })
        ));
    }

    #[tokio::test]
    async fn missing_usage_is_estimated_from_lengths() {
        let runtime = MockAgentRuntime::succeeding(json!({"a": "b"}));
        let (tx, _rx) = mpsc::channel(16);
        let mut writer = ProgressWriter::new(tx);
        let outcome = run_worker(&runtime, invocation(), None, None, &mut writer).await.unwrap();
        assert!(outcome.usage.unwrap().prompt_tokens > 0);
    }

    #[tokio::test]
    async fn step_ids_are_namespaced_with_a_prefix() {
        assert_eq!(namespaced_step(Some("manager"), "child"), "manager:child");
        assert_eq!(namespaced_step(None, "child"), "child");
    }
}
