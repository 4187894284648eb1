// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Progress stream (§4.4): a single writable channel per workflow run,
//! carrying `Progress` / `Finish` / `Error` chunks, with consecutive-id
//! de-duplication, canonical range-mapping arithmetic, and SSE framing.
//!
//! Actual HTTP transport (an SSE endpoint, a websocket) is an external
//! collaborator (§1); this module only defines the wire shape and the
//! in-process channel plumbing a transport would sit on top of.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Response header carrying the run id, for callers that want to resume or
/// cancel a run out of band.
pub const RUN_ID_HEADER: &str = "x-workflow-run-id";
/// Response header carrying the execution id of the specific step
/// currently writing to the stream.
pub const EXECUTION_ID_HEADER: &str = "x-execution-id";

/// A visual hint a caller may use to render a progress chunk (§3). Purely
/// advisory; the engine never branches on it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IconHint {
    Thinking,
    ToolCall,
    Writing,
    Done,
}

/// One chunk on a workflow run's progress stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// A local-progress update from some step, already range-mapped into
    /// the workflow-global `[0, 100]` scale.
    Progress {
        /// Identifies the emitting step, for de-duplication.
        step: String,
        /// Human-facing status message.
        #[serde(rename = "userMessage")]
        user_message: String,
        /// Global progress percentage.
        #[serde(rename = "estimatedProgress")]
        estimated_progress: u8,
        /// Optional rendering hint.
        #[serde(rename = "iconHint", skip_serializing_if = "Option::is_none")]
        icon_hint: Option<IconHint>,
        /// Tool name, when this chunk reports an in-flight tool call.
        #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        /// Free-form diagnostic text, not shown to end users.
        #[serde(rename = "adminDetails", skip_serializing_if = "Option::is_none")]
        admin_details: Option<String>,
    },
    /// Terminal success chunk, carrying the workflow's final output.
    Finish {
        /// The resolved output value.
        output: Value,
    },
    /// Terminal failure chunk.
    Error {
        /// Machine-readable error code (see [`crate::error::OrchestratorError::code`]).
        code: String,
        /// Human-facing message.
        message: String,
    },
}

impl ProgressEvent {
    /// Builds a progress chunk with only the required fields set.
    pub fn progress(step: impl Into<String>, user_message: impl Into<String>, estimated_progress: u8) -> Self {
        Self::Progress {
            step: step.into(),
            user_message: user_message.into(),
            estimated_progress,
            icon_hint: None,
            tool_name: None,
            admin_details: None,
        }
    }
}

/// Maps a worker's local progress `p ∈ [0, 100]` into the workflow-global
/// range `[start, end]`, per the canonical rounding formula in §9: integer
/// rounding (not float accumulation) so range boundaries stay stable across
/// replay.
pub fn map_range(start: u8, end: u8, percent: u8) -> u8 {
    let s = start as f64;
    let e = end as f64;
    let p = percent.min(100) as f64;
    let mapped = s + (p / 100.0) * (e - s);
    mapped.round().clamp(0.0, 100.0) as u8
}

/// A handle for writing to one run's progress stream. Wraps an
/// `mpsc::Sender`, suppressing consecutive chunks that share a `step` id
/// (§4.4's de-duplication rule) so a durable step replaying after a crash
/// cannot double-emit.
pub struct ProgressWriter {
    tx: mpsc::Sender<ProgressEvent>,
    last_step: Option<String>,
    /// Non-empty for a writer handed to a nested-manager's child run
    /// (§4.10): every step id this writer emits is prefixed
    /// `<childAgentId>:` before being sent, while still sharing the same
    /// underlying channel (and therefore the same single output stream)
    /// as the parent.
    prefix: Option<String>,
    /// Non-`None` for a writer handed to a nested-manager's child run: the
    /// child's own `[0, 100]`-scale progress is mapped into this absolute
    /// sub-range before being sent, so a grandchild's progress nests
    /// correctly inside its parent's reserved slice, which is itself
    /// nested inside *its* parent's (§8's "global-range mapping is
    /// contained inside its parent step's range").
    range: Option<(u8, u8)>,
}

impl ProgressWriter {
    /// Builds a writer around a channel sender, with no prior step seen.
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx, last_step: None, prefix: None, range: None }
    }

    /// Builds a writer that shares this writer's underlying channel but
    /// namespaces every step id it emits under `prefix:` (§4.10). Prefixes
    /// compose: namespacing an already-namespaced writer yields
    /// `outer:inner:step`. Does not affect range mapping; see
    /// [`Self::scoped`] for the nested-manager case, which needs both.
    pub fn namespaced(&self, prefix: &str) -> Self {
        let combined = match &self.prefix {
            Some(existing) => format!("{existing}:{prefix}"),
            None => prefix.to_string(),
        };
        Self {
            tx: self.tx.clone(),
            last_step: None,
            prefix: Some(combined),
            range: self.range,
        }
    }

    /// Builds a writer for a nested-manager child run: namespaces step ids
    /// under `prefix:` as [`Self::namespaced`] does, and additionally maps
    /// every progress value the child reports (on its own `[0, 100]`
    /// scale) into `local_range`, composed with this writer's own range if
    /// it is itself scoped.
    pub fn scoped(&self, prefix: &str, local_range: (u8, u8)) -> Self {
        let mut writer = self.namespaced(prefix);
        writer.range = Some(match self.range {
            Some((s, e)) => (map_range(s, e, local_range.0), map_range(s, e, local_range.1)),
            None => local_range,
        });
        writer
    }

    /// Clones this writer for use by one branch of a concurrently-executing
    /// `Parallel` step or parallel `Loop` iteration (§5): same channel,
    /// prefix, and range, but its own independent dedup state, since two
    /// branches running concurrently are not "consecutive" with each other.
    pub fn fork(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            last_step: None,
            prefix: self.prefix.clone(),
            range: self.range,
        }
    }

    fn namespaced_step(&self, step: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{step}"),
            None => step.to_string(),
        }
    }

    fn mapped_progress(&self, estimated_progress: u8) -> u8 {
        match self.range {
            Some((s, e)) => map_range(s, e, estimated_progress),
            None => estimated_progress,
        }
    }

    /// Writes a progress chunk already expressed in global-range terms,
    /// unless its `step` id matches the immediately preceding chunk's.
    /// Returns `false` if the channel's receiver has been dropped.
    pub async fn write_progress(&mut self, step: &str, user_message: &str, estimated_progress: u8) -> bool {
        let step = self.namespaced_step(step);
        if self.last_step.as_deref() == Some(step.as_str()) {
            return true;
        }
        self.last_step = Some(step.clone());
        let estimated_progress = self.mapped_progress(estimated_progress);
        self.tx
            .send(ProgressEvent::progress(step, user_message, estimated_progress))
            .await
            .is_ok()
    }

    /// Like [`Self::write_progress`] but with a tool-call hint attached,
    /// for the worker executor's synthesized tool-invocation chunks (§4.6).
    pub async fn write_tool_progress(
        &mut self,
        step: &str,
        user_message: &str,
        estimated_progress: u8,
        tool_name: &str,
    ) -> bool {
        let step = self.namespaced_step(step);
        if self.last_step.as_deref() == Some(step.as_str()) {
            return true;
        }
        self.last_step = Some(step.clone());
        let estimated_progress = self.mapped_progress(estimated_progress);
        self.tx
            .send(ProgressEvent::Progress {
                step,
                user_message: user_message.to_string(),
                estimated_progress,
                icon_hint: Some(IconHint::ToolCall),
                tool_name: Some(tool_name.to_string()),
                admin_details: None,
            })
            .await
            .is_ok()
    }

    /// Writes the terminal success chunk. Does not close the channel; the
    /// caller drops the writer (or the sender) once done.
    pub async fn write_finish(&mut self, output: Value) -> bool {
        self.last_step = None;
        self.tx.send(ProgressEvent::Finish { output }).await.is_ok()
    }

    /// Writes the terminal error chunk.
    pub async fn write_error(&mut self, code: impl Into<String>, message: impl Into<String>) -> bool {
        self.last_step = None;
        self.tx
            .send(ProgressEvent::Error {
                code: code.into(),
                message: message.into(),
            })
            .await
            .is_ok()
    }
}

/// Frames one event as an SSE `data:` line, JSON-encoded, terminated by a
/// blank line.
pub fn frame_sse(event: &ProgressEvent) -> String {
    let body = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {body}\n\n")
}

/// The SSE stream terminator chunk.
pub const SSE_DONE: &str = "data: [DONE]\n\n";
