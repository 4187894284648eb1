// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! The durability-store contract (§6 of the engine spec).

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Opaque identifier for one workflow run.
pub type RunId = String;

/// Status of a workflow run, as seen by `getRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Enrolled but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Suspended at a step boundary (e.g. awaiting a timer or external event).
    Paused,
    /// Finished successfully; `return_value` is set.
    Completed,
    /// Finished with a fatal error.
    Failed,
    /// Cancelled via an abort signal.
    Cancelled,
}

/// A durably-recorded run, as the store tracks it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// Agent id the run was started for.
    pub agent_id: String,
    /// Current status.
    pub status: RunStatus,
    /// The run's return value, once completed or failed.
    pub return_value: Option<Value>,
}

/// One memoized step result within a run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepRecord {
    /// Step key, unique within the run.
    pub step_key: String,
    /// The step's serialized result, if it completed.
    pub result: Option<Value>,
    /// Number of attempts made so far (for retry bookkeeping).
    pub attempts: u32,
}

/// A step result deserialized back into the caller's expected type.
pub struct StoredStepResult<T> {
    /// The deserialized value.
    pub value: T,
    /// How many attempts were recorded before this result was stored.
    pub attempts: u32,
}

/// A handle returned by `start`, giving the caller the run id and a way to
/// await its eventual return value. Progress is consumed separately, by
/// reading the run's progress stream (see `durableflow_core::progress`).
pub struct RunHandle<T> {
    /// The newly assigned run id.
    pub run_id: RunId,
    /// Resolves to the workflow function's return value.
    pub return_value: tokio::sync::oneshot::Receiver<T>,
}

/// The contract a durability backend must satisfy.
///
/// This is deliberately narrow: it only covers run lifecycle and per-step
/// memoization. It does not know anything about workflow semantics — that
/// lives entirely in `durableflow-core`.
#[async_trait]
pub trait DurabilityStore: Send + Sync {
    /// Enrolls a new run for the given agent id. Returns the assigned run id.
    async fn create_run(&self, agent_id: &str) -> Result<RunId, StoreError>;

    /// Fetches the current status/record of a run.
    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, StoreError>;

    /// Updates a run's status, optionally attaching its return value.
    async fn set_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        return_value: Option<Value>,
    ) -> Result<(), StoreError>;

    /// Looks up a memoized step result, if the step has already completed
    /// for this run. Used to make replay skip completed work.
    async fn get_step(
        &self,
        run_id: &RunId,
        step_key: &str,
    ) -> Result<Option<StepRecord>, StoreError>;

    /// Records a step's completed result (memoization write). Overwrites
    /// any prior record for the same key.
    async fn put_step(
        &self,
        run_id: &RunId,
        step_key: &str,
        result: &Value,
    ) -> Result<(), StoreError>;

    /// Increments and returns the attempt counter for a step, without
    /// recording a result yet. Used by the retry loop to persist "we tried
    /// N times" across process restarts.
    async fn bump_step_attempts(
        &self,
        run_id: &RunId,
        step_key: &str,
    ) -> Result<u32, StoreError>;

    /// Cancels a run; implementations should mark it `Cancelled` unless it
    /// has already reached a terminal status.
    async fn cancel_run(&self, run_id: &RunId) -> Result<(), StoreError>;
}

/// Convenience helper: fetch and deserialize a memoized step result.
pub async fn get_step_typed<T: DeserializeOwned>(
    store: &dyn DurabilityStore,
    run_id: &RunId,
    step_key: &str,
) -> Result<Option<StoredStepResult<T>>, StoreError> {
    match store.get_step(run_id, step_key).await? {
        Some(record) => match record.result {
            Some(value) => {
                let value: T =
                    serde_json::from_value(value).map_err(|e| StoreError::Deserialize(e.to_string()))?;
                Ok(Some(StoredStepResult {
                    value,
                    attempts: record.attempts,
                }))
            }
            None => Ok(None),
        },
        None => Ok(None),
    }
}

/// Convenience helper: record a step result from any `Serialize` type.
pub async fn put_step_typed<T: Serialize>(
    store: &dyn DurabilityStore,
    run_id: &RunId,
    step_key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_value(value)?;
    store.put_step(run_id, step_key, &json).await
}
