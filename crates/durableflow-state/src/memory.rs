// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! A reference, in-process [`DurabilityStore`] implementation.
//!
//! This is a test/reference harness, not a production backend: state is
//! lost when the process exits. It exists so the engine's replay and
//! memoization properties (see the engine crate's `tests/`) can be
//! exercised without standing up an external database, the same way the
//! wider durable-execution ecosystem ships an in-memory event store
//! alongside its production one.

use crate::error::StoreError;
use crate::store::{DurabilityStore, RunId, RunRecord, RunStatus, StepRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct RunEntry {
    record: Mutex<RunRecord>,
    steps: DashMap<String, StepRecord>,
}

/// Default, no-op-persisted durability store. Safe to share across tasks
/// via an `Arc`.
#[derive(Default, Clone)]
pub struct InMemoryDurabilityStore {
    runs: Arc<DashMap<RunId, Arc<RunEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryDurabilityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, run_id: &RunId) -> Result<Arc<RunEntry>, StoreError> {
        self.runs
            .get(run_id)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::RunNotFound(run_id.clone()))
    }
}

#[async_trait]
impl DurabilityStore for InMemoryDurabilityStore {
    async fn create_run(&self, agent_id: &str) -> Result<RunId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let run_id = format!("run-{id}");
        let entry = Arc::new(RunEntry {
            record: Mutex::new(RunRecord {
                run_id: run_id.clone(),
                agent_id: agent_id.to_string(),
                status: RunStatus::Pending,
                return_value: None,
            }),
            steps: DashMap::new(),
        });
        self.runs.insert(run_id.clone(), entry);
        Ok(run_id)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunRecord, StoreError> {
        let entry = self.entry(run_id)?;
        Ok(entry.record.lock().clone())
    }

    async fn set_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        return_value: Option<Value>,
    ) -> Result<(), StoreError> {
        let entry = self.entry(run_id)?;
        let mut record = entry.record.lock();
        record.status = status;
        if return_value.is_some() {
            record.return_value = return_value;
        }
        Ok(())
    }

    async fn get_step(
        &self,
        run_id: &RunId,
        step_key: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let entry = self.entry(run_id)?;
        Ok(entry.steps.get(step_key).map(|r| r.clone()))
    }

    async fn put_step(
        &self,
        run_id: &RunId,
        step_key: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        let entry = self.entry(run_id)?;
        entry
            .steps
            .entry(step_key.to_string())
            .and_modify(|r| r.result = Some(result.clone()))
            .or_insert_with(|| StepRecord {
                step_key: step_key.to_string(),
                result: Some(result.clone()),
                attempts: 1,
            });
        Ok(())
    }

    async fn bump_step_attempts(
        &self,
        run_id: &RunId,
        step_key: &str,
    ) -> Result<u32, StoreError> {
        let entry = self.entry(run_id)?;
        let mut record = entry
            .steps
            .entry(step_key.to_string())
            .or_insert_with(|| StepRecord {
                step_key: step_key.to_string(),
                result: None,
                attempts: 0,
            });
        record.attempts += 1;
        Ok(record.attempts)
    }

    async fn cancel_run(&self, run_id: &RunId) -> Result<(), StoreError> {
        let entry = self.entry(run_id)?;
        let mut record = entry.record.lock();
        if !matches!(
            record.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        ) {
            record.status = RunStatus::Cancelled;
        }
        Ok(())
    }
}
