// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error type for durability-store operations.

/// Errors a [`crate::DurabilityStore`] implementation may raise.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run exists with the given id.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// No step result exists with the given key for a run.
    #[error("step not found: run={run_id} step={step_key}")]
    StepNotFound {
        /// Run identifier.
        run_id: String,
        /// Step key within the run.
        step_key: String,
    },

    /// A step's recorded result could not be deserialized back to the
    /// caller's expected shape.
    #[error("failed to deserialize stored step result: {0}")]
    Deserialize(String),

    /// A step's result could not be serialized for storage.
    #[error("failed to serialize step result: {0}")]
    Serialize(String),

    /// The run already exists (duplicate `start`).
    #[error("run already exists: {0}")]
    AlreadyExists(String),

    /// Backend-specific failure (connection, I/O, etc.).
    #[error("durability backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err.to_string())
    }
}
