// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durability-store contract for the durableflow orchestration engine.
//!
//! This crate does not prescribe a concrete production backend. It defines
//! the contract a host runtime must satisfy (§6 of the engine spec: `start`,
//! `getRun`, run status, and per-run state persisted between step
//! invocations) and ships one reference implementation, [`InMemoryDurabilityStore`],
//! used by the engine's own tests and by callers that don't need
//! cross-process durability. Production backends (Postgres, etc.) are an
//! external collaborator, not part of this crate.

mod error;
mod memory;
mod store;

pub use error::StoreError;
pub use memory::InMemoryDurabilityStore;
pub use store::{
    DurabilityStore, RunHandle, RunId, RunRecord, RunStatus, StepRecord, StoredStepResult,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable names recognized when constructing a store `from_env`.
///
/// These mirror the names in §6 of the engine spec. This crate does not read
/// them itself (the in-memory store has nothing to connect to); a concrete
/// backend's `from_env` constructor is expected to honor them the way the
/// teacher crate's provider types expose `from_env()` constructors.
pub mod env_vars {
    /// Direct connection string to the durability backend.
    pub const DIRECT_URL: &str = "WORKFLOW_DIRECT_URL";
    /// Postgres-specific connection string, if the backend is Postgres.
    pub const POSTGRES_URL: &str = "WORKFLOW_POSTGRES_URL";
    /// Prefix applied to job/run identifiers for multi-tenant deployments.
    pub const JOB_PREFIX: &str = "WORKFLOW_JOB_PREFIX";
    /// Maximum number of concurrently running workflow instances.
    pub const CONCURRENCY: &str = "WORKFLOW_CONCURRENCY";
}
