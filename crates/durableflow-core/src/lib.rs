// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable agent orchestration engine.
//!
//! Executes directed workflows composed of LLM-backed worker nodes, pure
//! deterministic transforms, and nested manager workflows, with streaming
//! progress, checkpointed durability, and principled failure handling.
//! Concrete LLM providers, tool-server transports, schema validators, and
//! durability backends are external collaborators (see
//! [`worker::AgentRuntime`] and, in the `durableflow-state` crate,
//! `DurabilityStore`) — this crate only implements the orchestration core.

pub mod bridge;
pub mod context;
pub mod dag;
pub mod entry;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod parser;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod skills;
pub mod template;
pub mod worker;
pub mod workflow;

pub use context::ExecutionContext;
pub use entry::{run_workflow, WorkflowOutcome};
pub use error::{OrchestratorError, Result};
pub use manifest::{AgentManifest, ExecutionConfig};
pub use orchestrator::{execute_steps, DurabilityHandle, ManifestLoader, OrchestratorEnv};
pub use progress::{ProgressEvent, ProgressWriter};
pub use registry::StepRegistry;
pub use worker::{AgentInvocation, AgentOutcome, AgentRuntime};
pub use workflow::{StepGraph, StepNode};

pub use durableflow_state::{DurabilityStore, InMemoryDurabilityStore, RunId, RunRecord, RunStatus};
