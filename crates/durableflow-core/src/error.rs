// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the orchestration engine (§7).

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All errors the engine can raise.
///
/// Each variant is classified by [`OrchestratorError::is_retryable`] and
/// [`OrchestratorError::is_fatal`] so callers (the retry executor, the
/// step-policy handler in the orchestration executor) can dispatch on
/// category rather than match every variant.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Input or output failed its schema. Never retried.
    #[error("validation failed for '{subject}': {reason}")]
    Validation {
        /// What was being validated (e.g. an agent id or step key).
        subject: String,
        /// Human-readable reason.
        reason: String,
    },

    /// A step references a transform id that isn't registered.
    #[error("unknown transform: {0}")]
    UnknownTransform(String),

    /// A step references an agent id that can't be resolved/loaded.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// A referenced step could not be found in the graph.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// A step's configuration doesn't match its declared type.
    #[error("invalid step config for '{step_id}': {reason}")]
    InvalidStepConfig {
        /// Step id.
        step_id: String,
        /// Why the config is invalid.
        reason: String,
    },

    /// The manifest for an agent is missing a required file or field.
    #[error("invalid manifest at '{path}': {reason}")]
    InvalidManifest {
        /// Manifest path.
        path: String,
        /// Why it's invalid.
        reason: String,
    },

    /// Credentials required for a non-OAuth provider were not supplied.
    #[error("missing credentials for provider '{0}'")]
    MissingCredentials(String),

    /// A worker never produced schema-constrained structured output.
    #[error("agent '{0}' never produced structured output")]
    NoStructuredOutput(String),

    /// A nested manager (child workflow) failed; always fatal to the parent.
    #[error("nested manager '{agent_id}' failed: {reason}")]
    NestedManagerFailed {
        /// Child agent id.
        agent_id: String,
        /// Underlying failure reason.
        reason: String,
    },

    /// A step exceeded its configured timeout.
    #[error("step timed out after {duration:?}")]
    Timeout {
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// Transient failure: model/provider overloaded, connection reset, etc.
    /// Eligible for retry by the durable step layer.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// An artifact key expected to exist (e.g. `skipSynthesis` output) is
    /// absent.
    #[error("artifact not found: '{key}' (available: {available:?})")]
    ArtifactNotFound {
        /// The dot-notation key that was looked up.
        key: String,
        /// Top-level keys that were actually present, for debugging.
        available: Vec<String>,
    },

    /// Durability-store failure surfaced through the engine.
    #[error("durability store error: {0}")]
    Store(String),

    /// Catch-all for anything not otherwise classified.
    #[error("{0}")]
    Other(anyhow::Error),
}

impl OrchestratorError {
    /// Builds an [`OrchestratorError::Other`] from any displayable message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(msg.into()))
    }

    /// Whether the durable step layer should retry the operation that
    /// produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::Timeout { .. })
    }

    /// Whether this error must abort the enclosing workflow outright,
    /// regardless of any `onFailure=continue` policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownTransform(_)
                | Self::UnknownAgent(_)
                | Self::InvalidManifest { .. }
                | Self::MissingCredentials(_)
                | Self::NoStructuredOutput(_)
                | Self::NestedManagerFailed { .. }
        )
    }

    /// The wire-level error code used by the workflow entry point when it
    /// writes a terminal error chunk.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::UnknownTransform(_)
            | Self::UnknownAgent(_)
            | Self::InvalidManifest { .. }
            | Self::MissingCredentials(_)
            | Self::NoStructuredOutput(_)
            | Self::NestedManagerFailed { .. } => "FATAL_ERROR",
            _ => "WORKFLOW_EXECUTION_FAILED",
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::other(format!("serialization error: {err}"))
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::other(format!("yaml error: {err}"))
    }
}

impl From<durableflow_state::StoreError> for OrchestratorError {
    fn from(err: durableflow_state::StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(OrchestratorError::Retryable("x".into()).is_retryable());
        assert!(OrchestratorError::Timeout {
            duration: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!OrchestratorError::UnknownAgent("a".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(OrchestratorError::MissingCredentials("openai".into()).is_fatal());
        assert!(!OrchestratorError::Retryable("x".into()).is_fatal());
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            OrchestratorError::Validation {
                subject: "x".into(),
                reason: "y".into()
            }
            .code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(OrchestratorError::UnknownAgent("a".into()).code(), "FATAL_ERROR");
        assert_eq!(
            OrchestratorError::Retryable("x".into()).code(),
            "WORKFLOW_EXECUTION_FAILED"
        );
    }
}
