// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Agent manifest loading (§3, §6).
//!
//! An agent directory is `agent.json` + `AGENTS.md` (+ optional
//! `WORKFLOW.md`, `skills/*.skill.md`). Loading is cached in-process,
//! keyed by `(path, basePath)` (§4.5's "typical step" list), since a
//! manifest is immutable once read and a workflow may reference the same
//! sub-agent from many steps.

use crate::error::{OrchestratorError, Result};
use crate::parser::parse_workflow;
use crate::workflow::StepGraph;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Model-tier selection used when `model` is left as `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Balanced,
    Quality,
}

/// `executionMode` (§6): how the worker invokes its underlying model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Stream,
    Generate,
    Durable,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Durable
    }
}

/// `checkpointStrategy` of an explicit durability config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStrategy {
    Step,
    Tool,
    Both,
}

/// Explicit retry sub-config of a durability setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityRetry {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

/// `durability` (§6): either a named preset or an explicit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurabilityConfig {
    /// `"quick"` / `"standard"` / `"extended"` / `"critical"`.
    Preset(String),
    /// A fully spelled-out configuration.
    Explicit {
        enabled: bool,
        max_duration_ms: u64,
        retry: DurabilityRetry,
        checkpoint_strategy: CheckpointStrategy,
    },
}

/// Execution configuration (§6's enumerated table).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub tier: Option<ModelTier>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub temperature: Option<f64>,
    pub max_steps: Option<u32>,
    pub max_tokens: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub execution_mode: Option<ExecutionMode>,
    pub skip_synthesis: bool,
    pub output_artifact: Option<String>,
    pub durability: Option<DurabilityConfig>,
}

/// `progress.aiDriven` from `agent.json`: whether the worker extracts
/// in-band progress updates emitted by the model itself (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressConfig {
    pub ai_driven: bool,
}

/// `skills` block of `agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SkillsConfig {
    pub path: Option<String>,
    pub expose: bool,
}

/// A schema reference: either a registry lookup (`"<agentId>:input"`) or a
/// file-local one (`"./file.ts#Name"`). The core never resolves these
/// itself (§6) — it only carries the string through to a collaborator.
pub type SchemaRef = String;

/// `interface` block of `agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceRefs {
    pub input: SchemaRef,
    pub output: SchemaRef,
}

/// The `agent.json` document, as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifestFile {
    pub id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub interface: InterfaceRefs,
    #[serde(default)]
    pub config: ExecutionConfig,
    #[serde(default)]
    pub mcp_servers: Value,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub tools: Value,
    #[serde(default)]
    pub progress: ProgressConfig,
}

/// An immutable, fully-loaded agent manifest (§3).
#[derive(Debug, Clone)]
pub struct AgentManifest {
    pub id: String,
    pub version: String,
    pub path: PathBuf,
    pub interface: InterfaceRefs,
    pub base_instructions: String,
    pub step_graph: Option<StepGraph>,
    pub config: ExecutionConfig,
    pub skills: SkillsConfig,
    pub progress: ProgressConfig,
    pub mcp_servers: Value,
    pub tools: Value,
}

impl AgentManifest {
    /// Whether this manifest describes a manager (has a parsed step graph)
    /// as opposed to a worker (single LLM invocation).
    pub fn is_manager(&self) -> bool {
        self.step_graph.is_some()
    }

    /// Converts to the durable-safe view persisted between step
    /// invocations (§4.5's non-serializable boundary): drops nothing that
    /// isn't already plain data, but exists as the explicit seam a step
    /// argument crosses.
    pub fn to_serializable_view(&self) -> SerializableManifestView {
        SerializableManifestView {
            id: self.id.clone(),
            version: self.version.clone(),
            base_instructions: self.base_instructions.clone(),
            config: self.config.clone(),
            is_manager: self.is_manager(),
        }
    }
}

/// The data a durable step is allowed to carry across a serialization
/// boundary: no validators, no functions, no filesystem handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableManifestView {
    pub id: String,
    pub version: String,
    pub base_instructions: String,
    pub config: ExecutionConfig,
    pub is_manager: bool,
}

/// Strips a leading YAML frontmatter block (`---\n...\n---\n`) from a
/// markdown document, returning the body only. Used for both `AGENTS.md`
/// and `*.skill.md` files (see [`crate::skills`]); neither currently needs
/// the frontmatter fields themselves, only the body.
pub fn strip_frontmatter(markdown: &str) -> &str {
    let trimmed = markdown.trim_start();
    if let Some(rest) = trimmed.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let after = &rest[end + 4..];
            return after.trim_start_matches('\n');
        }
    }
    markdown
}

static MANIFEST_CACHE: Lazy<DashMap<(PathBuf, PathBuf), Arc<AgentManifest>>> = Lazy::new(DashMap::new);

/// Loads (or returns a cached copy of) the manifest at `agent_dir`,
/// resolved relative to `base_path`. The cache key is `(path, basePath)`
/// per §4.5; concurrent loads of the same key converge to the same
/// `Arc`-shared value.
pub async fn load_manifest(agent_dir: &Path, base_path: &Path) -> Result<Arc<AgentManifest>> {
    let key = (agent_dir.to_path_buf(), base_path.to_path_buf());
    if let Some(existing) = MANIFEST_CACHE.get(&key) {
        debug!(path = %agent_dir.display(), "manifest cache hit");
        return Ok(existing.clone());
    }

    let resolved = if agent_dir.is_absolute() {
        agent_dir.to_path_buf()
    } else {
        base_path.join(agent_dir)
    };

    let manifest_json = tokio::fs::read_to_string(resolved.join("agent.json"))
        .await
        .map_err(|e| OrchestratorError::InvalidManifest {
            path: resolved.display().to_string(),
            reason: format!("reading agent.json: {e}"),
        })?;
    let file: AgentManifestFile = serde_json::from_str(&manifest_json).map_err(|e| {
        OrchestratorError::InvalidManifest {
            path: resolved.display().to_string(),
            reason: format!("parsing agent.json: {e}"),
        }
    })?;

    let agents_md = tokio::fs::read_to_string(resolved.join("AGENTS.md"))
        .await
        .map_err(|e| OrchestratorError::InvalidManifest {
            path: resolved.display().to_string(),
            reason: format!("reading AGENTS.md: {e}"),
        })?;
    let base_instructions = strip_frontmatter(&agents_md).to_string();

    let step_graph = match tokio::fs::read_to_string(resolved.join("WORKFLOW.md")).await {
        Ok(document) => Some(parse_workflow(&document).map_err(|e| OrchestratorError::InvalidManifest {
            path: resolved.display().to_string(),
            reason: format!("parsing WORKFLOW.md: {e}"),
        })?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %resolved.display(), "no WORKFLOW.md; agent is a worker");
            None
        }
        Err(e) => {
            warn!(path = %resolved.display(), error = %e, "failed reading WORKFLOW.md");
            None
        }
    };

    let manifest = Arc::new(AgentManifest {
        id: file.id,
        version: file.version,
        path: resolved.clone(),
        interface: file.interface,
        base_instructions,
        step_graph,
        config: file.config,
        skills: file.skills,
        progress: file.progress,
        mcp_servers: file.mcp_servers,
        tools: file.tools,
    });

    MANIFEST_CACHE.insert(key, manifest.clone());
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_is_stripped() {
        let doc = "---\ntitle: x\n---\nHello there";
        assert_eq!(strip_frontmatter(doc), "Hello there");
    }

    #[test]
    fn no_frontmatter_passes_through() {
        let doc = "Just a body";
        assert_eq!(strip_frontmatter(doc), "Just a body");
    }

    #[tokio::test]
    async fn missing_agent_json_is_an_invalid_manifest_error() {
        let dir = std::env::temp_dir().join(format!("durableflow-manifest-test-{}", std::process::id()));
        let err = load_manifest(&dir, Path::new(".")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidManifest { .. }));
    }
}
