// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Skills aggregation (§4.7).
//!
//! A manifest's `skills.path` directory holds `*.skill.md` files, loaded
//! in directory order with YAML frontmatter stripped, each appended to the
//! system prompt under a `Skill: <name>` heading. A manager additionally
//! pulls in the skills of any child `Call` agent that marks its own skills
//! as *exposed*, namespaced `<child-agent-id>:<skill-name>`.

use crate::manifest::{strip_frontmatter, AgentManifest};
use crate::workflow::{StepGraph, StepNode};
use std::path::Path;
use tracing::{debug, warn};

/// One loaded skill, ready to be rendered into a system prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    /// `name`, or `<child-agent-id>:name` when pulled in from a child.
    pub name: String,
    /// Body with frontmatter stripped.
    pub body: String,
}

impl Skill {
    /// Renders this skill as a `"Skill: <name>"` markdown section.
    pub fn render(&self) -> String {
        format!("## Skill: {}\n\n{}", self.name, self.body.trim())
    }
}

/// §4.6 step 2: the standard instruction appended to every agent's system
/// prompt, describing how it should report progress in its structured
/// output.
pub const PROGRESS_INSTRUCTION: &str = "Report your progress as you work by including a `_progress` field in your structured output: `{ \"userMessage\": <short status string>, \"estimatedProgress\": <integer 0-100> }`. Update it whenever your estimate of completion changes.";

/// Builds the full system prompt an invocation is given: base instructions,
/// then each loaded skill's rendered section in order, then the standard
/// progress-reporting instruction (§4.6 step 2, §4.7).
pub fn build_system_prompt(base_instructions: &str, skills: &[Skill]) -> String {
    let mut prompt = base_instructions.trim_end().to_string();
    for skill in skills {
        prompt.push_str("\n\n");
        prompt.push_str(&skill.render());
    }
    prompt.push_str("\n\n");
    prompt.push_str(PROGRESS_INSTRUCTION);
    prompt
}

/// Loads a manifest's own `*.skill.md` files, in directory order. Returns
/// an empty list (not an error) when no `skills.path` is declared, or when
/// the declared directory is missing — missing skill directories are
/// non-fatal per §4.7.
pub async fn load_own_skills(manifest: &AgentManifest) -> Vec<Skill> {
    let Some(rel_path) = manifest.skills.path.as_deref() else {
        return Vec::new();
    };
    load_skill_dir(&manifest.path.join(rel_path)).await
}

/// Loads `*.skill.md` files from `dir`, sorted by file name (directory
/// order, deterministic across filesystems).
async fn load_skill_dir(dir: &Path) -> Vec<Skill> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "skills directory absent; skipping");
            return Vec::new();
        }
    };

    let mut paths = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if path.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(".skill.md")) == Some(true) {
                    paths.push(path);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "error walking skills directory");
                break;
            }
        }
    }
    paths.sort();

    let mut skills = Vec::new();
    for path in paths {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let name = skill_name_from_path(&path);
                skills.push(Skill {
                    name,
                    body: strip_frontmatter(&contents).to_string(),
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed reading skill file"),
        }
    }
    skills
}

fn skill_name_from_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim_end_matches(".skill.md").to_string())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Aggregates a manager's own skills plus the skills of any child `Call`
/// agent whose manifest marks `skills.expose = true`, namespaced
/// `<child-agent-id>:<skill-name>`.
///
/// `load_child` is supplied by the caller (the orchestration executor,
/// which already knows how to resolve an agent id to a loaded manifest)
/// rather than this module reaching back into manifest loading itself.
pub async fn aggregate_manager_skills<F, Fut>(
    manifest: &AgentManifest,
    graph: &StepGraph,
    load_child: F,
) -> Vec<Skill>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Option<AgentManifest>>,
{
    let mut skills = load_own_skills(manifest).await;

    for agent_id in child_call_agent_ids(&graph.steps) {
        let Some(child) = load_child(agent_id.clone()).await else {
            debug!(agent_id = %agent_id, "child manifest unavailable; skipping its skills");
            continue;
        };
        if !child.skills.expose {
            continue;
        }
        for skill in load_own_skills(&child).await {
            skills.push(Skill {
                name: format!("{agent_id}:{}", skill.name),
                body: skill.body,
            });
        }
    }

    skills
}

fn child_call_agent_ids(nodes: &[StepNode]) -> Vec<String> {
    let mut ids = Vec::new();
    collect_call_agent_ids(nodes, &mut ids);
    ids
}

fn collect_call_agent_ids(nodes: &[StepNode], out: &mut Vec<String>) {
    for node in nodes {
        match node {
            StepNode::Call(step) => out.push(step.agent_id.clone()),
            StepNode::Parallel(step) => step.branches.iter().for_each(|b| collect_call_agent_ids(b, out)),
            StepNode::Loop(step) => collect_call_agent_ids(&step.steps, out),
            StepNode::Conditional(step) => {
                collect_call_agent_ids(&step.then_steps, out);
                collect_call_agent_ids(&step.else_steps, out);
            }
            StepNode::Transform(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_name_strips_suffix() {
        let path = Path::new("/a/b/summarize.skill.md");
        assert_eq!(skill_name_from_path(path), "summarize");
    }

    #[test]
    fn render_produces_heading() {
        let skill = Skill {
            name: "researcher:search".to_string(),
            body: "  body text  ".to_string(),
        };
        assert_eq!(skill.render(), "## Skill: researcher:search\n\nbody text");
    }

    #[test]
    fn system_prompt_orders_base_then_skills_then_progress_instruction() {
        let skills = vec![Skill {
            name: "search".to_string(),
            body: "how to search".to_string(),
        }];
        let prompt = build_system_prompt("You are helpful.", &skills);
        let base_at = prompt.find("You are helpful.").unwrap();
        let skill_at = prompt.find("## Skill: search").unwrap();
        let progress_at = prompt.find(PROGRESS_INSTRUCTION).unwrap();
        assert!(base_at < skill_at && skill_at < progress_at);
    }

    #[test]
    fn system_prompt_with_no_skills_still_appends_progress_instruction() {
        let prompt = build_system_prompt("Be helpful.", &[]);
        assert_eq!(prompt, format!("Be helpful.\n\n{PROGRESS_INSTRUCTION}"));
    }
}
