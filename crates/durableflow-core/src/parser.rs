// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Workflow document parser (§4.2).
//!
//! Turns a markdown document with embedded YAML step blocks into a
//! [`StepGraph`]. No regex dependency: headers and fences are recognized
//! with a small hand-rolled byte-offset scanner, which also makes the
//! "nearest preceding header, skipping any header already claimed by a
//! closer one" association rule (step 3) straightforward to express as a
//! single pass over recorded offsets.

use crate::workflow::{
    default_call_store_key, CallRetryPolicy, CallStep, ConditionalStep, LoopMode, LoopSource,
    LoopStep, OnFailure, ParallelStep, StepGraph, StepNode, TransformStep,
    DEFAULT_LOOP_OUTPUT_KEY,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

/// A structured parse failure. Per §4.2, a malformed YAML block is logged
/// and skipped (non-fatal); only block-association errors are fatal, and
/// those can't actually arise from this scanner (every fenced `yaml`/`yml`
/// block is associated with *some* preceding header or none at all, never
/// an inconsistent one), so this type exists for completeness and for
/// callers who want to surface "the document had zero recognized steps"
/// as an error.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// No numbered header could be associated with any YAML block, and the
    /// document contained at least one such block before the first header.
    #[error("yaml block at byte {offset} precedes any numbered header")]
    BlockBeforeAnyHeader {
        /// Byte offset of the orphaned block.
        offset: usize,
    },
}

/// Failure parsing one YAML block's body into a typed step shape, either
/// because the YAML itself is malformed or because it parsed but didn't
/// match any recognized step's field layout.
#[derive(Debug, thiserror::Error)]
enum BlockError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("structure: {0}")]
    Json(#[from] serde_json::Error),
}

struct Header {
    offset: usize,
    name: String,
}

struct FencedBlock {
    offset: usize,
    body: String,
}

/// Parses a workflow document into a [`StepGraph`].
pub fn parse_workflow(document: &str) -> Result<StepGraph, ParseError> {
    let headers = scan_headers(document);
    let blocks = scan_yaml_blocks(document);

    let mut steps = Vec::new();
    for block in &blocks {
        let header = closest_enclosing_header(&headers, block.offset);
        let header_name = match header {
            Some(h) => h.name.clone(),
            None => {
                warn!(offset = block.offset, "yaml block precedes any header, skipping");
                continue;
            }
        };

        match parse_block(&header_name, &block.body) {
            Ok(Some(node)) => steps.push(node),
            Ok(None) => {
                warn!(header = %header_name, "yaml block has no recognized step key, skipping");
            }
            Err(err) => {
                warn!(header = %header_name, error = %err, "malformed yaml block, skipping");
            }
        }
    }

    Ok(StepGraph { steps })
}

/// Recognizes `^#{1,2}\s*\d+\.\s` at the start of a line, without a regex
/// dependency.
fn scan_headers(document: &str) -> Vec<Header> {
    let mut headers = Vec::new();
    let mut offset = 0usize;
    for line in document.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
        if let Some(name) = match_header_line(trimmed) {
            headers.push(Header { offset, name });
        }
        offset += line.len();
    }
    headers
}

fn match_header_line(line: &str) -> Option<String> {
    let mut rest = line;
    let mut hashes = 0;
    while rest.starts_with('#') && hashes < 2 {
        rest = &rest[1..];
        hashes += 1;
    }
    if hashes == 0 || rest.starts_with('#') {
        return None;
    }
    let rest = rest.trim_start();
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let after_digits = &rest[digits_end..];
    if !after_digits.starts_with('.') {
        return None;
    }
    let after_dot = &after_digits[1..];
    if !after_dot.starts_with(char::is_whitespace) {
        return None;
    }
    Some(line.trim().to_string())
}

/// Scans for fenced blocks opened by ` ```yaml` or ` ```yml` (optionally
/// with trailing whitespace) and closed by the next ` ``` ` fence.
fn scan_yaml_blocks(document: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut offset = 0usize;
    let mut lines = document.split_inclusive('\n').peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
        let lang = trimmed.trim_start().strip_prefix("```");
        let block_offset = offset;
        offset += line.len();

        if let Some(lang) = lang {
            let lang = lang.trim();
            if lang == "yaml" || lang == "yml" {
                let mut body = String::new();
                for body_line in lines.by_ref() {
                    let body_trimmed = body_line.trim_end_matches('\n').trim_end_matches('\r');
                    offset += body_line.len();
                    if body_trimmed.trim_start().starts_with("```") {
                        break;
                    }
                    body.push_str(body_trimmed);
                    body.push('\n');
                }
                blocks.push(FencedBlock {
                    offset: block_offset,
                    body,
                });
            }
        }
    }
    blocks
}

/// The "closest enclosing header" rule (step 3): the header with the
/// largest offset strictly less than the block's offset.
fn closest_enclosing_header<'a>(headers: &'a [Header], block_offset: usize) -> Option<&'a Header> {
    headers
        .iter()
        .filter(|h| h.offset < block_offset)
        .max_by_key(|h| h.offset)
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    #[serde(rename = "maxAttempts")]
    max_attempts: Option<u32>,
    #[serde(rename = "delayMs")]
    delay_ms: Option<u64>,
    #[serde(rename = "backoffMultiplier")]
    backoff_multiplier: Option<f64>,
    #[serde(rename = "onFailure")]
    on_failure: Option<String>,
    #[serde(rename = "fallbackStore")]
    fallback_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCall {
    call: String,
    #[serde(default)]
    input: Map<String, Value>,
    store: Option<String>,
    retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize)]
struct RawTransform {
    transform: String,
    #[serde(default)]
    input: Map<String, Value>,
    store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLoop {
    #[serde(rename = "loop")]
    over: Value,
    item: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    steps: Vec<Value>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawParallel {
    #[serde(default)]
    parallel: Vec<RawBranch>,
}

#[derive(Debug, Deserialize)]
struct RawBranch {
    #[serde(default)]
    steps: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawConditional {
    #[serde(rename = "if")]
    condition: String,
    #[serde(default)]
    then: Vec<Value>,
    #[serde(default)]
    r#else: Vec<Value>,
}

fn parse_block(header_name: &str, body: &str) -> Result<Option<StepNode>, BlockError> {
    let raw: Value = serde_yaml::from_str(body)?;
    parse_node(header_name, &raw)
}

/// Parses one YAML mapping into a [`StepNode`], dispatching on the first
/// recognized key (step 4): `call`, `transform`, `loop`, `parallel`, `if`.
fn parse_node(name: &str, raw: &Value) -> Result<Option<StepNode>, BlockError> {
    let map = match raw.as_object() {
        Some(m) => m,
        None => return Ok(None),
    };

    if map.contains_key("call") {
        let raw_call: RawCall = serde_json::from_value(raw.clone())?;
        let store_key = raw_call
            .store
            .unwrap_or_else(|| default_call_store_key(&raw_call.call));
        let retry = raw_call.retry.map(parse_retry);
        return Ok(Some(StepNode::Call(CallStep {
            name: name.to_string(),
            agent_id: raw_call.call,
            input: json_map_from_yaml(raw_call.input),
            store_key,
            retry,
        })));
    }

    if map.contains_key("transform") {
        let raw_transform: RawTransform = serde_json::from_value(raw.clone())?;
        let store_key = raw_transform
            .store
            .unwrap_or_else(|| format!("artifacts.{}", raw_transform.transform));
        return Ok(Some(StepNode::Transform(TransformStep {
            name: name.to_string(),
            transform_id: raw_transform.transform,
            input: json_map_from_yaml(raw_transform.input),
            store_key,
        })));
    }

    if map.contains_key("loop") {
        let raw_loop: RawLoop = serde_json::from_value(raw.clone())?;
        let over = match raw_loop.over {
            Value::String(s) if s.starts_with("${") => LoopSource::Path(
                s.trim_start_matches("${").trim_end_matches('}').to_string(),
            ),
            Value::String(s) => LoopSource::Path(s),
            Value::Array(items) => LoopSource::Literal(items),
            other => LoopSource::Literal(other.as_array().cloned().unwrap_or_default()),
        };
        let mode = match raw_loop.mode.as_deref() {
            Some("sequential") => LoopMode::Sequential,
            _ => LoopMode::Parallel,
        };
        let nested = parse_nested(&raw_loop.steps)?;
        let output_key = raw_loop.output.unwrap_or_else(|| DEFAULT_LOOP_OUTPUT_KEY.to_string());
        return Ok(Some(StepNode::Loop(LoopStep {
            name: name.to_string(),
            over,
            item_var: raw_loop.item.unwrap_or_else(|| "item".to_string()),
            mode,
            steps: nested,
            output_key,
        })));
    }

    if map.contains_key("parallel") {
        let raw_parallel: RawParallel = serde_json::from_value(raw.clone())?;
        let mut branches = Vec::new();
        for branch in raw_parallel.parallel {
            branches.push(parse_nested(&branch.steps)?);
        }
        return Ok(Some(StepNode::Parallel(ParallelStep {
            name: name.to_string(),
            branches,
        })));
    }

    if map.contains_key("if") {
        let raw_if: RawConditional = serde_json::from_value(raw.clone())?;
        return Ok(Some(StepNode::Conditional(ConditionalStep {
            name: name.to_string(),
            condition: raw_if.condition,
            then_steps: parse_nested(&raw_if.then)?,
            else_steps: parse_nested(&raw_if.r#else)?,
        })));
    }

    Ok(None)
}

fn parse_nested(items: &[Value]) -> Result<Vec<StepNode>, BlockError> {
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let synthetic_name = synthetic_step_name(item, i);
        if let Some(node) = parse_node(&synthetic_name, item)? {
            out.push(node);
        }
    }
    Ok(out)
}

fn synthetic_step_name(item: &Value, index: usize) -> String {
    if let Some(map) = item.as_object() {
        for key in ["call", "transform"] {
            if let Some(Value::String(v)) = map.get(key) {
                return v.clone();
            }
        }
        if map.contains_key("loop") {
            return format!("loop-{index}");
        }
        if map.contains_key("parallel") {
            return format!("parallel-{index}");
        }
        if map.contains_key("if") {
            return format!("conditional-{index}");
        }
    }
    format!("step-{index}")
}

fn parse_retry(raw: RawRetry) -> CallRetryPolicy {
    CallRetryPolicy {
        max_attempts: raw.max_attempts.unwrap_or(1),
        delay_ms: raw.delay_ms.unwrap_or(1000),
        backoff_multiplier: raw.backoff_multiplier.unwrap_or(1.0),
        on_failure: match raw.on_failure.as_deref() {
            Some("continue") => OnFailure::Continue,
            _ => OnFailure::Abort,
        },
        fallback_store: raw.fallback_store,
    }
}

fn json_map_from_yaml(map: Map<String, Value>) -> Map<String, Value> {
    // `input` mappings are parsed straight from YAML into serde_json::Value
    // via serde_yaml's JSON-compatible data model, so no conversion is
    // needed beyond the type alias already matching.
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
# 1. Fetch data

Some prose between the header and the block.

```yaml
call: fetcher
store: artifacts.raw
```

## 2. Transform it

```yaml
transform: normalize
input:
  raw: "${artifacts.raw}"
store: artifacts.normalized
```
"#;

    #[test]
    fn parses_steps_in_document_order() {
        let graph = parse_workflow(DOC).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.steps[0].name(), "1. Fetch data");
        assert_eq!(graph.steps[1].name(), "2. Transform it");
    }

    #[test]
    fn prose_between_header_and_block_is_ignored() {
        let graph = parse_workflow(DOC).unwrap();
        match &graph.steps[0] {
            StepNode::Call(c) => assert_eq!(c.agent_id, "fetcher"),
            _ => panic!("expected call step"),
        }
    }

    #[test]
    fn malformed_block_is_skipped_others_parse() {
        let doc = r#"
# 1. Bad block

```yaml
call: [unterminated
```

# 2. Good block

```yaml
call: good-agent
```
"#;
        let graph = parse_workflow(doc).unwrap();
        assert_eq!(graph.len(), 1);
        match &graph.steps[0] {
            StepNode::Call(c) => assert_eq!(c.agent_id, "good-agent"),
            _ => panic!("expected call step"),
        }
    }

    #[test]
    fn default_store_key_derived_from_agent_id() {
        let doc = r#"
# 1. Step

```yaml
call: team/writer
```
"#;
        let graph = parse_workflow(doc).unwrap();
        match &graph.steps[0] {
            StepNode::Call(c) => assert_eq!(c.store_key, "artifacts.writer"),
            _ => panic!("expected call step"),
        }
    }

    #[test]
    fn parses_loop_with_default_output_key() {
        let doc = r#"
# 1. Square each

```yaml
loop: "${input.numbers}"
item: n
mode: parallel
steps:
  - call: squarer
    store: artifacts.square
```
"#;
        let graph = parse_workflow(doc).unwrap();
        match &graph.steps[0] {
            StepNode::Loop(l) => {
                assert_eq!(l.item_var, "n");
                assert_eq!(l.mode, LoopMode::Parallel);
                // No `output:` key given: defaults unconditionally to
                // `artifacts.loopResult`, independent of what the nested
                // step stores (spec.md:93).
                assert_eq!(l.output_key, DEFAULT_LOOP_OUTPUT_KEY);
            }
            _ => panic!("expected loop step"),
        }
    }

    #[test]
    fn parses_parallel_branches() {
        let doc = r#"
# 1. Fan out

```yaml
parallel:
  - steps:
      - call: a
  - steps:
      - call: b
```
"#;
        let graph = parse_workflow(doc).unwrap();
        match &graph.steps[0] {
            StepNode::Parallel(p) => assert_eq!(p.branches.len(), 2),
            _ => panic!("expected parallel step"),
        }
    }

    #[test]
    fn parses_conditional_with_else() {
        let doc = r#"
# 1. Branch

```yaml
if: "${artifacts.flag} == true"
then:
  - call: yes-agent
else:
  - call: no-agent
```
"#;
        let graph = parse_workflow(doc).unwrap();
        match &graph.steps[0] {
            StepNode::Conditional(c) => {
                assert_eq!(c.then_steps.len(), 1);
                assert_eq!(c.else_steps.len(), 1);
            }
            _ => panic!("expected conditional step"),
        }
    }
}
