// Copyright (c) 2025 Durableflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Template resolver (§4.1).
//!
//! Resolves `${path}` references against a hierarchical context and
//! evaluates boolean conditions under a restricted, hand-written grammar.
//! Deliberately not a general template engine (see DESIGN.md): the
//! security invariant in §4.1 ("must not use an unrestricted host-language
//! eval") rules out reaching for `handlebars`' helper/eval machinery here.

use serde_json::Value;
use tracing::debug;

/// Splits a `${...}` reference's inner path and resolves it against `input`
/// / `artifacts`, following the prefix rules in §4.1.
///
/// Missing keys resolve to the literal string `"undefined"` rather than an
/// error, matching the spec's JS-flavored lookup semantics.
pub fn resolve_path(path: &str, input: &Value, artifacts: &Value) -> Value {
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.is_empty() {
        return undefined();
    }

    let root = match segments[0] {
        "input" => {
            segments.remove(0);
            input.clone()
        }
        "artifacts" => {
            segments.remove(0);
            artifacts.clone()
        }
        "context" => {
            // "dropped; remainder is resolved as above" — i.e. treat the
            // rest as an artifacts lookup.
            segments.remove(0);
            artifacts.clone()
        }
        _ => artifacts.clone(),
    };

    walk(&root, &segments)
}

fn walk(root: &Value, segments: &[&str]) -> Value {
    let mut current = root.clone();
    for seg in segments {
        current = match current.get(*seg) {
            Some(v) => v.clone(),
            None => return undefined(),
        };
    }
    current
}

fn undefined() -> Value {
    Value::String("undefined".to_string())
}

/// Returns `true` if `s` is a single, full `${...}` token with nothing else
/// around it (case (a) of the input-map resolution rules).
fn is_pure_token(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1
}

/// Stringifies a resolved [`Value`] for textual substitution inside a
/// larger string or a condition, so numbers/booleans/strings all compare
/// naturally once substituted.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Resolves every `${path}` occurrence inside `s` against the context,
/// replacing each with its stringified value. Non-template strings are
/// returned unchanged (`resolve_string(s, c) == s` for any non-template
/// `s`, per §8's resolver laws).
pub fn resolve_string(s: &str, input: &Value, artifacts: &Value) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                let resolved = resolve_path(path, input, artifacts);
                out.push_str(&stringify(&resolved));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated token: emit verbatim and stop scanning.
                out.push_str("${");
                rest = after;
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolves a single templated value per §4.1's input-map rules:
/// - a full `${...}` token resolves to the referenced value (preserving its
///   JSON type, not just a string),
/// - any other string is substring-substituted and passed through as a
///   string,
/// - arrays pass through unchanged,
/// - nested objects resolve recursively.
pub fn resolve_value(value: &Value, input: &Value, artifacts: &Value) -> Value {
    match value {
        Value::String(s) if is_pure_token(s) => {
            let path = &s[2..s.len() - 1];
            resolve_path(path, input, artifacts)
        }
        Value::String(s) => Value::String(resolve_string(s, input, artifacts)),
        Value::Array(_) => value.clone(),
        Value::Object(map) => {
            let resolved = map
                .iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, input, artifacts)))
                .collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// Resolves an input-template mapping into a concrete mapping, per §4.1.
pub fn resolve_input_map(
    map: &serde_json::Map<String, Value>,
    input: &Value,
    artifacts: &Value,
) -> serde_json::Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, input, artifacts)))
        .collect()
}

// ---------------------------------------------------------------------
// Restricted boolean condition evaluator
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Op(CmpOp),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    literal.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Literal(literal));
            }
            _ => {
                let start = i;
                while i < chars.len() && !is_boundary(chars[i]) {
                    i += 1;
                }
                if i == start {
                    return Err(format!("unexpected character '{c}'"));
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(word.trim().to_string()));
            }
        }
    }
    Ok(tokens)
}

fn is_boundary(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '(' | ')' | '&' | '|' | '!' | '=' | '<' | '>')
}

/// Recursive-descent parser over: `||` (lowest), `&&`, unary `!`, comparison,
/// and parenthesized/literal atoms (highest). Grammar is intentionally tiny
/// and total — any malformed input is a parse error, never a panic.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<bool, String> {
        let mut value = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<bool, String> {
        let mut value = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<bool, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let value = self.parse_unary()?;
            return Ok(!value);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<bool, String> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.advance();
            let value = self.parse_or()?;
            match self.advance() {
                Some(Token::RParen) => return Ok(value),
                _ => return Err("expected closing parenthesis".to_string()),
            }
        }

        let lhs = self.parse_literal()?;

        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.advance();
                let rhs = self.parse_literal()?;
                Ok(compare(&lhs, op, &rhs))
            }
            _ => {
                // Bare literal: "true"/"false" evaluate directly; anything
                // else is truthy if non-empty and not "0"/"false".
                Ok(truthy(&lhs))
            }
        }
    }

    fn parse_literal(&mut self) -> Result<String, String> {
        if matches!(self.peek(), Some(Token::LParen)) {
            return Err("expected a value, found '('".to_string());
        }
        match self.advance() {
            Some(Token::Literal(s)) => Ok(s.clone()),
            other => Err(format!("expected a literal, found {other:?}")),
        }
    }
}

fn truthy(s: &str) -> bool {
    !matches!(s, "" | "0" | "false" | "null" | "undefined")
}

fn compare(lhs: &str, op: CmpOp, rhs: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Ge => a >= b,
            CmpOp::Gt => a > b,
        };
    }
    match op {
        CmpOp::Lt => lhs < rhs,
        CmpOp::Le => lhs <= rhs,
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        CmpOp::Ge => lhs >= rhs,
        CmpOp::Gt => lhs > rhs,
    }
}

/// Evaluates a boolean condition: `${...}` references are substituted with
/// their textual form first, then the result is parsed under the
/// restricted grammar. Every failure mode (unresolved reference, syntax
/// error, type mismatch) yields `false`, never a panic or exception —
/// condition evaluation is total (§8).
pub fn evaluate_condition(condition: &str, input: &Value, artifacts: &Value) -> bool {
    let substituted = resolve_string(condition, input, artifacts);
    match tokenize(&substituted) {
        Ok(tokens) => {
            let mut parser = Parser::new(&tokens);
            match parser.parse_or() {
                Ok(value) if parser.pos == tokens.len() => value,
                Ok(_) => {
                    debug!(condition = %substituted, "trailing tokens after condition parse");
                    false
                }
                Err(err) => {
                    debug!(condition = %substituted, error = %err, "condition parse failed");
                    false
                }
            }
        }
        Err(err) => {
            debug!(condition = %substituted, error = %err, "condition tokenize failed");
            false
        }
    }
}
