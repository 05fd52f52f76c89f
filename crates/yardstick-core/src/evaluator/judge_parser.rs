//! Extracts a structured verdict from a judge agent's free-form output.
//!
//! Agents wrap JSON in prose, in markdown fences, or print several
//! JSON-looking fragments before the final answer. Parsing runs an ordered
//! list of pure strategies and returns the first candidate that validates:
//!
//! 1. contents of a fenced code block
//! 2. the first object anywhere that has all required keys, in any order
//! 3. the whole trimmed output
//! 4. the span from the last `}` back to its matching `{`
//! 5. every balanced fragment mentioning all required keys, last first
//!
//! Strategies 2 and 5 try at most [`MAX_CANDIDATES`] opening braces each,
//! so noisy output stays linear in its length.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Characters of raw output kept in parse-failure messages.
pub const PREVIEW_CHARS: usize = 500;

/// Opening braces tried per scanning strategy.
pub const MAX_CANDIDATES: usize = 256;

const REQUIRED_KEYS: [&str; 3] = ["status", "metrics", "message"];

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid regex"));

static OBJECT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*""#).expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStatus {
    Passed,
    Failed,
}

/// Optional supporting detail a judge may attach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_examined: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns_found: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A structurally valid verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub status: JudgeStatus,
    pub metrics: Map<String, Value>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

type Strategy = fn(&str) -> Option<JudgeVerdict>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("fenced-block", from_fenced_block),
    ("keyed-object", from_keyed_object),
    ("whole-output", from_whole_output),
    ("last-object", from_last_object),
    ("last-valid-fragment", from_last_valid_fragment),
];

/// Parse a verdict out of `text`. `Err` carries a truncated preview of the
/// input for diagnosis.
pub fn parse_verdict(text: &str) -> Result<JudgeVerdict, String> {
    for (name, strategy) in STRATEGIES {
        if let Some(verdict) = strategy(text) {
            debug!(strategy = name, "parsed judge verdict");
            return Ok(verdict);
        }
    }
    Err(format!(
        "no valid verdict (status/metrics/message) found in judge output: {}",
        preview(text)
    ))
}

/// Check one JSON value against the required shape.
pub fn validate(value: &Value) -> Result<JudgeVerdict, String> {
    let obj = value.as_object().ok_or("verdict is not a JSON object")?;

    let status = match obj.get("status").and_then(Value::as_str) {
        Some("passed") => JudgeStatus::Passed,
        Some("failed") => JudgeStatus::Failed,
        Some(other) => return Err(format!("status must be \"passed\" or \"failed\", got {other:?}")),
        None => return Err("missing string field `status`".to_string()),
    };
    let metrics = obj
        .get("metrics")
        .and_then(Value::as_object)
        .ok_or("`metrics` must be an object")?
        .clone();
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .ok_or("`message` must be a string")?
        .to_string();

    Ok(JudgeVerdict {
        status,
        metrics,
        message,
        evidence: obj.get("evidence").and_then(parse_evidence),
    })
}

/// Evidence is advisory, so malformed parts are dropped rather than
/// invalidating the verdict.
fn parse_evidence(value: &Value) -> Option<Evidence> {
    let obj = value.as_object()?;
    let strings = |key: &str| -> Vec<String> {
        match obj.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    };
    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    Some(Evidence {
        files_examined: strings("files_examined"),
        patterns_found: strings("patterns_found"),
        reasoning: obj.get("reasoning").and_then(Value::as_str).map(str::to_string),
        confidence,
    })
}

fn try_json(candidate: &str) -> Option<JudgeVerdict> {
    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    validate(&value).ok()
}

fn has_required_keys(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| REQUIRED_KEYS.iter().all(|key| obj.contains_key(*key)))
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn from_fenced_block(text: &str) -> Option<JudgeVerdict> {
    FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .find_map(|m| try_json(m.as_str()))
}

fn from_keyed_object(text: &str) -> Option<JudgeVerdict> {
    OBJECT_START
        .find_iter(text)
        .take(MAX_CANDIDATES)
        .find_map(|m| {
            let end = balanced_end(text, m.start())?;
            let value: Value = serde_json::from_str(&text[m.start()..=end]).ok()?;
            if !has_required_keys(&value) {
                return None;
            }
            validate(&value).ok()
        })
}

fn from_whole_output(text: &str) -> Option<JudgeVerdict> {
    try_json(text)
}

fn from_last_object(text: &str) -> Option<JudgeVerdict> {
    let last_close = text.rfind('}')?;
    let start = balanced_start(text, last_close)?;
    try_json(&text[start..=last_close])
}

fn from_last_valid_fragment(text: &str) -> Option<JudgeVerdict> {
    let starts: Vec<usize> = text.match_indices('{').map(|(i, _)| i).collect();
    starts
        .iter()
        .rev()
        .take(MAX_CANDIDATES)
        .filter_map(|&start| balanced_end(text, start).map(|end| &text[start..=end]))
        .filter(|fragment| REQUIRED_KEYS.iter().all(|key| fragment.contains(key)))
        .find_map(try_json)
}

/// Byte index of the `}` that closes the `{` at `start`, honouring JSON
/// string literals and escapes.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Byte index of the `{` that opens the `}` at `end`, scanning backward
/// once. A `"` counts as a string delimiter unless an odd run of
/// backslashes precedes it.
fn balanced_start(text: &str, end: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(end) != Some(&b'}') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    for i in (0..=end).rev() {
        let b = bytes[i];
        if b == b'"' {
            let backslashes = bytes[..i].iter().rev().take_while(|&&c| c == b'\\').count();
            if backslashes % 2 == 0 {
                in_string = !in_string;
            }
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'}' => depth += 1,
            b'{' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// First [`PREVIEW_CHARS`] characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
