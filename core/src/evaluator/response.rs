use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::EvaluationError;

const ERROR_MARKER: &str = "error:";
const LOCK_FILE_MESSAGE: &str = "requires lock file changes but they're not allowed";

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid ansi regex")
    })
}

fn escaped_dollar_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^\\])\\\$").expect("valid dollar regex"))
}

pub fn strip_ansi(s: &str) -> String {
    ansi_re().replace_all(s, "").into_owned()
}

/// The evaluator's JSON serialiser emits `\$`, which is not a valid JSON escape.
fn repair(s: &str) -> String {
    escaped_dollar_re().replace_all(s, "${1}$$").into_owned()
}

fn from_json(s: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(&repair(s))
}

/// Decodes a raw response: JSON, possibly JSON-encoded twice; otherwise the raw text.
pub fn parse_response(raw: &str) -> Option<Value> {
    let text = strip_ansi(raw);
    let value = match from_json(&text) {
        Ok(Value::String(inner)) => from_json(&inner).unwrap_or(Value::String(inner)),
        Ok(v) => v,
        Err(_) => Value::String(text),
    };
    match value {
        Value::String(s) if s.trim().is_empty() => None,
        Value::Null => None,
        v => Some(v),
    }
}

/// Turns a response plus the diagnostic text seen during the request into a result.
pub fn classify_response(
    value: Option<Value>,
    diagnostics: &str,
) -> Result<Option<Value>, EvaluationError> {
    let diag = strip_ansi(diagnostics);
    let trimmed = diag.trim();
    let blocking = trimmed.starts_with(ERROR_MARKER) || trimmed.contains(LOCK_FILE_MESSAGE);

    if !trimmed.is_empty() {
        if blocking && value.is_none() {
            return Err(EvaluationError::Diagnostic(trimmed.to_string()));
        }
        tracing::debug!(target: "nixtask.evaluator", diagnostics = %trimmed, "evaluator diagnostics");
    }
    Ok(value)
}
