use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

/// YAML block the model appends after the narration.
pub type Validation = Map<String, Value>;

static VALIDATION_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)---VALIDATION---\n(.*)$").unwrap());
static ANY_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)---\n(.*)$").unwrap());
static LEADING_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*```(?:yaml|yml)?\s*").unwrap());
static TRAILING_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*```\s*$").unwrap());
static INNER_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)```(?:yaml|yml)?\s*(.*?)\s*```").unwrap());

const TRUTHY: [&str; 3] = ["yes", "true", "1"];

/// Narration part of a reply: everything before the first `---`.
pub fn extract_narration(text: &str) -> String {
    match text.split_once("---") {
        Some((head, _)) => head.trim().to_string(),
        None => text.trim().to_string(),
    }
}

pub fn strip_code_fences(s: &str) -> String {
    let s = LEADING_FENCE.replace(s, "");
    let s = TRAILING_FENCE.replace(&s, "");
    INNER_FENCE.replace_all(&s, "$1").trim().to_string()
}

/// Parses the YAML validation block. Anything but a mapping gives `None`.
pub fn parse_validation(text: &str) -> Option<Validation> {
    let caps = VALIDATION_BLOCK.captures(text).or_else(|| ANY_BLOCK.captures(text))?;
    let yaml = caps[1].trim();
    if yaml.is_empty() {
        return None;
    }
    let yaml = strip_code_fences(yaml);
    match serde_yaml::from_str::<Value>(&yaml) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            let snippet: String = yaml.chars().take(400).collect();
            warn!("could not parse validation block: {}; snippet={}", e, snippet);
            None
        }
    }
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

fn flag_value(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.trim().to_lowercase(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string().to_lowercase(),
    }
}

/// Word count window and the hook/handoff flags. Returns the issue list; empty means pass.
pub fn check_requirements(text: &str, validation: Option<&Validation>, target: u32, tolerance_percent: u32) -> Vec<String> {
    let mut issues = Vec::new();
    let wc = count_words(text);
    let tol = tolerance_percent as f64 / 100.0;
    let min = (target as f64 * (1.0 - tol)).floor() as usize;
    let max = (target as f64 * (1.0 + tol)).floor() as usize;
    if wc < min {
        issues.push(format!("too short ({wc} words, minimum {min})"));
    } else if wc > max {
        issues.push(format!("too long ({wc} words, maximum {max})"));
    }

    if let Some(v) = validation.filter(|v| !v.is_empty()) {
        if !TRUTHY.contains(&flag_value(v.get("opening_hook_present")).as_str()) {
            issues.push("missing opening hook".to_string());
        }
        if !TRUTHY.contains(&flag_value(v.get("closing_handoff_present")).as_str()) {
            issues.push("missing closing handoff".to_string());
        }
    }
    issues
}
