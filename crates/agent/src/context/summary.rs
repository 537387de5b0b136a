//! Extractive summaries for collapsed tool output.
//!
//! Keeps what the model most likely needs later: paths it touched, counts
//! it reported and, when something went wrong, the error line.

use regex::Regex;
use std::sync::OnceLock;

/// Prefix marking collapsed tool content.
pub const COLLAPSED_PREFIX: &str = "[collapsed]";

const MAX_PATHS: usize = 5;
const MAX_COUNTS: usize = 4;
const ERROR_WINDOW: usize = 100;
const ERROR_LINE_CHARS: usize = 200;
const FIRST_LINE_CHARS: usize = 150;

static PATH_RE: OnceLock<Option<Regex>> = OnceLock::new();
static COUNT_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn path_re() -> Option<&'static Regex> {
    PATH_RE
        .get_or_init(|| Regex::new(r"(?:[A-Za-z]:)?(?:/[\w.\-]+){2,}/?").ok())
        .as_ref()
}

fn count_re() -> Option<&'static Regex> {
    COUNT_RE
        .get_or_init(|| {
            Regex::new(
                r"(?i)\b\d+\s+(?:nodes?|items?|files?|errors?|warnings?|lines?|points?|matches|results?|entries|rows?)\b|\b(?:count|total)\s*[:=]?\s*\d+",
            )
            .ok()
        })
        .as_ref()
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn unique_matches(re: Option<&Regex>, text: &str, limit: usize) -> Vec<String> {
    let Some(re) = re else {
        return Vec::new();
    };
    let mut found: Vec<String> = Vec::new();
    for m in re.find_iter(text) {
        let s = m.as_str().trim().to_string();
        if !found.contains(&s) {
            found.push(s);
            if found.len() == limit {
                break;
            }
        }
    }
    found
}

/// Summarize tool output in at most `max_chars` characters (before the prefix).
pub fn summarize_tool_output(content: &str, max_chars: usize) -> String {
    let mut parts = Vec::new();

    let paths = unique_matches(path_re(), content, MAX_PATHS);
    if !paths.is_empty() {
        parts.push(format!("paths: {}", paths.join(", ")));
    }
    let counts = unique_matches(count_re(), content, MAX_COUNTS);
    if !counts.is_empty() {
        parts.push(format!("counts: {}", counts.join(", ")));
    }

    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let head = take_chars(content, ERROR_WINDOW).to_lowercase();
    if head.contains("error") || head.contains("failed") {
        parts.push(take_chars(first_line, ERROR_LINE_CHARS));
    } else if parts.is_empty() {
        parts.push(take_chars(first_line, FIRST_LINE_CHARS));
    }

    let summary = take_chars(&parts.join(" | "), max_chars);
    format!("{COLLAPSED_PREFIX} {summary}")
}
