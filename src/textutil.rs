use once_cell::sync::Lazy;
use regex::Regex;

use crate::ir::BlockKind;

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
static FENCE_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^```[a-z0-9_-]*\s*").expect("fence open regex"));
static FENCE_CLOSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```\s*$").expect("fence close regex"));

const ARTIFACT_MARKERS: [&str; 11] = [
    "svg", "path d=", "base64", "<style", "viewbox", "xmlns", "{", "}", "fill=", "stroke=",
    "@font-face",
];

/// Collapses every whitespace run (including NBSP) into one space and trims.
pub fn normalize_ws(text: &str) -> String {
    let replaced = text.replace('\u{a0}', " ");
    WS_RE.replace_all(replaced.trim(), " ").into_owned()
}

#[must_use]
pub fn letter_count(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphabetic()).count()
}

fn is_all_caps(text: &str) -> bool {
    let mut has_upper = false;
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        if c.is_lowercase() {
            return false;
        }
        has_upper = true;
    }
    has_upper
}

/// Decides whether an extracted block is prose worth sending to the translator.
pub fn is_translatable_block(text: &str, kind: BlockKind) -> bool {
    let lowered = text.to_lowercase();
    if ARTIFACT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return false;
    }
    let letters = letter_count(text);
    if kind.is_heading() {
        return letters >= 3;
    }
    if is_all_caps(text) && letters >= 3 {
        return true;
    }
    letters >= 5
}

/// Strips markdown code fences some models wrap around their answer.
pub fn cleanup_model_text(raw: &str) -> String {
    let s = raw.trim();
    if !s.starts_with("```") {
        return s.to_string();
    }
    let s = FENCE_OPEN_RE.replace(s, "");
    FENCE_CLOSE_RE.replace(&s, "").trim().to_string()
}

/// Returns the outermost JSON array or object found in a model reply.
pub fn extract_json_text(raw: &str) -> Option<&str> {
    let start = raw.find(['[', '{'])?;
    let close = match raw.as_bytes()[start] {
        b'[' => ']',
        _ => '}',
    };
    let end = raw.rfind(close)?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

/// Cuts `text` to at most `max_chars` characters, never splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
