// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt security utilities shared by the agents.
//!
//! User content is wrapped in fixed literal sentinels plus a short
//! content hash the model is asked to echo back, which makes prompt
//! injection attempts that try to escape the delimited block detectable.
//! The JSON helpers recover the first balanced object from free-form
//! model output and repair LaTeX backslashes (`\sum`, `\frac`, …) into
//! valid JSON escapes before parsing.

use sha2::{Digest, Sha256};

/// Fixed literal sentinels around user-supplied content.
#[derive(Debug, Clone, Copy)]
pub struct Separators {
    pub start: &'static str,
    pub end: &'static str,
    pub content: &'static str,
}

pub const SEPARATORS: Separators = Separators {
    start: "===프롬프트시작===",
    end: "===프롬프트종료===",
    content: "---내용---",
};

/// Short hex digest over the sentinel pair, echoed by the model as an
/// integrity check.
pub fn separator_hash(separators: &Separators) -> String {
    let mut hasher = Sha256::new();
    hasher.update(separators.start.as_bytes());
    hasher.update(separators.end.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Strip markup and collapse whitespace in user text before it enters a
/// prompt.
pub fn sanitize_text(text: &str) -> String {
    let no_tags = regex::Regex::new(r"<[^>]+>").unwrap().replace_all(text, "");
    let no_quotes = regex::Regex::new(r#"[<>"']"#).unwrap().replace_all(&no_tags, "");
    let collapsed = regex::Regex::new(r"\s+").unwrap().replace_all(&no_quotes, " ");
    collapsed.trim().to_string()
}

/// Extract the first JSON object from a model reply.
///
/// Prefers a fenced ```json block; otherwise scans for the first
/// balanced `{…}` span.  The result has LaTeX backslashes repaired so
/// `\sum`, `\int` etc. survive `serde_json` parsing.
pub fn extract_json(content: &str) -> Option<String> {
    if content.is_empty() {
        return None;
    }

    let fenced = regex::Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
    let mut json = if let Some(caps) = fenced.captures(content) {
        caps[1].to_string()
    } else {
        let candidate = first_balanced_object(content)?;
        // Models occasionally double the braces; collapse runs.
        let cleaned = candidate.replace("{{", "{").replace("}}", "}");
        let cleaned = regex::Regex::new(r"\{+").unwrap().replace_all(&cleaned, "{");
        regex::Regex::new(r"\}+")
            .unwrap()
            .replace_all(&cleaned, "}")
            .to_string()
    };

    json = repair_latex_escapes(&json);
    Some(json)
}

fn first_balanced_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in content[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Escape every backslash that does not begin a valid JSON escape
/// sequence (`\" \\ \/ \b \f \n \r \t \uXXXX`).
pub fn repair_latex_escapes(json: &str) -> String {
    regex::Regex::new(r#"\\(?P<c>[^"\\/bfnrtu])"#)
        .unwrap()
        .replace_all(json, r"\\$c")
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_hash_is_stable_eight_hex_chars() {
        let a = separator_hash(&SEPARATORS);
        let b = separator_hash(&SEPARATORS);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sanitize_strips_tags_and_quotes() {
        let s = sanitize_text("<b>x\" + 'y'</b>   =  z");
        assert_eq!(s, "x + y = z");
    }

    #[test]
    fn extract_json_prefers_fenced_block() {
        let reply = "생각해 보면...\n```json\n{\"quality\": \"answerable\"}\n```\n끝";
        let json = extract_json(reply).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["quality"], "answerable");
    }

    #[test]
    fn extract_json_finds_balanced_object_in_prose() {
        let reply = r#"분류 결과는 {"knowledge_code": "K2", "nested": {"a": 1}} 입니다"#;
        let json = extract_json(reply).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["knowledge_code"], "K2");
        assert_eq!(v["nested"]["a"], 1);
    }

    #[test]
    fn extract_json_none_when_no_object() {
        assert!(extract_json("그냥 텍스트").is_none());
        assert!(extract_json("").is_none());
    }

    #[test]
    fn latex_backslashes_survive_parsing() {
        let reply = r#"{"reasoning": "합은 \sum_{i=1}^n i 이다"}"#;
        let json = extract_json(reply).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(v["reasoning"].as_str().unwrap().contains("sum"));
    }

    #[test]
    fn valid_json_escapes_are_untouched() {
        let input = r#"{"a": "line\nbreak \"quoted\" é"}"#;
        let repaired = repair_latex_escapes(input);
        assert_eq!(repaired, input);
        assert!(serde_json::from_str::<serde_json::Value>(&repaired).is_ok());
    }

    #[test]
    fn doubled_braces_are_collapsed() {
        let reply = r#"{{"quality": "answerable"}}"#;
        let json = extract_json(reply).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&json).is_ok());
    }
}
