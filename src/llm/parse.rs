//! Tolerant parsing of model output.
//!
//! Models wrap JSON in fences, prepend prose, or double-wrap objects; the
//! helpers here salvage the payload before typed deserialization.

use crate::util::cached_regex;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Truncate a string for display (Unicode-safe)
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}

/// Sanitize API response content for error messages to prevent credential leakage.
pub fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }
    truncated.to_string()
}

/// Remove a surrounding markdown fence (with or without a language tag).
/// Text without a leading fence is returned trimmed.
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(without_open) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let after_header = match without_open.find('\n') {
        Some(newline_idx) => &without_open[newline_idx + 1..],
        None => without_open,
    };
    let body = match after_header.rfind("```") {
        Some(end_idx) => &after_header[..end_idx],
        None => after_header,
    };
    body.trim_matches('\n').trim_end().to_string()
}

fn push_unique_candidate(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn unwrap_outer_wrapper(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.len() < 3 || !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let inner = &trimmed[1..trimmed.len() - 1];
    let inner_trimmed = inner.trim_start();
    (inner_trimmed.starts_with('{') || inner_trimmed.starts_with('['))
        .then(|| inner.trim().to_string())
}

fn extract_balanced_json_from(content: &str, start: usize) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(content[start..end].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_candidates(content: &str, max_candidates: usize) -> Vec<String> {
    let mut out = Vec::new();
    for (idx, ch) in content.char_indices() {
        if out.len() >= max_candidates {
            break;
        }
        if ch == '{' || ch == '[' {
            if let Some(candidate) = extract_balanced_json_from(content, idx) {
                push_unique_candidate(&mut out, candidate);
            }
        }
    }
    out
}

/// Replace typographic quotes and drop stray control characters.
fn fix_json_issues(json: &str) -> String {
    json.replace(",]", "]")
        .replace(",}", "}")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Parse a typed value out of a model response, trying the raw text, the
/// fence-stripped text, every balanced JSON fragment, and unwrapped
/// double-braced objects, in that order.
pub fn parse_structured_content<T>(content: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut candidates = Vec::new();
    push_unique_candidate(&mut candidates, content);
    push_unique_candidate(&mut candidates, strip_code_fences(content));

    let mut idx = 0usize;
    while idx < candidates.len() && idx < 16 {
        let current = candidates[idx].clone();
        for extracted in extract_json_candidates(&current, 4) {
            push_unique_candidate(&mut candidates, extracted);
        }
        if let Some(unwrapped) = unwrap_outer_wrapper(&current) {
            push_unique_candidate(&mut candidates, unwrapped);
        }
        push_unique_candidate(&mut candidates, fix_json_issues(&current));
        idx += 1;
    }

    let mut last_err: Option<String> = None;
    for candidate in candidates {
        match serde_json::from_str::<T>(&candidate) {
            Ok(data) => return Ok(data),
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    Err(anyhow::anyhow!(
        "Failed to parse structured response: {}\nContent: {}",
        last_err.unwrap_or_else(|| "unknown parse error".to_string()),
        sanitize_api_response(content)
    ))
}

/// The first JSON object in a response, as an untyped value.
pub fn parse_json_object(content: &str) -> anyhow::Result<Value> {
    let value: Value = parse_structured_content(content)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(anyhow::anyhow!("Expected a JSON object, got {}", value))
    }
}

/// One file from a multi-file generation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

fn file_marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"^(?://|#|---|===)\s*FILE:\s*(\S+?)\s*(?:---|===)?\s*$",
    )
}

/// Split a response delimited by `// FILE: path` (or `=== FILE: path ===`)
/// markers. Returns an empty list when no markers are present.
pub fn parse_file_blocks(response: &str) -> Vec<FileBlock> {
    let Some(re) = file_marker_regex() else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in response.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            if let Some((path, body)) = current.take() {
                blocks.push(FileBlock {
                    path,
                    content: strip_code_fences(&body.join("\n")),
                });
            }
            let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            current = Some((crate::util::normalize_rel_path(path), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((path, body)) = current {
        blocks.push(FileBlock {
            path,
            content: strip_code_fences(&body.join("\n")),
        });
    }

    blocks.retain(|b| !b.path.is_empty() && !b.content.trim().is_empty());
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct ParseProbe {
        description: String,
    }

    #[test]
    fn test_parse_structured_content_handles_extra_wrapper_braces() {
        let malformed = "{\n {\"description\":\"hello\"}\n}";
        let parsed: ParseProbe = parse_structured_content(malformed).unwrap();
        assert_eq!(parsed.description, "hello");
    }

    #[test]
    fn test_parse_structured_content_handles_markdown_fences() {
        let fenced = "```json\n{\"description\":\"hello\"}\n```";
        let parsed: ParseProbe = parse_structured_content(fenced).unwrap();
        assert_eq!(parsed.description, "hello");
    }

    #[test]
    fn test_parse_structured_content_skips_leading_prose() {
        let noisy = "Sure! Here is the plan:\n{\"description\":\"a {brace} in text\"} hope it helps";
        let parsed: ParseProbe = parse_structured_content(noisy).unwrap();
        assert_eq!(parsed.description, "a {brace} in text");
    }

    #[test]
    fn test_parse_json_object_rejects_non_json() {
        assert!(parse_json_object("I cannot help with that").is_err());
    }

    #[test]
    fn test_sanitize_redacts_keys() {
        let out = sanitize_api_response("invalid key sk-or-v1-abcdef");
        assert!(out.contains("redacted"));
        assert_eq!(sanitize_api_response("model overloaded"), "model overloaded");
    }

    #[test]
    fn test_strip_code_fences_with_language_tag() {
        assert_eq!(strip_code_fences("```tsx\nconst a = 1;\n```"), "const a = 1;");
        assert_eq!(strip_code_fences("  plain  "), "plain");
    }

    #[test]
    fn test_parse_file_blocks() {
        let response = "// FILE: src/components/Card.tsx\n```tsx\nexport const Card = () => null;\n```\n=== FILE: ./src/types.ts ===\nexport type Id = string;\n";
        let blocks = parse_file_blocks(response);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path, "src/components/Card.tsx");
        assert_eq!(blocks[0].content, "export const Card = () => null;");
        assert_eq!(blocks[1].path, "src/types.ts");
        assert!(parse_file_blocks("export const x = 1;").is_empty());
    }
}
