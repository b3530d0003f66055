//! Line-numbered edit application
//!
//! The pure half of the patch engine: parsing model-emitted edit lists,
//! splicing imports, applying positional edits bottom-up, and cleaning up
//! full-file rewrites. The LLM calls live in `engine::patcher`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One positional edit against a 1-indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineEdit {
    Replace {
        #[serde(rename = "startLine", alias = "start_line")]
        start_line: usize,
        #[serde(rename = "endLine", alias = "end_line")]
        end_line: usize,
        #[serde(rename = "newCode", alias = "new_code", default)]
        new_code: String,
    },
    InsertAfter {
        #[serde(rename = "afterLine", alias = "after_line")]
        after_line: usize,
        #[serde(rename = "newCode", alias = "new_code", default)]
        new_code: String,
    },
    Delete {
        #[serde(rename = "startLine", alias = "start_line")]
        start_line: usize,
        #[serde(rename = "endLine", alias = "end_line")]
        end_line: usize,
    },
}

impl LineEdit {
    /// Descending sort key. An insert after line `n` sits between `n` and
    /// `n + 1`, so it orders above a range starting at `n`.
    fn sort_key(&self) -> usize {
        match self {
            LineEdit::Replace { start_line, .. } | LineEdit::Delete { start_line, .. } => {
                start_line * 2
            }
            LineEdit::InsertAfter { after_line, .. } => after_line * 2 + 1,
        }
    }

    fn shifted(&self, from_line: usize, by: usize) -> LineEdit {
        let shift = |line: usize| if line > from_line { line + by } else { line };
        match self {
            LineEdit::Replace {
                start_line,
                end_line,
                new_code,
            } => LineEdit::Replace {
                start_line: shift(*start_line),
                end_line: shift(*end_line),
                new_code: new_code.clone(),
            },
            LineEdit::InsertAfter {
                after_line,
                new_code,
            } => LineEdit::InsertAfter {
                after_line: shift(*after_line),
                new_code: new_code.clone(),
            },
            LineEdit::Delete {
                start_line,
                end_line,
            } => LineEdit::Delete {
                start_line: shift(*start_line),
                end_line: shift(*end_line),
            },
        }
    }
}

/// A parsed edit response: positional edits plus imports to add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditSet {
    pub edits: Vec<LineEdit>,
    pub imports: Vec<String>,
    /// Entries in the response that did not parse as an edit.
    pub rejected: usize,
}

impl EditSet {
    /// Build from the JSON value of an edit response. Entries that do not
    /// match the edit schema are counted and dropped.
    pub fn from_value(value: &Value) -> Self {
        let raw_edits = value
            .get("edits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut edits = Vec::with_capacity(raw_edits.len());
        let mut rejected = 0;
        for raw in raw_edits {
            match serde_json::from_value::<LineEdit>(raw) {
                Ok(edit) => edits.push(edit),
                Err(_) => rejected += 1,
            }
        }

        let imports = match value.get("imports") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .flat_map(str::lines)
                .map(str::to_string)
                .collect(),
            Some(Value::String(block)) => block.lines().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        let imports = imports
            .into_iter()
            .filter(|l: &String| !l.trim().is_empty())
            .collect();

        Self {
            edits,
            imports,
            rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub content: String,
    pub applied: usize,
    pub skipped: usize,
    pub imports_added: usize,
}

fn is_import_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("import ")
        || trimmed.starts_with("import{")
        || (trimmed.starts_with("const ") && trimmed.contains("require("))
}

/// Render file content with 1-indexed line numbers for edit prompts.
pub fn number_lines(content: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:4}| {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply an edit set to `content`.
///
/// Imports are spliced once after the last existing import (or at the top).
/// Positional edits are then applied in descending line order; an edit that
/// is out of range or overlaps a region already edited is skipped.
pub fn apply_edits(content: &str, set: &EditSet) -> PatchOutcome {
    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    let new_imports: Vec<String> = set
        .imports
        .iter()
        .filter(|imp| !lines.iter().any(|l| l.trim() == imp.trim()))
        .cloned()
        .collect();
    let imports_added = new_imports.len();

    let mut edits: Vec<LineEdit> = set.edits.clone();
    if imports_added > 0 {
        let insert_at = lines
            .iter()
            .rposition(|l| is_import_line(l))
            .map(|i| i + 1)
            .unwrap_or(0);
        lines.splice(insert_at..insert_at, new_imports);
        edits = edits
            .iter()
            .map(|e| e.shifted(insert_at, imports_added))
            .collect();
    }

    // Ties go to the later edit first, so same-line inserts keep list order.
    let mut ordered: Vec<(usize, LineEdit)> = edits.into_iter().enumerate().collect();
    ordered.sort_by_key(|(i, e)| std::cmp::Reverse((e.sort_key(), *i)));

    let mut floor = lines.len() + 1;
    let mut applied = 0;
    let mut skipped = 0;

    for (_, edit) in &ordered {
        let len = lines.len();
        match edit {
            LineEdit::Replace {
                start_line,
                end_line,
                new_code,
            } => {
                let (s, e) = (*start_line, *end_line);
                if s == 0 || s > e || e > len || e >= floor {
                    skipped += 1;
                    continue;
                }
                let replacement: Vec<String> = new_code.lines().map(str::to_string).collect();
                lines.splice(s - 1..e, replacement);
                floor = s;
            }
            LineEdit::Delete {
                start_line,
                end_line,
            } => {
                let (s, e) = (*start_line, *end_line);
                if s == 0 || s > e || e > len || e >= floor {
                    skipped += 1;
                    continue;
                }
                lines.drain(s - 1..e);
                floor = s;
            }
            LineEdit::InsertAfter {
                after_line,
                new_code,
            } => {
                let a = *after_line;
                if a > len || a >= floor {
                    skipped += 1;
                    continue;
                }
                let inserted: Vec<String> = new_code.lines().map(str::to_string).collect();
                lines.splice(a..a, inserted);
                floor = a + 1;
            }
        }
        applied += 1;
    }

    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }

    PatchOutcome {
        content: out,
        applied,
        skipped,
        imports_added,
    }
}

/// Clean a full-file rewrite: strip fences and, when the model echoed the
/// file twice, cut everything from the second copy of the first top-level
/// export signature.
pub fn dedup_rewrite(raw: &str) -> String {
    let body = crate::llm::parse::strip_code_fences(raw);
    let lines: Vec<&str> = body.lines().collect();

    let first_export = lines.iter().position(|l| l.starts_with("export "));
    let cut = first_export.and_then(|first| {
        let signature = lines[first].trim_end();
        lines
            .iter()
            .skip(first + 1)
            .position(|l| l.trim_end() == signature)
            .map(|offset| first + 1 + offset)
    });

    let kept = match cut {
        Some(idx) => &lines[..idx],
        None => &lines[..],
    };
    let mut out = kept.join("\n").trim_end().to_string();
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ten_lines() -> String {
        (1..=10)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn fixture_edits() -> EditSet {
        EditSet {
            edits: vec![
                LineEdit::Replace {
                    start_line: 3,
                    end_line: 4,
                    new_code: "merged 3-4".to_string(),
                },
                LineEdit::InsertAfter {
                    after_line: 10,
                    new_code: "tail a\ntail b".to_string(),
                },
            ],
            ..EditSet::default()
        }
    }

    #[test]
    fn test_fixture_edits_yield_eleven_lines() {
        let outcome = apply_edits(&ten_lines(), &fixture_edits());
        let lines: Vec<&str> = outcome.content.lines().collect();
        assert_eq!(outcome.applied, 2);
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[2], "merged 3-4");
        assert_eq!(lines[3], "line 5");
        assert_eq!(lines[9], "tail a");
        assert_eq!(lines[10], "tail b");
    }

    #[test]
    fn test_applying_same_edits_twice_is_deterministic() {
        let source = ten_lines();
        let first = apply_edits(&source, &fixture_edits());
        let second = apply_edits(&source, &fixture_edits());
        assert_eq!(first, second);
    }

    #[test]
    fn test_insert_after_zero_goes_to_top() {
        let set = EditSet {
            edits: vec![LineEdit::InsertAfter {
                after_line: 0,
                new_code: "'use client';".to_string(),
            }],
            ..EditSet::default()
        };
        let outcome = apply_edits("a\nb\n", &set);
        assert_eq!(outcome.content, "'use client';\na\nb\n");
    }

    #[test]
    fn test_same_line_inserts_keep_list_order() {
        let set = EditSet {
            edits: vec![
                LineEdit::InsertAfter {
                    after_line: 1,
                    new_code: "A".to_string(),
                },
                LineEdit::InsertAfter {
                    after_line: 1,
                    new_code: "B".to_string(),
                },
            ],
            ..EditSet::default()
        };
        let outcome = apply_edits("x\ny\n", &set);
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.content, "x\nA\nB\ny\n");
    }

    #[test]
    fn test_overlapping_and_out_of_range_edits_are_skipped() {
        let set = EditSet {
            edits: vec![
                LineEdit::Replace {
                    start_line: 2,
                    end_line: 5,
                    new_code: "x".to_string(),
                },
                LineEdit::Delete {
                    start_line: 4,
                    end_line: 6,
                },
                LineEdit::Delete {
                    start_line: 40,
                    end_line: 41,
                },
            ],
            ..EditSet::default()
        };
        let outcome = apply_edits(&ten_lines(), &set);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.skipped, 2);
        // Only the delete of 4-6 landed (it sorts first).
        assert_eq!(outcome.content.lines().count(), 7);
    }

    #[test]
    fn test_imports_splice_after_last_import_and_shift_edits() {
        let source = "import a from 'a';\nimport b from 'b';\n\nconst x = 1;\nconst y = 2;";
        let set = EditSet {
            edits: vec![LineEdit::Replace {
                start_line: 5,
                end_line: 5,
                new_code: "const y = useThing();".to_string(),
            }],
            imports: vec![
                "import { useThing } from './thing';".to_string(),
                "import b from 'b';".to_string(),
            ],
            rejected: 0,
        };
        let outcome = apply_edits(source, &set);
        assert_eq!(outcome.imports_added, 1);
        let lines: Vec<&str> = outcome.content.lines().collect();
        assert_eq!(lines[2], "import { useThing } from './thing';");
        assert_eq!(lines[5], "const y = useThing();");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_edit_set_from_value_drops_malformed_entries() {
        let value = json!({
            "edits": [
                {"type": "replace", "startLine": 1, "endLine": 1, "newCode": "a"},
                {"type": "insert_after", "after_line": 2, "new_code": "b"},
                {"type": "rename", "line": 3},
                {"type": "delete", "startLine": "x"}
            ],
            "imports": "import x from 'x';\n\nimport y from 'y';"
        });
        let set = EditSet::from_value(&value);
        assert_eq!(set.edits.len(), 2);
        assert_eq!(set.rejected, 2);
        assert_eq!(set.imports.len(), 2);
    }

    #[test]
    fn test_dedup_rewrite_truncates_echoed_file() {
        let raw = "```tsx\nimport React from 'react';\nexport default function Card() {\n  return null;\n}\nexport default function Card() {\n  return null;\n}\n```";
        let cleaned = dedup_rewrite(raw);
        assert_eq!(
            cleaned,
            "import React from 'react';\nexport default function Card() {\n  return null;\n}\n"
        );
    }

    #[test]
    fn test_number_lines() {
        assert_eq!(number_lines("a\nb"), "   1| a\n   2| b");
    }
}
