//! Codebase and context scanning
//!
//! Read-only helpers the planner and step handlers use to look around the
//! project: pattern search, a compact directory tree, and a one-shot scan of
//! key configuration files.

use crate::util::truncate_output;
use crate::workspace::Workspace;
use regex::RegexBuilder;
use serde::Serialize;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

const MAX_SCAN_FILE_CHARS: usize = 3_000;
const MAX_TREE_CHARS: usize = 6_000;
const MAX_LINE_CHARS: usize = 200;

/// Config files worth showing the planner verbatim.
const KEY_FILES: &[&str] = &[
    "package.json",
    "tsconfig.json",
    "next.config.js",
    "next.config.mjs",
    "next.config.ts",
    "vite.config.ts",
    "tailwind.config.js",
    "tailwind.config.ts",
    "nest-cli.json",
    "angular.json",
    "Cargo.toml",
];

const SEARCHABLE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "css", "scss", "html", "md", "rs", "py", "go",
    "vue", "svelte", "yml", "yaml", "toml", "env",
];

pub fn is_noise_dir(name: &str) -> bool {
    matches!(
        name,
        "node_modules"
            | "target"
            | ".git"
            | "__pycache__"
            | ".venv"
            | "venv"
            | "dist"
            | "build"
            | ".next"
            | "coverage"
    )
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".env.example"
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Search text files under `subdir` (or the root) for `pattern`.
///
/// The pattern is a case-insensitive regex; if it does not compile it is
/// matched literally.
pub fn search(ws: &Workspace, pattern: &str, subdir: Option<&str>, max_hits: usize) -> Vec<SearchHit> {
    let pattern = pattern.trim();
    if pattern.is_empty() || max_hits == 0 {
        return Vec::new();
    }
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            RegexBuilder::new(&regex::escape(pattern))
                .case_insensitive(true)
                .build()
        });
    let Ok(re) = re else {
        return Vec::new();
    };

    let start = match subdir.map(str::trim).filter(|s| !s.is_empty() && *s != ".") {
        Some(sub) => match ws.resolve(sub) {
            Ok(path) => path,
            Err(_) => return Vec::new(),
        },
        None => ws.root().to_path_buf(),
    };

    let mut hits = Vec::new();
    let walker = WalkDir::new(&start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(is_noise_dir(&name) || is_hidden(&name))
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_searchable(entry.path()) {
            continue;
        }
        let too_big = entry
            .metadata()
            .map(|m| m.len() > crate::workspace::MAX_READ_BYTES)
            .unwrap_or(true);
        if too_big {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = relative_display(ws.root(), entry.path());
        for (idx, line) in content.lines().enumerate() {
            if re.is_match(line) {
                hits.push(SearchHit {
                    path: rel.clone(),
                    line: idx + 1,
                    text: crate::util::truncate(line.trim(), MAX_LINE_CHARS),
                });
                if hits.len() >= max_hits {
                    return hits;
                }
            }
        }
    }
    hits
}

fn is_searchable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SEARCHABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn render_hits(pattern: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No matches found for pattern: {}", pattern);
    }
    hits.iter()
        .map(|h| format!("{}:{}: {}", h.path, h.line, h.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Indented directory tree, noise and hidden entries skipped.
pub fn tree(ws: &Workspace, subdir: Option<&str>, max_depth: usize) -> String {
    let start = match subdir.map(str::trim).filter(|s| !s.is_empty() && *s != ".") {
        Some(sub) => match ws.resolve(sub) {
            Ok(path) if path.is_dir() => path,
            _ => return format!("Path not found: {}", sub),
        },
        None => ws.root().to_path_buf(),
    };

    let mut output = String::new();
    let walker = WalkDir::new(&start)
        .max_depth(max_depth)
        .sort_by(|a, b| {
            b.file_type()
                .is_dir()
                .cmp(&a.file_type().is_dir())
                .then_with(|| a.file_name().cmp(b.file_name()))
        })
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(is_noise_dir(&name) || is_hidden(&name))
        });

    for entry in walker.filter_map(|e| e.ok()).skip(1) {
        let indent = "  ".repeat(entry.depth().saturating_sub(1));
        let name = entry.file_name().to_string_lossy();
        let suffix = if entry.file_type().is_dir() { "/" } else { "" };
        output.push_str(&format!("{}{}{}\n", indent, name, suffix));
        if output.len() > MAX_TREE_CHARS {
            break;
        }
    }
    truncate_output(&output, MAX_TREE_CHARS)
}

/// Snapshot of the project handed to the planner.
#[derive(Debug, Clone, Default)]
pub struct ProjectScan {
    pub tree: String,
    pub key_files: Vec<(String, String)>,
}

impl ProjectScan {
    pub fn scan(ws: &Workspace) -> Self {
        let tree = tree(ws, None, 3);
        let key_files = KEY_FILES
            .iter()
            .filter_map(|name| {
                ws.read(name)
                    .ok()
                    .map(|content| (name.to_string(), truncate_output(&content, MAX_SCAN_FILE_CHARS)))
            })
            .collect();
        Self { tree, key_files }
    }

    /// Whether the project looks like a Next.js app router project.
    pub fn is_next_app(&self) -> bool {
        self.key_files
            .iter()
            .any(|(name, content)| name.starts_with("next.config") || content.contains("\"next\""))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("PROJECT STRUCTURE:\n");
        if self.tree.trim().is_empty() {
            out.push_str("(empty project)\n");
        } else {
            out.push_str(&self.tree);
            out.push('\n');
        }
        for (name, content) in &self.key_files {
            out.push_str(&format!("\n--- {} ---\n{}\n", name, content));
        }
        out
    }
}

/// Context collected by read/search steps for later steps' prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextNote {
    pub source: String,
    pub body: String,
}

/// Render notes newest-first until `max_chars` is used up.
pub fn render_notes(notes: &[ContextNote], max_chars: usize) -> String {
    let mut out = String::new();
    for note in notes.iter().rev() {
        let block = format!("### {}\n{}\n\n", note.source, note.body);
        if out.len() + block.len() > max_chars {
            break;
        }
        out.push_str(&block);
    }
    out
}
