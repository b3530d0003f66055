//! Unified diff generation
//!
//! Produces `--- a/` / `+++ b/` diffs with `@@` hunk headers from two texts,
//! independent of how the change was made. Used for session summaries and
//! the functional review prompt.

use std::fmt;

/// Lines of unchanged context kept around each change.
pub const CONTEXT_LINES: usize = 3;

/// Above this many LCS cells the diff degrades to one whole-file hunk.
const MAX_LCS_CELLS: usize = 4_000_000;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    fn prefix(&self) -> char {
        match self {
            DiffLine::Context(_) => ' ',
            DiffLine::Add(_) => '+',
            DiffLine::Remove(_) => '-',
        }
    }

    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Add(s) | DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (additions, removals) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Add(_)))
            .count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// Total (additions, removals)
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }
}

impl fmt::Display for UnifiedDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hunks.is_empty() {
            return Ok(());
        }
        writeln!(f, "--- a/{}", self.old_path)?;
        writeln!(f, "+++ b/{}", self.new_path)?;
        for hunk in &self.hunks {
            writeln!(
                f,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
            )?;
            for line in &hunk.lines {
                writeln!(f, "{}{}", line.prefix(), line.content())?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Remove,
    Add,
}

/// Edit script between two line slices, longest-common-subsequence based.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<(Op, &'a str)> {
    let (n, m) = (old.len(), new.len());
    if n.saturating_mul(m) > MAX_LCS_CELLS {
        let mut ops: Vec<(Op, &str)> = old.iter().map(|l| (Op::Remove, *l)).collect();
        ops.extend(new.iter().map(|l| (Op::Add, *l)));
        return ops;
    }

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push((Op::Equal, old[i]));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push((Op::Remove, old[i]));
            i += 1;
        } else {
            ops.push((Op::Add, new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|l| (Op::Remove, *l)));
    ops.extend(new[j..].iter().map(|l| (Op::Add, *l)));
    ops
}

/// Generate a unified diff between `old` and `new` for `path`.
///
/// Identical inputs produce a diff with no hunks (which renders as "").
pub fn generate(path: &str, old: &str, new: &str) -> UnifiedDiff {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = edit_script(&old_lines, &new_lines);

    // Lines of old/new consumed before each op.
    let mut old_before = Vec::with_capacity(ops.len());
    let mut new_before = Vec::with_capacity(ops.len());
    let (mut o, mut n) = (0usize, 0usize);
    for (op, _) in &ops {
        old_before.push(o);
        new_before.push(n);
        match op {
            Op::Equal => {
                o += 1;
                n += 1;
            }
            Op::Remove => o += 1,
            Op::Add => n += 1,
        }
    }

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, (op, _))| *op != Op::Equal)
        .map(|(i, _)| i)
        .collect();

    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let start = idx.saturating_sub(CONTEXT_LINES);
        let end = (idx + CONTEXT_LINES + 1).min(ops.len());
        match groups.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => groups.push((start, end)),
        }
    }

    let hunks = groups
        .into_iter()
        .map(|(start, end)| {
            let slice = &ops[start..end];
            let old_count = slice.iter().filter(|(op, _)| *op != Op::Add).count();
            let new_count = slice.iter().filter(|(op, _)| *op != Op::Remove).count();
            let old_start = if old_count == 0 {
                old_before[start]
            } else {
                old_before[start] + 1
            };
            let new_start = if new_count == 0 {
                new_before[start]
            } else {
                new_before[start] + 1
            };
            let lines = slice
                .iter()
                .map(|(op, text)| match op {
                    Op::Equal => DiffLine::Context(text.to_string()),
                    Op::Remove => DiffLine::Remove(text.to_string()),
                    Op::Add => DiffLine::Add(text.to_string()),
                })
                .collect();
            DiffHunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines,
            }
        })
        .collect();

    UnifiedDiff {
        old_path: path.to_string(),
        new_path: path.to_string(),
        hunks,
    }
}

/// Render the diff for `path` as text. Empty when nothing changed.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    generate(path, old, new).to_string()
}
