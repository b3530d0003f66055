//! Root-scoped filesystem access.
//!
//! Every path handed to the agent by a model is relative to the project
//! root; anything that resolves outside it is rejected before I/O.

use crate::error::AgentError;
use crate::util::{normalize_rel_path, resolve_repo_path_allow_new};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

/// Files larger than this are not loaded into prompts.
pub const MAX_READ_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .with_context(|| format!("Project root not found: {}", root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("Project root is not a directory: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied path inside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, AgentError> {
        let rel = normalize_rel_path(raw);
        resolve_repo_path_allow_new(&self.root, Path::new(&rel))
            .map(|p| p.absolute)
            .map_err(|_| AgentError::PathEscape {
                path: raw.to_string(),
            })
    }

    pub fn exists(&self, raw: &str) -> bool {
        self.resolve(raw).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn read(&self, raw: &str) -> anyhow::Result<String> {
        let path = self.resolve(raw)?;
        let meta = fs::metadata(&path).with_context(|| format!("File not found: {}", raw))?;
        if meta.len() > MAX_READ_BYTES {
            anyhow::bail!("File too large to load: {} ({} bytes)", raw, meta.len());
        }
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", raw))
    }

    /// Read `raw`, falling back to path variants: the path with a known
    /// prefix stripped, then with each known prefix added. Returns the
    /// variant that matched.
    pub fn read_with_variants(&self, raw: &str, prefixes: &[String]) -> Option<(String, String)> {
        let normalized = normalize_rel_path(raw);
        let mut candidates = vec![normalized.clone()];
        for prefix in prefixes {
            if let Some(stripped) = normalized.strip_prefix(prefix.as_str()) {
                candidates.push(stripped.to_string());
            }
        }
        for prefix in prefixes {
            if !normalized.starts_with(prefix.as_str()) {
                candidates.push(format!("{}{}", prefix, normalized));
            }
        }

        candidates
            .into_iter()
            .filter(|c| !c.is_empty())
            .find_map(|candidate| {
                self.read(&candidate)
                    .ok()
                    .map(|content| (candidate, content))
            })
    }

    /// Write a file, creating parent directories.
    pub fn write(&self, raw: &str, content: &str) -> anyhow::Result<()> {
        let path = self.resolve(raw)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for {}", raw))?;
        }
        fs::write(&path, content).with_context(|| format!("Failed to write {}", raw))
    }

    /// Delete a file. Returns false when it did not exist.
    pub fn delete(&self, raw: &str) -> anyhow::Result<bool> {
        let path = self.resolve(raw)?;
        if !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", raw))?;
        Ok(true)
    }

    /// List a directory (directories first, then files, each sorted).
    pub fn list(&self, raw: &str) -> anyhow::Result<Vec<DirEntry>> {
        let path = if raw.trim().is_empty() || raw.trim() == "." {
            self.root.clone()
        } else {
            self.resolve(raw)?
        };
        let mut entries: Vec<DirEntry> = fs::read_dir(&path)
            .with_context(|| format!("Directory not found: {}", raw))?
            .filter_map(|e| e.ok())
            .map(|e| DirEntry {
                name: e.file_name().to_string_lossy().to_string(),
                is_dir: e.path().is_dir(),
            })
            .filter(|e| !crate::context::is_noise_dir(&e.name))
            .collect();
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_creates_parents() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/components/Card.tsx", "export {}").unwrap();
        assert_eq!(ws.read("./src/components/Card.tsx").unwrap(), "export {}");
    }

    #[test]
    fn test_escape_is_rejected_before_io() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let err = ws.write("../outside.txt", "x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::PathEscape { .. })
        ));
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[test]
    fn test_read_with_variants_adds_and_strips_prefixes() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/app/page.tsx", "page").unwrap();
        ws.write("lib/db.ts", "db").unwrap();
        let prefixes = vec!["src/".to_string(), "app/".to_string()];

        let (path, content) = ws.read_with_variants("app/page.tsx", &prefixes).unwrap();
        assert_eq!(path, "src/app/page.tsx");
        assert_eq!(content, "page");

        let (path, _) = ws.read_with_variants("src/lib/db.ts", &prefixes).unwrap();
        assert_eq!(path, "lib/db.ts");

        assert!(ws.read_with_variants("missing.ts", &prefixes).is_none());
    }

    #[test]
    fn test_list_skips_noise_and_orders_dirs_first() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("b.txt", "").unwrap();
        ws.write("a/x.txt", "").unwrap();
        ws.write("node_modules/pkg/index.js", "").unwrap();
        let names: Vec<String> = ws.list("").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn test_delete_missing_file_reports_false() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        assert!(!ws.delete("nope.ts").unwrap());
        ws.write("yes.ts", "").unwrap();
        assert!(ws.delete("yes.ts").unwrap());
        assert!(!ws.exists("yes.ts"));
    }
}
