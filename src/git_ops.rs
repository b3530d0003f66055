//! Checkpoints and file-scoped rollback
//!
//! A checkpoint is an ordinary commit of the whole working tree taken before
//! a session mutates anything. Rollback only touches files that both changed
//! since the checkpoint and appear in the caller's touched list.

use crate::error::AgentError;
use crate::util::{normalize_rel_path, resolve_repo_path_allow_new};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::{DiffOptions, DiffStatsFormat, IndexAddOption, Repository, Signature, Tree};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub commit_hash: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub checkpoint: String,
    pub files: Vec<String>,
    pub stat: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Files rewritten with their checkpoint content
    pub restored: Vec<String>,
    /// Files removed because they did not exist at the checkpoint
    pub deleted: Vec<String>,
    /// Touched files with no change since the checkpoint
    pub unchanged: Vec<String>,
}

/// Whether two repo-relative paths name the same file, tolerating a
/// missing leading directory on either side.
pub fn paths_match(changed: &str, touched: &str) -> bool {
    let changed = normalize_rel_path(changed);
    let touched = normalize_rel_path(touched);
    if changed.is_empty() || touched.is_empty() {
        return false;
    }
    changed == touched
        || changed.ends_with(&format!("/{}", touched))
        || touched.ends_with(&format!("/{}", changed))
}

fn git_err(operation: &'static str) -> impl Fn(anyhow::Error) -> AgentError {
    move |err| AgentError::git(operation, format!("{:#}", err))
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "mender".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "mender@local".to_string());
    Ok(Signature::now(&name, &email)?)
}

fn head_commit(repo: &Repository) -> Result<Option<git2::Commit<'_>>> {
    match repo.head() {
        Ok(head) => match head.peel_to_commit() {
            Ok(commit) => Ok(Some(commit)),
            Err(err)
                if matches!(
                    err.code(),
                    git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        },
        Err(err)
            if matches!(
                err.code(),
                git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn commit_index(repo: &Repository, index: &mut git2::Index, message: &str) -> Result<String> {
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = head_commit(repo)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let sig = signature(repo)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

pub struct SnapshotManager {
    root: PathBuf,
}

impl SnapshotManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.root)
            .with_context(|| format!("No repository at {}", self.root.display()))
    }

    fn open_or_init(&self) -> Result<Repository> {
        match Repository::open(&self.root) {
            Ok(repo) => Ok(repo),
            Err(_) => {
                info!(root = %self.root.display(), "initializing repository for checkpoints");
                Ok(Repository::init(&self.root)?)
            }
        }
    }

    fn checkpoint_tree<'r>(repo: &'r Repository, checkpoint: &str) -> Result<Tree<'r>> {
        let object = repo
            .revparse_single(checkpoint)
            .with_context(|| format!("Unknown checkpoint '{}'", checkpoint))?;
        Ok(object.peel_to_tree()?)
    }

    /// Commit the full working tree (empty commits allowed).
    pub fn checkpoint(&self, label: &str) -> Result<Snapshot, AgentError> {
        self.checkpoint_inner(label).map_err(git_err("checkpoint"))
    }

    fn checkpoint_inner(&self, label: &str) -> Result<Snapshot> {
        let repo = self.open_or_init()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let message = format!("mender checkpoint: {}", label);
        let commit_hash = commit_index(&repo, &mut index, &message)?;
        info!(commit = %commit_hash, label, "checkpoint created");
        Ok(Snapshot {
            commit_hash,
            label: label.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Commit only the given files.
    pub fn commit_files(&self, paths: &[String], message: &str) -> Result<String, AgentError> {
        self.commit_files_inner(paths, message)
            .map_err(git_err("commit"))
    }

    fn commit_files_inner(&self, paths: &[String], message: &str) -> Result<String> {
        let repo = self.open_or_init()?;
        let mut index = repo.index()?;
        for raw in paths {
            let resolved = resolve_repo_path_allow_new(&self.root, Path::new(&normalize_rel_path(raw)))
                .map_err(|e| anyhow::anyhow!(e))?;
            if resolved.absolute.exists() {
                index.add_path(&resolved.relative)?;
            } else {
                let _ = index.remove_path(&resolved.relative);
            }
        }
        index.write()?;
        commit_index(&repo, &mut index, message)
    }

    fn workdir_diff<'r>(repo: &'r Repository, checkpoint: &str) -> Result<git2::Diff<'r>> {
        let tree = Self::checkpoint_tree(repo, checkpoint)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        Ok(repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?)
    }

    fn delta_paths(diff: &git2::Diff<'_>) -> Vec<String> {
        let mut files: Vec<String> = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Changed-file list plus a stat summary. Never mutates anything.
    pub fn diff(&self, checkpoint: &str) -> Result<SnapshotDiff, AgentError> {
        self.diff_inner(checkpoint).map_err(git_err("diff"))
    }

    fn diff_inner(&self, checkpoint: &str) -> Result<SnapshotDiff> {
        let repo = self.open()?;
        let diff = Self::workdir_diff(&repo, checkpoint)?;
        let files = Self::delta_paths(&diff);
        let stats = diff.stats()?;
        let buf = stats.to_buf(DiffStatsFormat::FULL, 80)?;
        Ok(SnapshotDiff {
            checkpoint: checkpoint.to_string(),
            files,
            stat: buf.as_str().unwrap_or_default().to_string(),
        })
    }

    /// Content of `path` at the checkpoint, `None` if it did not exist.
    pub fn show(&self, checkpoint: &str, path: &str) -> Result<Option<String>, AgentError> {
        self.show_inner(checkpoint, path).map_err(git_err("show"))
    }

    fn show_inner(&self, checkpoint: &str, path: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let tree = Self::checkpoint_tree(&repo, checkpoint)?;
        match tree.get_path(Path::new(&normalize_rel_path(path))) {
            Ok(entry) => {
                let blob = repo.find_blob(entry.id())?;
                Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
            }
            Err(_) => Ok(None),
        }
    }

    /// Restore touched files to their checkpoint state. Files outside the
    /// touched list are never reverted.
    pub fn rollback(&self, checkpoint: &str, touched: &[String]) -> Result<RollbackReport, AgentError> {
        self.rollback_inner(checkpoint, touched)
            .map_err(git_err("rollback"))
    }

    fn rollback_inner(&self, checkpoint: &str, touched: &[String]) -> Result<RollbackReport> {
        let repo = self.open()?;
        let tree = Self::checkpoint_tree(&repo, checkpoint)?;
        let changed = {
            let diff = Self::workdir_diff(&repo, checkpoint)?;
            Self::delta_paths(&diff)
        };

        let mut report = RollbackReport::default();
        let mut index = repo.index()?;

        for path in &changed {
            if !touched.iter().any(|t| paths_match(path, t)) {
                continue;
            }
            let resolved = resolve_repo_path_allow_new(&self.root, Path::new(path))
                .map_err(|e| anyhow::anyhow!(e))?;

            match tree.get_path(&resolved.relative) {
                Ok(entry) => {
                    let blob = repo.find_blob(entry.id())?;
                    if let Some(parent) = resolved.absolute.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&resolved.absolute, blob.content())
                        .with_context(|| format!("Failed to restore {}", path))?;
                    index.add_path(&resolved.relative)?;
                    report.restored.push(path.clone());
                }
                Err(_) => {
                    if resolved.absolute.exists() {
                        std::fs::remove_file(&resolved.absolute)
                            .with_context(|| format!("Failed to remove new file {}", path))?;
                    }
                    let _ = index.remove_path(&resolved.relative);
                    report.deleted.push(path.clone());
                }
            }
        }
        index.write()?;

        report.unchanged = touched
            .iter()
            .filter(|t| !changed.iter().any(|c| paths_match(c, t)))
            .cloned()
            .collect();

        info!(
            checkpoint,
            restored = report.restored.len(),
            deleted = report.deleted.len(),
            "rollback complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&repo_path).expect("Failed to init repo");
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        (temp_dir, repo_path)
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(root: &Path, rel: &str) -> String {
        fs::read_to_string(root.join(rel)).unwrap()
    }

    #[test]
    fn test_paths_match_on_component_boundary() {
        assert!(paths_match("src/app/page.tsx", "app/page.tsx"));
        assert!(paths_match("page.tsx", "src/app/page.tsx"));
        assert!(paths_match("./src/a.ts", "src/a.ts"));
        assert!(!paths_match("src/mypage.tsx", "page.tsx"));
    }

    #[test]
    fn test_rollback_restores_only_touched_files() {
        let (_dir, root) = create_temp_repo();
        write(&root, "src/x.ts", "x original");
        write(&root, "src/y.ts", "y original");
        let manager = SnapshotManager::new(&root);
        let snapshot = manager.checkpoint("before session").unwrap();

        write(&root, "src/x.ts", "x changed");
        write(&root, "src/y.ts", "y changed");

        let report = manager
            .rollback(&snapshot.commit_hash, &["src/x.ts".to_string()])
            .unwrap();
        assert_eq!(report.restored, vec!["src/x.ts".to_string()]);
        assert_eq!(read(&root, "src/x.ts"), "x original");
        assert_eq!(read(&root, "src/y.ts"), "y changed");
    }

    #[test]
    fn test_rollback_deletes_files_new_since_checkpoint() {
        let (_dir, root) = create_temp_repo();
        write(&root, "keep.ts", "keep");
        let manager = SnapshotManager::new(&root);
        let snapshot = manager.checkpoint("start").unwrap();

        write(&root, "src/components/New.tsx", "new");
        write(&root, "notes.md", "someone else's work");

        let report = manager
            .rollback(
                &snapshot.commit_hash,
                &["components/New.tsx".to_string(), "keep.ts".to_string()],
            )
            .unwrap();
        assert_eq!(report.deleted, vec!["src/components/New.tsx".to_string()]);
        assert_eq!(report.unchanged, vec!["keep.ts".to_string()]);
        assert!(!root.join("src/components/New.tsx").exists());
        assert!(root.join("notes.md").exists());
    }

    #[test]
    fn test_rollback_recreates_deleted_file() {
        let (_dir, root) = create_temp_repo();
        write(&root, "a.ts", "alpha");
        let manager = SnapshotManager::new(&root);
        let snapshot = manager.checkpoint("start").unwrap();
        fs::remove_file(root.join("a.ts")).unwrap();

        let report = manager
            .rollback(&snapshot.commit_hash, &["a.ts".to_string()])
            .unwrap();
        assert_eq!(report.restored, vec!["a.ts".to_string()]);
        assert_eq!(read(&root, "a.ts"), "alpha");
    }

    #[test]
    fn test_checkpoint_initializes_missing_repository() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.ts", "hello");
        let manager = SnapshotManager::new(dir.path());
        let first = manager.checkpoint("first").unwrap();
        let second = manager.checkpoint("empty").unwrap();
        assert_ne!(first.commit_hash, second.commit_hash);
        assert_eq!(
            manager.show(&first.commit_hash, "index.ts").unwrap(),
            Some("hello".to_string())
        );
        assert_eq!(manager.show(&first.commit_hash, "missing.ts").unwrap(), None);
    }

    #[test]
    fn test_diff_reports_files_and_stat_without_mutation() {
        let (_dir, root) = create_temp_repo();
        write(&root, "a.ts", "one\n");
        let manager = SnapshotManager::new(&root);
        let snapshot = manager.checkpoint("start").unwrap();
        write(&root, "a.ts", "one\ntwo\n");
        write(&root, "b.ts", "new\n");

        let diff = manager.diff(&snapshot.commit_hash).unwrap();
        assert_eq!(diff.files, vec!["a.ts".to_string(), "b.ts".to_string()]);
        assert!(diff.stat.contains("2 files changed"));
        assert_eq!(read(&root, "a.ts"), "one\ntwo\n");
    }

    #[test]
    fn test_unknown_checkpoint_is_git_error() {
        let (_dir, root) = create_temp_repo();
        let err = SnapshotManager::new(&root)
            .rollback("deadbeef", &["a.ts".to_string()])
            .unwrap_err();
        assert!(matches!(err, AgentError::GitOperation { .. }));
    }

    #[test]
    fn test_commit_files_commits_only_listed_paths() {
        let (_dir, root) = create_temp_repo();
        write(&root, "a.ts", "a");
        write(&root, "b.ts", "b");
        let manager = SnapshotManager::new(&root);
        let hash = manager
            .commit_files(&["a.ts".to_string()], "mender: add a")
            .unwrap();
        assert_eq!(manager.show(&hash, "a.ts").unwrap(), Some("a".to_string()));
        assert_eq!(manager.show(&hash, "b.ts").unwrap(), None);
    }
}
