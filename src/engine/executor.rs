//! Step Executor
//!
//! Runs one plan step against the closed action vocabulary. Every handler
//! returns a [`StepOutcome`] or an error; context-gathering handlers never
//! fail, they degrade to a skipped note. Files are written to disk as soon
//! as a handler produces them and tracked in [`SessionState`] for
//! verification and rollback.

use super::backend::{self, BackendTask};
use super::events::{EventSink, FileKind, SessionEvent};
use super::patcher::{PatchStrategy, Patcher};
use super::AgentDeps;
use crate::budget::TokenBudget;
use crate::context::{self, ContextNote, ProjectScan};
use crate::error::AgentError;
use crate::llm::parse::strip_code_fences;
use crate::llm::{parse_file_blocks, prompts, ChatMessage, LlmRequest, Model};
use crate::plan::{PlanStep, StepAction};
use crate::research::{render_results, DEFAULT_RESULT_COUNT};
use crate::shell::{install_argv, run_argv, validate_packages, vet_command, Vetted};
use crate::util::{language_for_path, normalize_rel_path, truncate, truncate_output};
use crate::workspace::Workspace;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_NOTE_CHARS: usize = 8_000;
const MAX_CONTEXT_CHARS: usize = 6_000;
const MAX_SIBLING_CHARS: usize = 4_000;
const MAX_SIBLINGS: usize = 3;
const MAX_COMMAND_OUTPUT: usize = 4_000;
const MAX_SEARCH_HITS: usize = 30;

/// A file written during the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducedFile {
    pub path: String,
    pub content: String,
    pub language: String,
    pub description: String,
    pub kind: FileKind,
    /// Content before the session first touched the file
    #[serde(skip)]
    pub original: Option<String>,
}

/// Mutable state threaded through every step of one session.
pub struct SessionState {
    pub request: String,
    pub history: Vec<ChatMessage>,
    pub budget: TokenBudget,
    pub files: BTreeMap<String, ProducedFile>,
    pub notes: Vec<ContextNote>,
    pub follow_ups: Vec<String>,
    pub warnings: Vec<String>,
    pub reply: Option<String>,
    pub events: EventSink,
}

impl SessionState {
    pub fn new(request: impl Into<String>, history: Vec<ChatMessage>, token_limit: u64, events: EventSink) -> Self {
        Self {
            request: request.into(),
            history,
            budget: TokenBudget::new(token_limit),
            files: BTreeMap::new(),
            notes: Vec::new(),
            follow_ups: Vec::new(),
            warnings: Vec::new(),
            reply: None,
            events,
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    pub fn note(&mut self, source: impl Into<String>, body: impl Into<String>) {
        self.notes.push(ContextNote {
            source: source.into(),
            body: truncate_output(&body.into(), MAX_NOTE_CHARS),
        });
    }

    /// Every path written or deleted so far, the rollback scope.
    pub fn touched_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Files that still exist, in path order.
    pub fn produced(&self) -> Vec<&ProducedFile> {
        self.files.values().filter(|f| f.kind != FileKind::Deleted).collect()
    }

    pub fn produced_pairs(&self) -> Vec<(String, String)> {
        self.produced()
            .into_iter()
            .map(|f| (f.path.clone(), f.content.clone()))
            .collect()
    }

    /// Latest content of a file this session produced.
    pub fn file_content(&self, path: &str) -> Option<&str> {
        self.files
            .get(&normalize_rel_path(path))
            .filter(|f| f.kind != FileKind::Deleted)
            .map(|f| f.content.as_str())
    }

    /// Write `content` to disk and record it.
    pub fn write_file(&mut self, ws: &Workspace, path: &str, content: &str, description: &str) -> anyhow::Result<()> {
        let path = normalize_rel_path(path);
        let original = match self.files.get(&path) {
            Some(existing) => existing.original.clone(),
            None => ws.read(&path).ok(),
        };
        ws.write(&path, content)?;

        let kind = if original.is_some() {
            FileKind::Modified
        } else {
            FileKind::Generated
        };
        let language = language_for_path(&path).to_string();
        self.emit(SessionEvent::FileUpdate {
            path: path.clone(),
            language: language.clone(),
            kind,
            description: description.to_string(),
        });
        self.files.insert(
            path.clone(),
            ProducedFile {
                path,
                content: content.to_string(),
                language,
                description: description.to_string(),
                kind,
                original,
            },
        );
        Ok(())
    }

    /// Write several files. A path that escapes the root is rejected on its
    /// own; the rest are still written. Fails only if nothing was written.
    pub fn write_files(&mut self, ws: &Workspace, files: &[(String, String, String)]) -> anyhow::Result<Vec<String>> {
        let mut written = Vec::new();
        let mut last_err = None;
        for (path, content, description) in files {
            match self.write_file(ws, path, content, description) {
                Ok(()) => written.push(normalize_rel_path(path)),
                Err(err) => {
                    if let Some(AgentError::PathEscape { path }) = err.downcast_ref::<AgentError>() {
                        warn!(path = %path, "rejected write outside project root");
                        self.warnings.push(format!("Rejected write outside project root: {}", path));
                    }
                    last_err = Some(err);
                }
            }
        }
        match (written.is_empty(), last_err) {
            (true, Some(err)) => Err(err),
            (true, None) => Err(anyhow::anyhow!("No files were produced")),
            _ => Ok(written),
        }
    }

    fn record_delete(&mut self, path: &str, original: Option<String>) {
        let path = normalize_rel_path(path);
        let original = match self.files.get(&path) {
            Some(existing) => existing.original.clone(),
            None => original,
        };
        self.emit(SessionEvent::FileUpdate {
            path: path.clone(),
            language: language_for_path(&path).to_string(),
            kind: FileKind::Deleted,
            description: "Deleted".to_string(),
        });
        self.files.insert(
            path.clone(),
            ProducedFile {
                language: language_for_path(&path).to_string(),
                path,
                content: String::new(),
                description: "Deleted".to_string(),
                kind: FileKind::Deleted,
                original,
            },
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub detail: String,
    pub files: Vec<String>,
}

impl StepOutcome {
    pub(crate) fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            files: Vec::new(),
        }
    }

    pub(crate) fn with_files(detail: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            detail: detail.into(),
            files,
        }
    }
}

pub struct StepExecutor {
    deps: AgentDeps,
    patcher: Patcher,
}

impl StepExecutor {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            patcher: Patcher::new(deps.clone()),
            deps,
        }
    }

    fn ws(&self) -> &Workspace {
        &self.deps.workspace
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.deps.config.command_timeout_secs)
    }

    pub async fn execute(&self, state: &mut SessionState, step: &PlanStep) -> anyhow::Result<StepOutcome> {
        debug!(step = %step.id, action = step.action.name(), "executing step");
        match self.dispatch(state, step).await {
            Err(err) if step.action.is_context_only() => {
                debug!(step = %step.id, error = %err, "context step skipped");
                Ok(StepOutcome::detail(format!("Skipped: {}", err)))
            }
            other => other,
        }
    }

    async fn dispatch(&self, state: &mut SessionState, step: &PlanStep) -> anyhow::Result<StepOutcome> {
        match &step.action {
            StepAction::SearchWeb { query } => self.search_web(state, query).await,
            StepAction::SearchCodebase { pattern, path } => self.search_codebase(state, pattern, path.as_deref()),
            StepAction::GenerateComponent { path, description } => {
                self.generate(state, &step.id, path, description, false).await
            }
            StepAction::ModifyFile { path, instruction } => self.modify(state, &step.id, path, instruction).await,
            StepAction::ModifyFiles { paths, instruction } => {
                self.modify_many(state, &step.id, paths, instruction).await
            }
            StepAction::InstallPackages { packages, dev } => self.install(state, &step.id, packages, *dev).await,
            StepAction::RunCommand { command } => self.run_command(state, &step.id, command).await,
            StepAction::DelegateBackend { instruction } => self.delegate_backend(state, &step.id, instruction).await,
            StepAction::CreateApi { path, description } => self.generate(state, &step.id, path, description, true).await,
            StepAction::ReadFile { path } => self.read_file(state, path),
            StepAction::ListDirectory { path } => self.list_directory(state, path),
            StepAction::DeleteFile { path } => self.delete_file(state, &step.id, path),
            StepAction::Chat { message } => self.chat(state, message).await,
        }
    }

    async fn search_web(&self, state: &mut SessionState, query: &str) -> anyhow::Result<StepOutcome> {
        let Some(search) = &self.deps.search else {
            return Ok(StepOutcome::detail(
                "Web search unavailable (no search API key configured)",
            ));
        };
        if query.trim().is_empty() {
            anyhow::bail!("search_web needs a query");
        }
        let results = search.search(query, DEFAULT_RESULT_COUNT).await?;
        let count = results.len();
        state.note(format!("web: {}", query), render_results(query, &results));
        Ok(StepOutcome::detail(format!("{} web result(s) for \"{}\"", count, query)))
    }

    fn search_codebase(&self, state: &mut SessionState, pattern: &str, path: Option<&str>) -> anyhow::Result<StepOutcome> {
        if pattern.trim().is_empty() {
            anyhow::bail!("search_codebase needs a pattern");
        }
        let hits = context::search(self.ws(), pattern, path, MAX_SEARCH_HITS);
        let count = hits.len();
        state.note(format!("search: {}", pattern), context::render_hits(pattern, &hits));
        Ok(StepOutcome::detail(format!("{} match(es) for \"{}\"", count, pattern)))
    }

    fn read_file(&self, state: &mut SessionState, path: &str) -> anyhow::Result<StepOutcome> {
        if let Some(content) = state.file_content(path).map(str::to_string) {
            state.note(normalize_rel_path(path), content);
            return Ok(StepOutcome::detail(format!("Read {} (produced this session)", path)));
        }
        let (found, content) = self
            .ws()
            .read_with_variants(path, &self.deps.config.known_prefixes)
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", path))?;
        let lines = content.lines().count();
        state.note(found.clone(), content);
        Ok(StepOutcome::detail(format!("Read {} ({} lines)", found, lines)))
    }

    fn list_directory(&self, state: &mut SessionState, path: &str) -> anyhow::Result<StepOutcome> {
        let entries = self.ws().list(path)?;
        let subdir = Some(path).filter(|p| !p.trim().is_empty() && p.trim() != ".");
        let listing = context::tree(self.ws(), subdir, 2);
        state.note(format!("dir: {}", if path.is_empty() { "." } else { path }), listing);
        Ok(StepOutcome::detail(format!("Listed {} ({} entries)", path, entries.len())))
    }

    /// Context block for code-producing prompts: project scan, a few files
    /// already produced this session, and gathered notes.
    fn code_context(&self, state: &SessionState, exclude: &str) -> String {
        let mut out = ProjectScan::scan(self.ws()).render();
        let siblings: Vec<&ProducedFile> = state
            .produced()
            .into_iter()
            .filter(|f| f.path != exclude)
            .take(MAX_SIBLINGS)
            .collect();
        if !siblings.is_empty() {
            out.push_str("\nFILES ALREADY WRITTEN IN THIS SESSION (follow their style and reuse their exports):\n");
            for f in siblings {
                out.push_str(&format!(
                    "\n// FILE: {}\n{}\n",
                    f.path,
                    truncate_output(&f.content, MAX_SIBLING_CHARS)
                ));
            }
        }
        let notes = context::render_notes(&state.notes, MAX_CONTEXT_CHARS);
        if !notes.is_empty() {
            out.push_str("\nGATHERED CONTEXT:\n");
            out.push_str(&notes);
        }
        out
    }

    async fn generate(
        &self,
        state: &mut SessionState,
        step_id: &str,
        path: &str,
        description: &str,
        api: bool,
    ) -> anyhow::Result<StepOutcome> {
        let path = normalize_rel_path(path);
        if path.is_empty() {
            anyhow::bail!("No target path for generated file");
        }
        state.emit(SessionEvent::progress(Some(step_id), format!("Generating {}", path)));

        let mut user = format!("TARGET FILE: {}\n\nTASK:\n{}\n", path, description);
        if api {
            user.push_str(
                "\nThis is a server route handler. Export one named function per HTTP method (GET, POST, ...) and return JSON responses with proper status codes.\n",
            );
        }
        user.push_str(&format!("\nUSER REQUEST:\n{}\n\n", state.request));
        user.push_str(&self.code_context(state, &path));

        let request = LlmRequest::new(Model::Smart, prompts::GENERATE_SYSTEM, user);
        let response = self.deps.complete(&mut state.budget, request).await?;

        let blocks = parse_file_blocks(&response.content);
        let files: Vec<(String, String, String)> = if blocks.is_empty() {
            let body = strip_code_fences(&response.content);
            if body.trim().is_empty() {
                anyhow::bail!("Model returned no code for {}", path);
            }
            vec![(path.clone(), format!("{}\n", body.trim_end()), description.to_string())]
        } else {
            blocks
                .into_iter()
                .map(|b| (b.path, b.content, description.to_string()))
                .collect()
        };

        let written = state.write_files(self.ws(), &files)?;
        info!(step = step_id, files = written.len(), "generated");
        Ok(StepOutcome::with_files(
            format!("Generated {}", written.join(", ")),
            written,
        ))
    }

    /// Current content of `path`: this session's version, else disk with
    /// path-variant fallbacks. Returns the resolved path.
    fn locate(&self, state: &SessionState, path: &str) -> anyhow::Result<(String, String)> {
        if let Some(content) = state.file_content(path) {
            return Ok((normalize_rel_path(path), content.to_string()));
        }
        self.ws()
            .read_with_variants(path, &self.deps.config.known_prefixes)
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", path))
    }

    async fn modify(
        &self,
        state: &mut SessionState,
        step_id: &str,
        path: &str,
        instruction: &str,
    ) -> anyhow::Result<StepOutcome> {
        let (resolved, original) = self.locate(state, path)?;
        state.emit(SessionEvent::progress(Some(step_id), format!("Patching {}", resolved)));

        let context = context::render_notes(&state.notes, MAX_CONTEXT_CHARS);
        let result = self
            .patcher
            .patch(&mut state.budget, &resolved, &original, instruction, &context)
            .await?;
        state.write_file(self.ws(), &resolved, &result.content, instruction)?;

        let how = match result.strategy {
            PatchStrategy::LineEdits => format!("{} edit(s)", result.applied),
            PatchStrategy::Rewrite => "full rewrite".to_string(),
        };
        Ok(StepOutcome::with_files(
            format!("Patched {} ({})", resolved, how),
            vec![resolved],
        ))
    }

    async fn modify_many(
        &self,
        state: &mut SessionState,
        step_id: &str,
        paths: &[String],
        instruction: &str,
    ) -> anyhow::Result<StepOutcome> {
        if paths.is_empty() {
            anyhow::bail!("modify_files needs at least one path");
        }
        let mut written = Vec::new();
        let mut failures = Vec::new();
        for path in paths {
            match self.modify(state, step_id, path, instruction).await {
                Ok(outcome) => written.extend(outcome.files),
                Err(err) => failures.push(format!("{}: {}", path, err)),
            }
        }
        if written.is_empty() {
            anyhow::bail!("No files could be patched:\n{}", failures.join("\n"));
        }
        let mut detail = format!("Patched {}", written.join(", "));
        if !failures.is_empty() {
            detail.push_str(&format!("; failed: {}", failures.join("; ")));
        }
        Ok(StepOutcome::with_files(detail, written))
    }

    async fn install(
        &self,
        state: &mut SessionState,
        step_id: &str,
        packages: &[String],
        dev: bool,
    ) -> anyhow::Result<StepOutcome> {
        let packages = validate_packages(packages)?;
        let argv = install_argv(&self.deps.config.package_manager, &packages, dev);
        state.emit(SessionEvent::progress(Some(step_id), argv.join(" ")));

        let result = run_argv(self.ws().root(), &argv, self.command_timeout()).await?;
        if !result.success() {
            let reason = if result.timed_out { "timed out" } else { "failed" };
            anyhow::bail!(
                "{} {}:\n{}",
                argv.join(" "),
                reason,
                result.combined_output(MAX_COMMAND_OUTPUT)
            );
        }
        Ok(StepOutcome::detail(format!("Installed {}", packages.join(", "))))
    }

    async fn run_command(&self, state: &mut SessionState, step_id: &str, command: &str) -> anyhow::Result<StepOutcome> {
        let argv = match vet_command(command)? {
            Vetted::Skip(reason) => return Ok(StepOutcome::detail(format!("Skipped `{}`: {}", command, reason))),
            Vetted::Run(argv) => argv,
        };
        state.emit(SessionEvent::progress(Some(step_id), format!("$ {}", command)));

        let result = run_argv(self.ws().root(), &argv, self.command_timeout()).await?;
        let output = result.combined_output(MAX_COMMAND_OUTPUT);
        if !result.success() {
            anyhow::bail!("`{}` failed:\n{}", command, output);
        }
        state.note(format!("$ {}", command), output.clone());
        Ok(StepOutcome::detail(if output.is_empty() {
            format!("Ran `{}`", command)
        } else {
            format!("Ran `{}`:\n{}", command, truncate(&output, 500))
        }))
    }

    async fn delegate_backend(
        &self,
        state: &mut SessionState,
        step_id: &str,
        instruction: &str,
    ) -> anyhow::Result<StepOutcome> {
        let tasks = backend::analyze(self.ws(), &state.produced_pairs());
        if tasks.is_empty() {
            return Ok(StepOutcome::detail("No missing backend pieces found"));
        }

        let (auto, manual_tasks): (Vec<BackendTask>, Vec<BackendTask>) =
            tasks.into_iter().partition(BackendTask::is_auto);
        let mut manual = manual_tasks.len();
        state.follow_ups.extend(manual_tasks.iter().map(BackendTask::describe));

        let mut applied = Vec::new();
        for task in auto {
            match &task {
                BackendTask::CreateApi { route, path } => {
                    let description = format!(
                        "Route handler for {} as used by the frontend files. {}",
                        route, instruction
                    );
                    match self.generate(state, step_id, path, &description, true).await {
                        Ok(outcome) => applied.extend(outcome.files),
                        Err(err) => {
                            warn!(route = %route, error = %err, "backend route generation failed");
                            state.follow_ups.push(task.describe());
                            manual += 1;
                        }
                    }
                }
                BackendTask::SeedData { path } => {
                    state.write_file(self.ws(), path, "[]\n", "Seed data file")?;
                    applied.push(path.clone());
                }
                BackendTask::EnvVar { .. } => {}
            }
        }

        Ok(StepOutcome::with_files(
            format!(
                "{} backend file(s) created, {} manual follow-up(s)",
                applied.len(),
                manual
            ),
            applied,
        ))
    }

    fn delete_file(&self, state: &mut SessionState, step_id: &str, path: &str) -> anyhow::Result<StepOutcome> {
        let path = normalize_rel_path(path);
        self.ws().resolve(&path)?;
        state.emit(SessionEvent::Progress {
            step_id: Some(step_id.to_string()),
            message: format!("Deleting {}", path),
            confirm: true,
        });

        let original = self.ws().read(&path).ok();
        if !self.ws().delete(&path)? {
            return Ok(StepOutcome::detail(format!("{} was already absent", path)));
        }
        state.record_delete(&path, original);
        Ok(StepOutcome::with_files(format!("Deleted {}", path), vec![path]))
    }

    async fn chat(&self, state: &mut SessionState, message: &str) -> anyhow::Result<StepOutcome> {
        let reply = if message.trim().is_empty() {
            let request = LlmRequest::new(Model::Balanced, prompts::CHAT_SYSTEM, state.request.clone())
                .with_history(&state.history);
            self.deps.complete(&mut state.budget, request).await?.content
        } else {
            message.to_string()
        };
        let detail = truncate(&reply, 200);
        state.reply = Some(reply);
        Ok(StepOutcome::detail(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::SearchResult;
    use crate::test_support::{deps, ScriptedLlm, StaticSearch};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn state() -> (SessionState, UnboundedReceiver<SessionEvent>) {
        let (sink, rx) = EventSink::channel();
        (SessionState::new("build it", Vec::new(), 10_000, sink), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn step(action: StepAction) -> PlanStep {
        PlanStep::new("s1", "step", action)
    }

    #[tokio::test]
    async fn test_generate_single_file_writes_and_records() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(["```tsx\nexport function Hero() { return null; }\n```"]));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, mut rx) = state();

        let outcome = executor
            .execute(
                &mut state,
                &step(StepAction::GenerateComponent {
                    path: "./src/Hero.tsx".to_string(),
                    description: "hero".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome.files, vec!["src/Hero.tsx".to_string()]);
        let on_disk = std::fs::read_to_string(dir.path().join("src/Hero.tsx")).unwrap();
        assert_eq!(on_disk, "export function Hero() { return null; }\n");
        assert_eq!(state.files["src/Hero.tsx"].kind, FileKind::Generated);
        assert_eq!(state.files["src/Hero.tsx"].language, "tsx");
        assert!(drain(&mut rx).iter().any(|e| e.name() == "file-update"));
    }

    #[tokio::test]
    async fn test_generate_multi_file_rejects_escaping_path_only() {
        let dir = tempdir().unwrap();
        let response = "// FILE: src/types.ts\nexport type Plan = { id: string };\n// FILE: ../outside.ts\nexport const x = 1;\n";
        let llm = Arc::new(ScriptedLlm::new([response]));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();

        let outcome = executor
            .execute(
                &mut state,
                &step(StepAction::GenerateComponent {
                    path: "src/Pricing.tsx".to_string(),
                    description: "pricing".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome.files, vec!["src/types.ts".to_string()]);
        assert_eq!(state.warnings.len(), 1);
        assert!(!dir.path().parent().unwrap().join("outside.ts").exists());
    }

    #[tokio::test]
    async fn test_modify_file_uses_path_variants() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/components/Nav.tsx", "export function Nav() {\n  return <nav />;\n}\n").unwrap();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"edits":[{"type":"replace","startLine":2,"endLine":2,"newCode":"  return <nav className=\"top\" />;"}]}"#,
        ]));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();

        let outcome = executor
            .execute(
                &mut state,
                &step(StepAction::ModifyFile {
                    path: "components/Nav.tsx".to_string(),
                    instruction: "add class".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome.files, vec!["src/components/Nav.tsx".to_string()]);
        let produced = &state.files["src/components/Nav.tsx"];
        assert_eq!(produced.kind, FileKind::Modified);
        assert!(produced.original.as_deref().unwrap().contains("<nav />"));
        assert!(ws.read("src/components/Nav.tsx").unwrap().contains("className=\"top\""));
    }

    #[tokio::test]
    async fn test_modify_missing_file_fails() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();
        let err = executor
            .execute(
                &mut state,
                &step(StepAction::ModifyFile {
                    path: "src/Nope.tsx".to_string(),
                    instruction: "x".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn test_invalid_package_is_not_allowed() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();
        let err = executor
            .execute(
                &mut state,
                &step(StepAction::InstallPackages {
                    packages: vec!["react".to_string(), "evil; rm -rf /".to_string()],
                    dev: false,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::CommandNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_command_policies() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();

        let skipped = executor
            .execute(&mut state, &step(StepAction::RunCommand { command: "npm run build".to_string() }))
            .await
            .unwrap();
        assert!(skipped.detail.starts_with("Skipped"));

        let err = executor
            .execute(&mut state, &step(StepAction::RunCommand { command: "ls; rm -rf .".to_string() }))
            .await
            .unwrap_err();
        assert!(!crate::error::is_retryable(&err));

        let ran = executor
            .execute(&mut state, &step(StepAction::RunCommand { command: "echo hello".to_string() }))
            .await
            .unwrap();
        assert!(ran.detail.contains("hello"));
    }

    #[tokio::test]
    async fn test_context_steps_never_fail() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();

        let outcome = executor
            .execute(&mut state, &step(StepAction::ReadFile { path: "missing.ts".to_string() }))
            .await
            .unwrap();
        assert!(outcome.detail.starts_with("Skipped"));

        let outcome = executor
            .execute(&mut state, &step(StepAction::ListDirectory { path: "nowhere".to_string() }))
            .await
            .unwrap();
        assert!(outcome.detail.starts_with("Skipped"));

        let outcome = executor
            .execute(&mut state, &step(StepAction::SearchWeb { query: "zod".to_string() }))
            .await
            .unwrap();
        assert!(outcome.detail.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_context_steps_add_notes() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/api.ts", "export const API_URL = '/api';\n").unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let search = Arc::new(StaticSearch(vec![SearchResult {
            title: "Zod".to_string(),
            url: "https://zod.dev".to_string(),
            description: "Schema validation".to_string(),
        }]));
        let executor = StepExecutor::new(deps(dir.path(), llm).with_search(search));
        let (mut state, _rx) = state();

        executor
            .execute(&mut state, &step(StepAction::ReadFile { path: "src/api.ts".to_string() }))
            .await
            .unwrap();
        executor
            .execute(
                &mut state,
                &step(StepAction::SearchCodebase {
                    pattern: "API_URL".to_string(),
                    path: None,
                }),
            )
            .await
            .unwrap();
        executor
            .execute(&mut state, &step(StepAction::SearchWeb { query: "zod".to_string() }))
            .await
            .unwrap();

        assert_eq!(state.notes.len(), 3);
        assert_eq!(state.notes[0].source, "src/api.ts");
        assert!(state.notes[1].body.contains("src/api.ts"));
        assert!(state.notes[2].body.contains("https://zod.dev"));
    }

    #[tokio::test]
    async fn test_delete_emits_confirmation_first() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/Old.tsx", "old").unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, mut rx) = state();

        executor
            .execute(&mut state, &step(StepAction::DeleteFile { path: "src/Old.tsx".to_string() }))
            .await
            .unwrap();
        assert!(!ws.exists("src/Old.tsx"));
        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::Progress { confirm: true, .. }));
        assert_eq!(state.files["src/Old.tsx"].kind, FileKind::Deleted);
        assert_eq!(state.files["src/Old.tsx"].original.as_deref(), Some("old"));
        assert_eq!(state.touched_files(), vec!["src/Old.tsx".to_string()]);
        assert!(state.produced().is_empty());
    }

    #[tokio::test]
    async fn test_delegate_backend_applies_and_defers() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new([
            "export async function GET() { return Response.json([]); }",
        ]));
        let executor = StepExecutor::new(deps(dir.path(), llm));
        let (mut state, _rx) = state();
        state
            .write_file(
                &Workspace::new(dir.path()).unwrap(),
                "app/page.tsx",
                "const r = await fetch('/api/plans');\nconst d = require('./data/plans.json');\nconst k = process.env.STRIPE_KEY;\n",
                "page",
            )
            .unwrap();

        let outcome = executor
            .execute(
                &mut state,
                &step(StepAction::DelegateBackend {
                    instruction: "wire it up".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.files,
            vec!["app/api/plans/route.ts".to_string(), "data/plans.json".to_string()]
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("data/plans.json")).unwrap(), "[]\n");
        assert_eq!(state.follow_ups, vec!["Set STRIPE_KEY in .env.local".to_string()]);
    }

    #[tokio::test]
    async fn test_chat_uses_planned_message_without_llm_call() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let executor = StepExecutor::new(deps(dir.path(), llm.clone()));
        let (mut state, _rx) = state();
        executor
            .execute(&mut state, &step(StepAction::Chat { message: "Hi there".to_string() }))
            .await
            .unwrap();
        assert_eq!(state.reply.as_deref(), Some("Hi there"));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_chat_without_message_asks_balanced_model() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(["It renders the header."]));
        let executor = StepExecutor::new(deps(dir.path(), llm.clone()));
        let (mut state, _rx) = state();
        executor
            .execute(&mut state, &step(StepAction::Chat { message: String::new() }))
            .await
            .unwrap();
        assert_eq!(state.reply.as_deref(), Some("It renders the header."));
        assert_eq!(llm.calls()[0].model, Model::Balanced);
        assert_eq!(state.budget.spent(), 10);
    }
}
