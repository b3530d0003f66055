//! Retry/Diagnosis Engine
//!
//! A failed step gets three escalating recovery strategies, tried in order
//! until one produces files:
//!
//! 1. contextual retry: the task again, with the literal error and the
//!    current target content
//! 2. diagnose-then-fix: a diagnosis call, a round of codebase searches and
//!    reads, then a fix grounded in what was found
//! 3. decompose: split into up to four single-file sub-tasks that see each
//!    other's output
//!
//! Separately, [`RetryEngine::replan`] asks for replacement steps once
//! several plan steps have failed for good.

use super::executor::SessionState;
use super::AgentDeps;
use crate::context::{self, render_notes};
use crate::llm::parse::strip_code_fences;
use crate::llm::{parse_json_object, parse_structured_content, prompts, LlmRequest, Model};
use crate::plan::{ExecutionPlan, PlanStep, StepStatus};
use crate::util::{normalize_rel_path, truncate, truncate_output};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

const MAX_DIAG_SEARCHES: usize = 3;
const MAX_DIAG_READS: usize = 4;
const MAX_SUBTASKS: usize = 4;
const MAX_DIAG_FILE_CHARS: usize = 6_000;
const MAX_TARGET_CHARS: usize = 12_000;
const MAX_ERROR_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Contextual,
    DiagnoseFix,
    Decompose,
}

impl Strategy {
    const ALL: [Strategy; 3] = [Strategy::Contextual, Strategy::DiagnoseFix, Strategy::Decompose];

    fn number(self) -> u8 {
        match self {
            Strategy::Contextual => 1,
            Strategy::DiagnoseFix => 2,
            Strategy::Decompose => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Strategy::Contextual => "contextual retry",
            Strategy::DiagnoseFix => "diagnose-then-fix",
            Strategy::Decompose => "decompose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryAttempt {
    pub strategy: u8,
    /// `None` for the attempt that succeeded
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: Vec<RetryAttempt>,
    pub detail: String,
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    #[serde(default)]
    files: Vec<FileSpec>,
}

#[derive(Debug, Deserialize)]
struct FileSpec {
    path: String,
    content: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Diagnosis {
    #[serde(alias = "root_cause")]
    root_cause: String,
    #[serde(alias = "search_queries")]
    search_queries: Vec<String>,
    #[serde(alias = "files_to_read")]
    files_to_read: Vec<String>,
    #[serde(alias = "fix_approach")]
    fix_approach: String,
}

#[derive(Debug, Deserialize)]
struct Decomposition {
    #[serde(default)]
    subtasks: Vec<Subtask>,
}

#[derive(Debug, Deserialize)]
struct Subtask {
    path: String,
    #[serde(default)]
    description: String,
}

fn one_line(error: &str) -> String {
    truncate(&error.split_whitespace().collect::<Vec<_>>().join(" "), MAX_ERROR_CHARS)
}

/// The failed step described for recovery prompts.
fn describe_task(step: &PlanStep) -> String {
    let fields = serde_json::to_string_pretty(&step.action).unwrap_or_default();
    format!(
        "STEP: {} ({})\n{}\n\nACTION:\n{}\n",
        step.title,
        step.action.name(),
        step.detail,
        fields
    )
}

pub struct RetryEngine {
    deps: AgentDeps,
}

impl RetryEngine {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    /// Run the strategies in order, stopping at the first success.
    pub async fn recover(&self, state: &mut SessionState, step: &PlanStep, error: &str) -> RetryOutcome {
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut last_error = error.to_string();

        for strategy in Strategy::ALL {
            if state.budget.is_exceeded() {
                attempts.push(RetryAttempt {
                    strategy: strategy.number(),
                    error: Some("skipped: token budget exceeded".to_string()),
                });
                continue;
            }

            info!(step = %step.id, strategy = strategy.number(), "recovery attempt");
            state.emit(super::SessionEvent::progress(
                Some(&step.id),
                format!("Recovering with strategy {} ({})", strategy.number(), strategy.label()),
            ));

            let result = match strategy {
                Strategy::Contextual => self.contextual(state, step, &last_error).await,
                Strategy::DiagnoseFix => self.diagnose_then_fix(state, step, &last_error).await,
                Strategy::Decompose => self.decompose(state, step, &last_error).await,
            };

            match result {
                Ok(files) => {
                    attempts.push(RetryAttempt {
                        strategy: strategy.number(),
                        error: None,
                    });
                    let failed = attempts.len() - 1;
                    return RetryOutcome {
                        success: true,
                        detail: format!(
                            "Recovered by strategy {} ({}) after {} failed attempt(s); wrote {}",
                            strategy.number(),
                            strategy.label(),
                            failed,
                            files.join(", ")
                        ),
                        attempts,
                        files,
                    };
                }
                Err(err) => {
                    warn!(step = %step.id, strategy = strategy.number(), error = %err, "recovery attempt failed");
                    last_error = err.to_string();
                    attempts.push(RetryAttempt {
                        strategy: strategy.number(),
                        error: Some(one_line(&last_error)),
                    });
                }
            }
        }

        let mut detail = format!("All {} recovery strategies failed:", attempts.len());
        for attempt in &attempts {
            let label = Strategy::ALL
                .iter()
                .find(|s| s.number() == attempt.strategy)
                .map(|s| s.label())
                .unwrap_or("unknown");
            detail.push_str(&format!(
                "\nstrategy {} ({}): {}",
                attempt.strategy,
                label,
                attempt.error.as_deref().unwrap_or_default()
            ));
        }
        RetryOutcome {
            success: false,
            attempts,
            detail,
            files: Vec::new(),
        }
    }

    fn target_content(&self, state: &SessionState, step: &PlanStep) -> Option<(String, String)> {
        let target = step.action.target_paths().into_iter().next()?;
        if let Some(content) = state.file_content(&target) {
            return Some((normalize_rel_path(&target), content.to_string()));
        }
        self.deps
            .workspace
            .read_with_variants(&target, &self.deps.config.known_prefixes)
    }

    fn write_response(&self, state: &mut SessionState, content: &str) -> anyhow::Result<Vec<String>> {
        let response: FilesResponse = parse_structured_content(content)?;
        let files: Vec<(String, String, String)> = response
            .files
            .into_iter()
            .filter(|f| !f.path.trim().is_empty() && !f.content.trim().is_empty())
            .map(|f| (f.path, f.content, f.description))
            .collect();
        if files.is_empty() {
            anyhow::bail!("Response contained no files");
        }
        state.write_files(&self.deps.workspace, &files)
    }

    async fn contextual(&self, state: &mut SessionState, step: &PlanStep, error: &str) -> anyhow::Result<Vec<String>> {
        let mut user = format!(
            "ORIGINAL TASK:\n{}\nUSER REQUEST:\n{}\n\nERROR:\n{}\n",
            describe_task(step),
            state.request,
            error
        );
        if let Some((path, content)) = self.target_content(state, step) {
            user.push_str(&format!(
                "\nCURRENT CONTENT OF {}:\n{}\n",
                path,
                truncate_output(&content, MAX_TARGET_CHARS)
            ));
        }
        let notes = render_notes(&state.notes, MAX_DIAG_FILE_CHARS);
        if !notes.is_empty() {
            user.push_str(&format!("\nRESEARCH SO FAR:\n{}", notes));
        }

        let request = LlmRequest::new(Model::Smart, prompts::RETRY_CONTEXTUAL_SYSTEM, user).json();
        let response = self.deps.complete(&mut state.budget, request).await?;
        self.write_response(state, &response.content)
    }

    async fn diagnose_then_fix(&self, state: &mut SessionState, step: &PlanStep, error: &str) -> anyhow::Result<Vec<String>> {
        let user = format!(
            "FAILED TASK:\n{}\nERROR:\n{}\n\nPROJECT:\n{}",
            describe_task(step),
            error,
            context::tree(&self.deps.workspace, None, 3)
        );
        let request = LlmRequest::new(Model::Speed, prompts::DIAGNOSE_SYSTEM, user).json();
        let response = self.deps.complete(&mut state.budget, request).await?;
        let diagnosis: Diagnosis = parse_structured_content(&response.content)?;

        let mut diag_context = String::new();
        for query in diagnosis
            .search_queries
            .iter()
            .filter(|q| !q.trim().is_empty())
            .take(MAX_DIAG_SEARCHES)
        {
            let hits = context::search(&self.deps.workspace, query, None, 15);
            diag_context.push_str(&format!("### search: {}\n{}\n\n", query, context::render_hits(query, &hits)));
        }
        for path in diagnosis.files_to_read.iter().take(MAX_DIAG_READS) {
            let found = match state.file_content(path) {
                Some(content) => Some((normalize_rel_path(path), content.to_string())),
                None => self
                    .deps
                    .workspace
                    .read_with_variants(path, &self.deps.config.known_prefixes),
            };
            match found {
                Some((found_path, content)) => diag_context.push_str(&format!(
                    "### file: {}\n{}\n\n",
                    found_path,
                    truncate_output(&content, MAX_DIAG_FILE_CHARS)
                )),
                None => diag_context.push_str(&format!("### file: {}\n(does not exist)\n\n", path)),
            }
        }

        let user = format!(
            "FAILED TASK:\n{}\nERROR:\n{}\n\nDIAGNOSIS:\nRoot cause: {}\nFix approach: {}\n\nDIAGNOSTIC CONTEXT:\n{}",
            describe_task(step),
            error,
            diagnosis.root_cause,
            diagnosis.fix_approach,
            if diag_context.is_empty() { "(nothing found)\n".to_string() } else { diag_context }
        );
        let request = LlmRequest::new(Model::Smart, prompts::DIAGNOSE_FIX_SYSTEM, user).json();
        let response = self.deps.complete(&mut state.budget, request).await?;
        self.write_response(state, &response.content)
    }

    async fn decompose(&self, state: &mut SessionState, step: &PlanStep, error: &str) -> anyhow::Result<Vec<String>> {
        let user = format!(
            "FAILED TASK:\n{}\nUSER REQUEST:\n{}\n\nLAST ERROR:\n{}\n",
            describe_task(step),
            state.request,
            error
        );
        let request = LlmRequest::new(Model::Speed, prompts::DECOMPOSE_SYSTEM, user).json();
        let response = self.deps.complete(&mut state.budget, request).await?;
        let plan: Decomposition = parse_structured_content(&response.content)?;

        let subtasks: Vec<Subtask> = plan
            .subtasks
            .into_iter()
            .filter(|s| !s.path.trim().is_empty())
            .take(MAX_SUBTASKS)
            .collect();
        if subtasks.is_empty() {
            anyhow::bail!("Decomposition produced no sub-tasks");
        }

        let mut written: Vec<(String, String)> = Vec::new();
        let mut failures = Vec::new();
        for (idx, subtask) in subtasks.iter().enumerate() {
            if state.budget.is_exceeded() {
                failures.push(format!("{}: token budget exceeded", subtask.path));
                break;
            }
            let mut user = format!(
                "OVERALL GOAL:\n{}\n\nSUB-TASK {} of {}: write {}\n{}\n",
                state.request,
                idx + 1,
                subtasks.len(),
                subtask.path,
                subtask.description
            );
            if !written.is_empty() {
                user.push_str("\nFILES ALREADY WRITTEN FOR THIS CHANGE:\n");
                for (path, content) in &written {
                    user.push_str(&format!("\n// FILE: {}\n{}\n", path, content));
                }
            }

            let request = LlmRequest::new(Model::Smart, prompts::SUBTASK_SYSTEM, user);
            let result = match self.deps.complete(&mut state.budget, request).await {
                Ok(response) => {
                    let body = strip_code_fences(&response.content);
                    if body.trim().is_empty() {
                        Err(anyhow::anyhow!("empty output"))
                    } else {
                        let content = format!("{}\n", body.trim_end());
                        state
                            .write_file(&self.deps.workspace, &subtask.path, &content, &subtask.description)
                            .map(|()| content)
                    }
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(content) => written.push((normalize_rel_path(&subtask.path), content)),
                Err(err) => failures.push(format!("{}: {}", subtask.path, err)),
            }
        }

        if written.is_empty() {
            anyhow::bail!("No sub-task produced a file: {}", failures.join("; "));
        }
        if !failures.is_empty() {
            warn!(step = %step.id, failed = failures.len(), "partial decomposition");
        }
        Ok(written.into_iter().map(|(path, _)| path).collect())
    }

    /// Ask for replacement steps after repeated failures. Returned steps
    /// are pending and carry ids that do not collide with `plan`.
    pub async fn replan(&self, state: &mut SessionState, plan: &ExecutionPlan) -> anyhow::Result<Vec<PlanStep>> {
        let mut user = format!("ORIGINAL REQUEST:\n{}\n\nSUCCEEDED:\n", state.request);
        for step in plan.steps.iter().filter(|s| s.status == StepStatus::Done) {
            user.push_str(&format!("- {} [{}]: {}\n", step.title, step.action.name(), one_line(&step.detail)));
        }
        user.push_str("\nFAILED:\n");
        for step in plan.steps.iter().filter(|s| s.status == StepStatus::Failed) {
            user.push_str(&format!(
                "- {} [{}]\n{}\n{}\n",
                step.title,
                step.action.name(),
                serde_json::to_string(&step.action).unwrap_or_default(),
                step.detail
            ));
        }
        let produced = state.touched_files();
        if !produced.is_empty() {
            user.push_str(&format!("\nFILES WRITTEN SO FAR: {}\n", produced.join(", ")));
        }

        let request = LlmRequest::new(Model::Speed, prompts::REPLAN_SYSTEM, user).json();
        let response = self.deps.complete(&mut state.budget, request).await?;
        let value = parse_json_object(&response.content)?;
        let (revised, report) = ExecutionPlan::from_value(&value);
        if !report.dropped.is_empty() {
            warn!(dropped = ?report.dropped, "re-plan dropped steps with unknown actions");
        }

        let mut taken: HashSet<String> = plan.steps.iter().map(|s| s.id.clone()).collect();
        let mut steps = Vec::with_capacity(revised.steps.len());
        for (idx, mut step) in revised.steps.into_iter().enumerate() {
            let mut n = idx + 1;
            while taken.contains(&step.id) {
                step.id = format!("replan-{}", n);
                n += 1;
            }
            taken.insert(step.id.clone());
            steps.push(step);
        }
        info!(steps = steps.len(), "re-plan produced");
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::EventSink;
    use crate::plan::StepAction;
    use crate::test_support::{deps, ScriptedLlm};
    use crate::workspace::Workspace;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn failed_step() -> PlanStep {
        PlanStep::new(
            "s1",
            "Pricing component",
            StepAction::GenerateComponent {
                path: "src/Pricing.tsx".to_string(),
                description: "pricing table".to_string(),
            },
        )
    }

    fn state(limit: u64) -> SessionState {
        SessionState::new("add pricing", Vec::new(), limit, EventSink::silent())
    }

    #[tokio::test]
    async fn test_first_strategy_success() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"files":[{"path":"src/Pricing.tsx","content":"export function Pricing() {}\n","description":"fixed"}]}"#,
        ]));
        let engine = RetryEngine::new(deps(dir.path(), llm.clone()));
        let mut state = state(10_000);

        let outcome = engine.recover(&mut state, &failed_step(), "Unexpected token").await;
        assert!(outcome.success);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.detail.contains("strategy 1"));
        assert_eq!(outcome.files, vec!["src/Pricing.tsx".to_string()]);
        assert!(llm.calls()[0].user.contains("Unexpected token"));
    }

    #[tokio::test]
    async fn test_third_strategy_success_after_two_failures() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("src/types.ts", "export type Plan = { id: string };\n").unwrap();

        let llm = Arc::new(ScriptedLlm::new([
            "I could not do it",
            r#"{"rootCause":"missing type","searchQueries":["type Plan"],"filesToRead":["types.ts"],"fixApproach":"import it"}"#,
            r#"{"files":[]}"#,
            r#"{"subtasks":[{"path":"src/lib/plans.ts","description":"plan data"},{"path":"src/Pricing.tsx","description":"component"}]}"#,
            "export const plans = [];",
            "```tsx\nimport { plans } from './lib/plans';\nexport function Pricing() {}\n```",
        ]));
        let engine = RetryEngine::new(deps(dir.path(), llm.clone()));
        let mut state = state(10_000);

        let outcome = engine.recover(&mut state, &failed_step(), "boom").await;
        assert!(outcome.success);
        assert!(outcome.detail.contains("strategy 3"));
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts[..2].iter().all(|a| a.error.is_some()));
        assert_eq!(
            outcome.files,
            vec!["src/lib/plans.ts".to_string(), "src/Pricing.tsx".to_string()]
        );

        let calls = llm.calls();
        assert!(calls[2].user.contains("### search: type Plan"));
        assert!(calls[2].user.contains("### file: src/types.ts"));
        assert!(calls[5].user.contains("export const plans = [];"));
        assert_eq!(
            ws.read("src/Pricing.tsx").unwrap(),
            "import { plans } from './lib/plans';\nexport function Pricing() {}\n"
        );
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(
            ScriptedLlm::new(["nope"])
                .fail("provider timeout")
                .reply(r#"{"subtasks":[]}"#),
        );
        let engine = RetryEngine::new(deps(dir.path(), llm));
        let mut state = state(10_000);

        let outcome = engine.recover(&mut state, &failed_step(), "boom").await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts.len(), 3);
        let entries: Vec<&str> = outcome
            .detail
            .lines()
            .filter(|l| l.starts_with("strategy "))
            .collect();
        assert_eq!(entries.len(), 3);
        assert!(entries[1].contains("provider timeout"));
        assert!(entries[2].contains("no sub-tasks"));
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_strategies() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let engine = RetryEngine::new(deps(dir.path(), llm.clone()));
        let mut state = state(0);

        let outcome = engine.recover(&mut state, &failed_step(), "boom").await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.detail.contains("token budget exceeded"));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_replan_assigns_fresh_ids() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"steps":[
                {"id":"s1","title":"Simpler page","action":"generate_component","path":"src/Simple.tsx","description":"simpler"},
                {"title":"Nonsense","action":"levitate"}
            ]}"#,
        ]));
        let engine = RetryEngine::new(deps(dir.path(), llm.clone()));
        let mut state = state(10_000);

        let mut plan = ExecutionPlan::fallback_chat("", "");
        plan.steps = vec![failed_step(), PlanStep::new("s2", "Other", StepAction::ReadFile { path: "x".to_string() })];
        plan.steps[0].status = StepStatus::Failed;
        plan.steps[0].detail = "All 3 recovery strategies failed".to_string();
        plan.steps[1].status = StepStatus::Done;

        let steps = engine.replan(&mut state, &plan).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, "replan-1");
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert!(llm.calls()[0].user.contains("FAILED:\n- Pricing component"));
    }
}
