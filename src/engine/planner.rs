//! Plan Engine: one planning call, tolerant parsing, validation.

use super::AgentDeps;
use crate::budget::TokenBudget;
use crate::context::ProjectScan;
use crate::error::AgentError;
use crate::llm::{parse_json_object, prompts, ChatMessage, LlmRequest, Model};
use crate::plan::{ExecutionPlan, ValidationReport};
use crate::util::truncate;
use tracing::{info, warn};

const MAX_HISTORY_MESSAGE_CHARS: usize = 2_000;

/// Keep the last `window` messages, each capped.
pub fn trim_history(history: &[ChatMessage], window: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|m| ChatMessage {
            role: m.role.clone(),
            content: truncate(&m.content, MAX_HISTORY_MESSAGE_CHARS),
        })
        .collect()
}

pub struct Planner {
    deps: AgentDeps,
}

impl Planner {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    fn build_prompt(&self, message: &str, open_file: Option<&str>, generated: &[String]) -> String {
        let scan = ProjectScan::scan(&self.deps.workspace);
        let mut prompt = String::new();
        prompt.push_str(&scan.render());
        if let Some(open) = open_file {
            prompt.push_str(&format!("\nCURRENTLY OPEN FILE: {}\n", open));
        }
        if !generated.is_empty() {
            prompt.push_str("\nFILES ALREADY PRODUCED IN THIS CONVERSATION:\n");
            for path in generated {
                prompt.push_str(&format!("- {}\n", path));
            }
        }
        prompt.push_str(&format!("\nREQUEST:\n{}\n", message));
        prompt
    }

    /// Produce a validated plan. An unparseable response becomes a single
    /// chat step; only a failed LLM call is an error.
    pub async fn plan(
        &self,
        budget: &mut TokenBudget,
        message: &str,
        history: &[ChatMessage],
        open_file: Option<&str>,
        generated: &[String],
    ) -> anyhow::Result<(ExecutionPlan, ValidationReport)> {
        let history = trim_history(history, self.deps.config.history_window);
        let request = LlmRequest::new(
            Model::Speed,
            prompts::PLANNER_SYSTEM,
            self.build_prompt(message, open_file, generated),
        )
        .with_history(&history)
        .json();

        let response = self.deps.complete(budget, request).await?;
        let (mut plan, report) = match parse_json_object(&response.content) {
            Ok(value) => ExecutionPlan::from_value(&value),
            Err(err) => {
                let err = AgentError::PlanParse(err.to_string());
                warn!(error = %err, "falling back to chat");
                (
                    ExecutionPlan::fallback_chat("", &err.to_string()),
                    ValidationReport::default(),
                )
            }
        };

        if !report.dropped.is_empty() {
            warn!(dropped = ?report.dropped, "dropped steps with unknown actions");
        }
        let corrected = plan.auto_correct(message, open_file);
        if plan.steps.is_empty() && plan.clarify_question.is_none() {
            plan = ExecutionPlan::fallback_chat("", "planner returned no runnable steps");
        }

        info!(
            intent = ?plan.intent,
            confidence = plan.confidence,
            steps = plan.steps.len(),
            corrected,
            "plan produced"
        );
        Ok((plan, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Intent, StepAction};
    use crate::test_support::{deps, ScriptedLlm};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_trim_history_keeps_recent_and_caps_length() {
        let history: Vec<ChatMessage> = (0..15)
            .map(|i| ChatMessage::user(format!("{}{}", i, "x".repeat(3_000))))
            .collect();
        let trimmed = trim_history(&history, 10);
        assert_eq!(trimmed.len(), 10);
        assert!(trimmed[0].content.starts_with('5'));
        assert!(trimmed.iter().all(|m| m.content.chars().count() <= 2_003));
    }

    #[tokio::test]
    async fn test_plan_is_validated_and_charged() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"dependencies":{"next":"14"}}"#).unwrap();
        let llm = Arc::new(ScriptedLlm::new([r#"```json
{"intent":"build","confidence":95,"summary":"Add page","steps":[
  {"id":"s1","title":"Page","action":"generate_component","path":"src/app/about/page.tsx","description":"About page"},
  {"id":"s2","title":"Bogus","action":"teleport"}
]}
```"#]));
        let planner = Planner::new(deps(dir.path(), llm.clone()));
        let mut budget = TokenBudget::new(1_000);

        let (plan, report) = planner
            .plan(&mut budget, "add an about page", &[], None, &[])
            .await
            .unwrap();
        assert_eq!(plan.intent, Intent::Build);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(report.dropped, vec!["teleport".to_string()]);
        assert_eq!(budget.spent(), 10);

        let calls = llm.calls();
        assert_eq!(calls[0].model, Model::Speed);
        assert!(calls[0].user.contains("package.json"));
        assert!(calls[0].user.contains("add an about page"));
    }

    #[tokio::test]
    async fn test_unparseable_plan_falls_back_to_chat() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(["Sure! I can help with that."]));
        let planner = Planner::new(deps(dir.path(), llm));
        let mut budget = TokenBudget::new(1_000);

        let (plan, _) = planner.plan(&mut budget, "hello", &[], None, &[]).await.unwrap();
        assert_eq!(plan.intent, Intent::Chat);
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(plan.steps[0].action, StepAction::Chat { .. }));
    }

    #[tokio::test]
    async fn test_open_file_creation_request_is_corrected() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new([r#"{"intent":"build","confidence":93,"steps":[
  {"action":"modify_file","path":"src/app/page.tsx","instruction":"pricing table"}
]}"#]));
        let planner = Planner::new(deps(dir.path(), llm));
        let mut budget = TokenBudget::new(1_000);

        let (plan, _) = planner
            .plan(&mut budget, "Create a pricing table", &[], Some("src/app/page.tsx"), &[])
            .await
            .unwrap();
        assert_eq!(plan.steps[0].action.target_paths(), vec!["src/app/PricingTable.tsx".to_string()]);
    }

    #[tokio::test]
    async fn test_llm_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()).fail("provider down"));
        let planner = Planner::new(deps(dir.path(), llm));
        let mut budget = TokenBudget::new(1_000);
        assert!(planner.plan(&mut budget, "hi", &[], None, &[]).await.is_err());
    }
}
