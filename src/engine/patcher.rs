//! Model-driven half of the Patch Engine.
//!
//! Asks for line-numbered edits first and applies them with
//! [`crate::patch::apply_edits`]. When nothing parses or nothing applies, one
//! full-file rewrite is requested instead and passed through the duplicate
//! export guard.

use super::AgentDeps;
use crate::budget::TokenBudget;
use crate::llm::{parse_json_object, prompts, LlmRequest, Model};
use crate::patch::{apply_edits, dedup_rewrite, number_lines, EditSet};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    LineEdits,
    Rewrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    pub content: String,
    pub strategy: PatchStrategy,
    pub applied: usize,
}

pub struct Patcher {
    deps: AgentDeps,
}

impl Patcher {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    pub async fn patch(
        &self,
        budget: &mut TokenBudget,
        path: &str,
        original: &str,
        instruction: &str,
        context: &str,
    ) -> anyhow::Result<PatchResult> {
        let mut user = format!(
            "FILE: {}\n\n{}\n\nINSTRUCTION:\n{}\n",
            path,
            number_lines(original),
            instruction
        );
        if !context.trim().is_empty() {
            user.push_str(&format!("\nCONTEXT:\n{}\n", context));
        }
        let request = LlmRequest::new(Model::Smart, prompts::PATCH_EDIT_SYSTEM, user).json();
        let response = self.deps.complete(budget, request).await?;

        match parse_json_object(&response.content) {
            Ok(value) => {
                let set = EditSet::from_value(&value);
                let outcome = apply_edits(original, &set);
                debug!(
                    path,
                    applied = outcome.applied,
                    skipped = outcome.skipped,
                    rejected = set.rejected,
                    imports = outcome.imports_added,
                    "line edits"
                );
                // Imports alone only count when the model asked for nothing else.
                let imports_only = set.edits.is_empty() && set.rejected == 0 && outcome.imports_added > 0;
                if outcome.applied > 0 || imports_only {
                    return Ok(PatchResult {
                        content: outcome.content,
                        strategy: PatchStrategy::LineEdits,
                        applied: outcome.applied + outcome.imports_added,
                    });
                }
            }
            Err(err) => debug!(path, error = %err, "edit response did not parse"),
        }

        info!(path, "line edits unusable, requesting full rewrite");
        self.rewrite(budget, path, original, instruction).await
    }

    async fn rewrite(
        &self,
        budget: &mut TokenBudget,
        path: &str,
        original: &str,
        instruction: &str,
    ) -> anyhow::Result<PatchResult> {
        let user = format!(
            "FILE: {}\n\nINSTRUCTION:\n{}\n\nCURRENT CONTENT:\n{}\n",
            path, instruction, original
        );
        let request = LlmRequest::new(Model::Smart, prompts::PATCH_REWRITE_SYSTEM, user);
        let response = self.deps.complete(budget, request).await?;

        let content = dedup_rewrite(&response.content);
        if content.trim().is_empty() {
            anyhow::bail!("Rewrite of {} came back empty", path);
        }
        if content.trim_end() == original.trim_end() {
            anyhow::bail!("Rewrite of {} made no changes", path);
        }
        Ok(PatchResult {
            content,
            strategy: PatchStrategy::Rewrite,
            applied: 1,
        })
    }
}
