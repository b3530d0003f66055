//! The agent loop: planning, step execution, recovery, verification and the
//! session that sequences them.

pub mod backend;
pub mod events;
pub mod executor;
pub mod patcher;
pub mod planner;
pub mod retry;
pub mod session;
pub mod verify;

use crate::budget::TokenBudget;
use crate::config::Config;
use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::research::SearchProvider;
use crate::workspace::Workspace;
use std::sync::Arc;
use tracing::debug;

pub use events::{EventSink, FileKind, SessionEvent};
pub use executor::{ProducedFile, SessionState, StepExecutor, StepOutcome};
pub use planner::Planner;
pub use retry::{RetryAttempt, RetryEngine, RetryOutcome};
pub use session::{ExecutedStep, Session, SessionRequest, SessionResult, SessionStatus};
pub use verify::{Severity, TestCategory, TestReport, TestResult, Verifier};

/// Collaborators shared by every engine service.
#[derive(Clone)]
pub struct AgentDeps {
    pub llm: Arc<dyn LlmClient>,
    pub search: Option<Arc<dyn SearchProvider>>,
    pub workspace: Arc<Workspace>,
    pub config: Arc<Config>,
}

impl AgentDeps {
    pub fn new(llm: Arc<dyn LlmClient>, workspace: Workspace, config: Config) -> Self {
        Self {
            llm,
            search: None,
            workspace: Arc::new(workspace),
            config: Arc::new(config),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    /// One LLM call, charged to `budget` whether or not the caller can use
    /// the response.
    pub async fn complete(&self, budget: &mut TokenBudget, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        let response = self.llm.complete(&request).await?;
        budget.record(response.usage.as_ref());
        debug!(
            model = request.model.label(),
            spent = budget.spent(),
            limit = budget.limit(),
            "llm call"
        );
        Ok(response)
    }
}
