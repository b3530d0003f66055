//! Error taxonomy for agent sessions.
//!
//! Plumbing code returns `anyhow::Result`; anything that drives a policy
//! decision (skip retries, stop the loop, reject a single file) is raised as
//! an [`AgentError`] and recovered with `downcast_ref` at the decision point.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The planner response was not valid JSON. Callers fall back to a chat step.
    #[error("Plan response could not be parsed: {0}")]
    PlanParse(String),
    /// A step handler failed; routed to the retry engine.
    #[error("Step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },
    /// The session token ceiling was crossed.
    #[error("Token budget exceeded ({spent} / {limit} tokens)")]
    BudgetExceeded { spent: u64, limit: u64 },
    /// A path resolved outside the project root.
    #[error("Path escapes project root: {path}")]
    PathEscape { path: String },
    /// Shell command outside the allowlist or carrying metacharacters.
    #[error("Command not allowed: {command} ({reason})")]
    CommandNotAllowed { command: String, reason: String },
    /// Version-control operation failed.
    #[error("Git {operation} failed: {message}")]
    GitOperation { operation: String, message: String },
    /// Every recovery strategy failed for a step.
    #[error("All recovery strategies failed for '{step}':\n{log}")]
    ExhaustedRetries { step: String, log: String },
}

impl AgentError {
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn not_allowed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::CommandNotAllowed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn git(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AgentError::GitOperation {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Failures that must not be handed to the retry engine.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AgentError::CommandNotAllowed { .. }
                | AgentError::BudgetExceeded { .. }
                | AgentError::PathEscape { .. }
        )
    }
}

/// Whether an arbitrary step error may be escalated to the retry engine.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AgentError>()
        .map(AgentError::is_retryable)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_not_allowed_is_not_retryable() {
        let err = anyhow::Error::new(AgentError::not_allowed("rm -rf /", "not allowlisted"));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_plain_errors_are_retryable() {
        let err = anyhow::anyhow!("LLM returned garbage");
        assert!(is_retryable(&err));
        let err = anyhow::Error::new(AgentError::step("s1", "boom"));
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_display_includes_context() {
        let err = AgentError::BudgetExceeded {
            spent: 120,
            limit: 100,
        };
        assert_eq!(err.to_string(), "Token budget exceeded (120 / 100 tokens)");
    }
}
