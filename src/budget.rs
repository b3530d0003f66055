//! Session token ceiling and cost ledger.

use crate::error::AgentError;
use crate::llm::Usage;
use serde::Serialize;

/// Tokens and provider-reported cost accumulated across one session.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBudget {
    limit: u64,
    spent: u64,
    cost_usd: f64,
    calls: u32,
}

/// Serializable view reported with the session result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub spent: u64,
    pub limit: u64,
    pub cost_usd: f64,
    pub calls: u32,
    pub exceeded: bool,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            spent: 0,
            cost_usd: 0.0,
            calls: 0,
        }
    }

    /// Record one LLM call. Calls that report no usage still count.
    pub fn record(&mut self, usage: Option<&Usage>) {
        self.calls += 1;
        if let Some(usage) = usage {
            self.spent = self.spent.saturating_add(usage.tokens());
            self.cost_usd += usage.cost();
        }
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.spent)
    }

    /// The ceiling is hard: reaching it is enough.
    pub fn is_exceeded(&self) -> bool {
        self.spent >= self.limit
    }

    /// Gate checked before starting a step.
    pub fn check(&self) -> Result<(), AgentError> {
        if self.is_exceeded() {
            Err(AgentError::BudgetExceeded {
                spent: self.spent,
                limit: self.limit,
            })
        } else {
            Ok(())
        }
    }

    pub fn report(&self) -> BudgetReport {
        BudgetReport {
            spent: self.spent,
            limit: self.limit,
            cost_usd: self.cost_usd,
            calls: self.calls,
            exceeded: self.is_exceeded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_accumulates_tokens_and_cost() {
        let mut budget = TokenBudget::new(1_000);
        let mut usage = Usage::new(100, 50);
        usage.cost = Some(0.01);
        budget.record(Some(&usage));
        budget.record(None);
        let report = budget.report();
        assert_eq!(report.spent, 150);
        assert_eq!(report.calls, 2);
        assert!((report.cost_usd - 0.01).abs() < f64::EPSILON);
        assert_eq!(budget.remaining(), 850);
        assert!(budget.check().is_ok());
    }

    #[test]
    fn test_budget_check_fails_once_ceiling_reached() {
        let mut budget = TokenBudget::new(150);
        budget.record(Some(&Usage::new(100, 50)));
        let err = budget.check().unwrap_err();
        assert_eq!(
            err,
            AgentError::BudgetExceeded {
                spent: 150,
                limit: 150
            }
        );
        assert!(!err.is_retryable());
    }
}
