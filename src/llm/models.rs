use crate::config::ModelIds;
use serde::{Deserialize, Serialize};

/// Model tiers. Concrete ids come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    /// Speed tier - planning, diagnosis, decomposition, re-planning
    Speed,
    /// Balanced tier - conversational replies
    Balanced,
    /// Smart tier - code generation and patching
    Smart,
    /// Reviewer tier - functional verification of the finished change
    Reviewer,
}

impl Model {
    pub fn id<'a>(&self, ids: &'a ModelIds) -> &'a str {
        match self {
            Model::Speed => &ids.speed,
            Model::Balanced => &ids.balanced,
            Model::Smart => &ids.smart,
            Model::Reviewer => &ids.reviewer,
        }
    }

    /// Output-token cap per tier.
    pub fn max_tokens(&self) -> u32 {
        match self {
            Model::Speed => 4_096,
            Model::Balanced => 4_096,
            Model::Smart => 16_384,
            Model::Reviewer => 8_192,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Model::Speed => "speed",
            Model::Balanced => "balanced",
            Model::Smart => "smart",
            Model::Reviewer => "reviewer",
        }
    }
}

/// API usage information from OpenRouter
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by OpenRouter.
    /// OpenRouter returns this as `total_cost` in the usage object.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost: None,
        }
    }

    /// Tokens billed for this call. Some providers omit `total_tokens`.
    pub fn tokens(&self) -> u64 {
        let summed = u64::from(self.prompt_tokens) + u64::from(self.completion_tokens);
        u64::from(self.total_tokens).max(summed)
    }

    /// Cost reported by the provider, or 0.0. Costs are never estimated.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}
