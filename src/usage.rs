//! Flat-file usage bookkeeping.
//!
//! The whole store is read and rewritten on every update. Daily counters
//! roll over on the first write of a new UTC day.

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStats {
    /// Date string (YYYY-MM-DD) the daily counters belong to
    pub day: Option<String>,
    pub sessions_today: u32,
    pub tokens_today: u64,
    pub cost_today: f64,
    pub total_sessions: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl UsageStats {
    fn ensure_daily_rollover(&mut self, today: NaiveDate) {
        let today = today.to_string();
        if self.day.as_deref() != Some(today.as_str()) {
            self.sessions_today = 0;
            self.tokens_today = 0;
            self.cost_today = 0.0;
            self.day = Some(today);
        }
    }
}

pub struct UsageStore {
    path: PathBuf,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current stats; a missing or unreadable file reads as empty.
    pub fn load(&self) -> UsageStats {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn record_session(&self, tokens: u64, cost: f64) -> anyhow::Result<UsageStats> {
        self.record_session_on(chrono::Utc::now().date_naive(), tokens, cost)
    }

    pub fn record_session_on(&self, day: NaiveDate, tokens: u64, cost: f64) -> anyhow::Result<UsageStats> {
        let mut stats = self.load();
        stats.ensure_daily_rollover(day);
        stats.sessions_today += 1;
        stats.tokens_today = stats.tokens_today.saturating_add(tokens);
        stats.cost_today += cost;
        stats.total_sessions += 1;
        stats.total_tokens = stats.total_tokens.saturating_add(tokens);
        stats.total_cost += cost;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&stats)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(stats)
    }
}
