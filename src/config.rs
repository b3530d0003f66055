//! Configuration management for mender
//!
//! Stores settings in ~/.config/mender/config.json. Environment variables
//! override the file for secrets and the token ceiling.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Default OpenRouter-compatible chat completions endpoint.
pub const DEFAULT_LLM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
/// Default Brave-compatible web search endpoint.
pub const DEFAULT_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelIds {
    pub speed: String,
    pub balanced: String,
    pub smart: String,
    pub reviewer: String,
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            speed: "openai/gpt-oss-120b".to_string(),
            balanced: "anthropic/claude-sonnet-4.5".to_string(),
            smart: "anthropic/claude-opus-4.5".to_string(),
            reviewer: "openai/gpt-5.2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openrouter_api_key: Option<String>,
    pub llm_base_url: String,
    pub search_api_key: Option<String>,
    pub search_base_url: String,
    pub models: ModelIds,
    /// Hard per-session token ceiling, checked before every step.
    pub max_token_budget: u64,
    /// Plans below this confidence that carry a question stop and ask.
    pub confidence_threshold: u8,
    /// Number of prior conversation messages sent to the planner.
    pub history_window: usize,
    /// Sessions allowed per endpoint per minute.
    pub rate_limit_per_minute: u32,
    pub package_manager: String,
    pub command_timeout_secs: u64,
    /// Prefixes tried when a model-supplied path is not found verbatim.
    pub known_prefixes: Vec<String>,
    pub smoke_base_url: String,
    pub smoke_timeout_secs: u64,
    /// Commit produced files once the session's steps settle.
    pub auto_commit: bool,
    pub usage_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            llm_base_url: DEFAULT_LLM_URL.to_string(),
            search_api_key: None,
            search_base_url: DEFAULT_SEARCH_URL.to_string(),
            models: ModelIds::default(),
            max_token_budget: 250_000,
            confidence_threshold: 90,
            history_window: 10,
            rate_limit_per_minute: 6,
            package_manager: "npm".to_string(),
            command_timeout_secs: 120,
            known_prefixes: vec!["src/".to_string(), "app/".to_string(), "client/".to_string()],
            smoke_base_url: "http://127.0.0.1:3000".to_string(),
            smoke_timeout_secs: 5,
            auto_commit: false,
            usage_file: None,
        }
    }
}

impl Config {
    fn sanitize(&mut self) {
        self.confidence_threshold = self.confidence_threshold.min(100);
        if self.history_window == 0 {
            self.history_window = 1;
        }
        if self.package_manager.trim().is_empty() {
            self.package_manager = "npm".to_string();
        }
        if self.command_timeout_secs == 0 {
            self.command_timeout_secs = 120;
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mender"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk (or defaults), then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        config.apply_env_overrides();
        config.sanitize();
        config
    }

    fn load_file() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str::<Config>(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        warn!(
                            error = %err,
                            path = %path.display(),
                            "config file was corrupted; backup saved and defaults loaded"
                        );
                    }
                }
            }
        }
        Self::default()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.openrouter_api_key = Some(key);
        }
        if let Some(key) = lookup("MENDER_SEARCH_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.search_api_key = Some(key);
        }
        if let Some(budget) = lookup("MAX_TOKEN_BUDGET").and_then(|v| v.trim().parse().ok()) {
            self.max_token_budget = budget;
        }
        if let Some(url) = lookup("MENDER_SMOKE_BASE_URL").filter(|u| !u.trim().is_empty()) {
            self.smoke_base_url = url;
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let mut sanitized = self.clone();
        sanitized.sanitize();
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                warn!(error = %e, "failed to set config directory permissions");
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(&sanitized)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.openrouter_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }

    /// Where usage bookkeeping lives.
    pub fn usage_path(&self) -> Option<PathBuf> {
        self.usage_file
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join("mender").join("usage.json")))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/mender/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        warn!(error = %e, "failed to set temp config file permissions");
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
