//! Backend-needs analysis for `delegate_backend` steps.
//!
//! Scans the files produced so far for things the frontend expects from a
//! backend that the project does not have yet. Missing routes and data files
//! can be created automatically; environment variables need a human.

use crate::util::{cached_regex, normalize_rel_path};
use crate::workspace::Workspace;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendTask {
    /// A local API route is called but no handler exists.
    CreateApi { route: String, path: String },
    /// A JSON data file is referenced but missing; seeded with `[]`.
    SeedData { path: String },
    /// An environment variable is read but not declared in any env file.
    EnvVar { name: String },
}

impl BackendTask {
    pub fn is_auto(&self) -> bool {
        !matches!(self, BackendTask::EnvVar { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            BackendTask::CreateApi { route, path } => format!("Create handler for {} at {}", route, path),
            BackendTask::SeedData { path } => format!("Seed {} with an empty list", path),
            BackendTask::EnvVar { name } => format!("Set {} in .env.local", name),
        }
    }
}

fn api_call_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r#"['"`](/api/[A-Za-z0-9_\-/\[\]]+)"#)
}

fn data_file_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r#"['"`]((?:\./|/)?(?:data|db)/[A-Za-z0-9_\-/.]+\.json)['"`]"#)
}

fn env_var_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?:process\.env|import\.meta\.env)\.([A-Z][A-Z0-9_]*)")
}

const ENV_FILES: &[&str] = &[".env", ".env.local", ".env.example", ".env.development"];
const BUILTIN_ENV: &[&str] = &["NODE_ENV", "PORT", "VERCEL", "CI", "MODE", "DEV", "PROD"];

/// Where handler files for `route` could live.
fn handler_candidates(route: &str) -> Vec<String> {
    let rest = route.trim_start_matches("/api/").trim_end_matches('/');
    let mut out = Vec::new();
    for base in ["app/api", "src/app/api"] {
        for ext in ["ts", "js"] {
            out.push(format!("{}/{}/route.{}", base, rest, ext));
        }
    }
    for base in ["pages/api", "src/pages/api"] {
        for ext in ["ts", "js"] {
            out.push(format!("{}/{}.{}", base, rest, ext));
            out.push(format!("{}/{}/index.{}", base, rest, ext));
        }
    }
    out
}

fn app_router_base(ws: &Workspace) -> &'static str {
    match ws.resolve("src/app") {
        Ok(p) if p.is_dir() => "src/app",
        _ => "app",
    }
}

/// Analyse `files` (path, content) against the workspace.
pub fn analyze(ws: &Workspace, files: &[(String, String)]) -> Vec<BackendTask> {
    let produced: BTreeSet<String> = files.iter().map(|(p, _)| normalize_rel_path(p)).collect();
    let exists = |path: &str| produced.contains(path) || ws.exists(path);

    let mut routes = BTreeSet::new();
    let mut data_files = BTreeSet::new();
    let mut env_vars = BTreeSet::new();

    for (_, content) in files {
        if let Some(re) = api_call_regex() {
            for cap in re.captures_iter(content) {
                let route = cap[1].trim_end_matches('/').to_string();
                // Dynamic segments are created by hand.
                if !route.contains('[') {
                    routes.insert(route);
                }
            }
        }
        if let Some(re) = data_file_regex() {
            for cap in re.captures_iter(content) {
                data_files.insert(normalize_rel_path(cap[1].trim_start_matches('/')));
            }
        }
        if let Some(re) = env_var_regex() {
            for cap in re.captures_iter(content) {
                env_vars.insert(cap[1].to_string());
            }
        }
    }

    let mut tasks = Vec::new();
    let base = app_router_base(ws);
    for route in routes {
        if handler_candidates(&route).iter().any(|c| exists(c)) {
            continue;
        }
        let rest = route.trim_start_matches("/api/");
        tasks.push(BackendTask::CreateApi {
            path: format!("{}/api/{}/route.ts", base, rest),
            route,
        });
    }
    for path in data_files {
        if !exists(&path) {
            tasks.push(BackendTask::SeedData { path });
        }
    }

    let declared: String = ENV_FILES
        .iter()
        .filter_map(|f| ws.read(f).ok())
        .collect::<Vec<_>>()
        .join("\n");
    for name in env_vars {
        if BUILTIN_ENV.contains(&name.as_str()) {
            continue;
        }
        let is_declared = declared
            .lines()
            .any(|line| line.trim_start().starts_with(&format!("{}=", name)));
        if !is_declared {
            tasks.push(BackendTask::EnvVar { name });
        }
    }
    tasks
}
