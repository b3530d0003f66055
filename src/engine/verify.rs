//! Verification Agent
//!
//! Three layers over the files a session produced:
//! - static: deterministic pattern checks, no model
//! - api-smoke: live GET probes against routes found in handler modules
//! - functional: one reviewer-tier call judging the diff against the request
//!
//! Results are advisory; nothing here blocks or undoes a session.

use super::executor::ProducedFile;
use super::AgentDeps;
use crate::budget::TokenBudget;
use crate::diff::unified_diff;
use crate::llm::{parse_structured_content, prompts, LlmRequest, Model};
use crate::util::{cached_regex, truncate, truncate_output};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_ROUTES_PER_MODULE: usize = 5;
const MIN_FINDINGS: usize = 3;
const MAX_FINDINGS: usize = 8;
const MAX_ANY_ANNOTATIONS: usize = 3;
const MAX_DIFF_CHARS: usize = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestCategory {
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "api-smoke")]
    ApiSmoke,
    #[serde(rename = "functional")]
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Pass,
    Warn,
    Fail,
}

impl Severity {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pass" | "ok" | "info" => Severity::Pass,
            "fail" | "error" | "critical" | "high" => Severity::Fail,
            _ => Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    pub id: String,
    pub category: TestCategory,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub warnings: usize,
    pub failures: usize,
    pub duration_ms: u64,
    pub summary: String,
}

impl TestReport {
    fn from_results(results: Vec<TestResult>, files: usize, elapsed: Duration) -> Self {
        let count = |s: Severity| results.iter().filter(|r| r.severity == s).count();
        let (passed, warnings, failures) = (count(Severity::Pass), count(Severity::Warn), count(Severity::Fail));
        Self {
            summary: format!(
                "{} passed, {} warning(s), {} failure(s) across {} file(s)",
                passed, warnings, failures, files
            ),
            results,
            passed,
            warnings,
            failures,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Accumulates results with sequential ids per category.
#[derive(Default)]
struct Results {
    items: Vec<TestResult>,
}

impl Results {
    fn push(
        &mut self,
        category: TestCategory,
        severity: Severity,
        title: impl Into<String>,
        detail: impl Into<String>,
        file: Option<&str>,
        line: Option<usize>,
    ) {
        let prefix = match category {
            TestCategory::Static => "static",
            TestCategory::ApiSmoke => "smoke",
            TestCategory::Functional => "functional",
        };
        let n = self.items.iter().filter(|r| r.category == category).count() + 1;
        self.items.push(TestResult {
            id: format!("{}-{}", prefix, n),
            category,
            severity,
            title: title.into(),
            detail: detail.into(),
            file: file.map(str::to_string),
            line,
        });
    }
}

fn is_script(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs")
    )
}

fn is_component(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("tsx" | "jsx")
    )
}

fn line_of(content: &str, needle: &str) -> Option<usize> {
    content.lines().position(|l| l.contains(needle)).map(|i| i + 1)
}

fn network_call_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"\bfetch\s*\(|\baxios(?:\.[a-z]+)?\s*\(")
}

fn try_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"\btry\s*\{")
}

fn catch_call_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"\.catch\s*\(")
}

/// Whether the call at `start..end` is inside an open `try` block or has a
/// `.catch(` before its statement ends.
fn call_is_guarded(content: &str, start: usize, end: usize) -> bool {
    let before = &content[..start];
    let in_try = try_block_regex()
        .map(|re| {
            re.find_iter(before).any(|m| {
                let mut depth = 1i32;
                for ch in before[m.end()..].chars() {
                    match ch {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    if depth == 0 {
                        return false;
                    }
                }
                true
            })
        })
        .unwrap_or(false);
    if in_try {
        return true;
    }

    let after = &content[end..];
    let stop = [after.find(';'), after.find("\n\n")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(after.len());
    catch_call_regex()
        .map(|re| re.is_match(&after[..stop]))
        .unwrap_or(false)
}

fn line_at(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn loading_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?i)loading|pending|skeleton|spinner|suspense")
}

fn map_jsx_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"\.map\(\s*\(?[\w\s,{}:\[\]]*\)?\s*=>\s*\(?\s*<")
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r#"https?://([A-Za-z0-9.\-]+)(?::\d+)?[^\s'"`)]*"#)
}

fn any_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r":\s*any\b|\bas\s+any\b|<any>|any\[\]")
}

fn route_export_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"export\s+(?:async\s+)?(?:function\s+|const\s+)(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS)\b",
    )
}

fn next_route_path_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?:^|/)app/api/(.+)/route\.(?:ts|js)$")
}

fn express_get_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r#"\b(?:app|router|server)\.get\(\s*['"`](/[^'"`]*)['"`]"#)
}

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0"];
const SCHEMA_HOSTS: &[&str] = &["www.w3.org", "schema.org", "json-schema.org"];

const CLIENT_HOOKS: &[&str] = &["useState", "useEffect", "useReducer", "useRef", "onClick="];

/// Static layer for one file.
fn static_checks(file: &ProducedFile, out: &mut Results) {
    let path = file.path.as_str();
    let content = file.content.as_str();
    if !is_script(path) {
        return;
    }
    let cat = TestCategory::Static;

    let calls: Vec<(usize, usize)> = network_call_regex()
        .map(|re| re.find_iter(content).map(|m| (m.start(), m.end())).collect())
        .unwrap_or_default();
    if !calls.is_empty() {
        let unguarded: Vec<usize> = calls
            .iter()
            .filter(|(start, end)| !call_is_guarded(content, *start, *end))
            .map(|(start, _)| line_at(content, *start))
            .collect();
        match unguarded.first() {
            None => out.push(
                cat,
                Severity::Pass,
                "Network calls handle errors",
                format!("{} fetch/axios call(s), each inside a try block or followed by .catch", calls.len()),
                Some(path),
                None,
            ),
            Some(&line) => out.push(
                cat,
                Severity::Fail,
                "Network call without error handling",
                format!(
                    "{} of {} fetch/axios call(s) have no try block or .catch; a failed request will surface as an unhandled rejection",
                    unguarded.len(),
                    calls.len()
                ),
                Some(path),
                Some(line),
            ),
        }

        if is_component(path) && !loading_regex().map(|re| re.is_match(content)).unwrap_or(false) {
            out.push(
                cat,
                Severity::Warn,
                "Data fetch without loading state",
                "The component fetches data but renders no loading indicator",
                Some(path),
                None,
            );
        }
    }

    if is_component(path) {
        if let Some(m) = map_jsx_regex().and_then(|re| re.find(content)) {
            if !content.contains("key=") {
                let line = content[..m.start()].lines().count().max(1);
                out.push(
                    cat,
                    Severity::Warn,
                    "List rendered without keys",
                    "Elements produced by .map() have no key prop",
                    Some(path),
                    Some(line),
                );
            }
        }
    }

    // Module-boundary requirements
    if next_route_path_regex().map(|re| re.is_match(path)).unwrap_or(false)
        && !route_export_regex().map(|re| re.is_match(content)).unwrap_or(false)
    {
        out.push(
            cat,
            Severity::Fail,
            "Route handler exports no HTTP method",
            "route files must export GET/POST/... handlers or the route will not be registered",
            Some(path),
            None,
        );
    }
    let in_app_dir = path.starts_with("app/") || path.contains("/app/");
    if in_app_dir && is_component(path) && CLIENT_HOOKS.iter().any(|h| content.contains(h)) {
        let first = content.trim_start();
        if !(first.starts_with("'use client'") || first.starts_with("\"use client\"")) {
            out.push(
                cat,
                Severity::Fail,
                "Client component missing \"use client\"",
                "Hooks and event handlers in the app directory require the \"use client\" directive",
                Some(path),
                Some(1),
            );
        }
    }
    if path.ends_with(".controller.ts") && !content.contains("@Controller(") {
        out.push(cat, Severity::Fail, "Controller missing @Controller decorator", "The class will not be registered as a controller", Some(path), None);
    }
    if path.ends_with(".service.ts") && content.contains("class ") && !content.contains("@Injectable(") {
        out.push(cat, Severity::Fail, "Service missing @Injectable decorator", "The class cannot be injected", Some(path), None);
    }

    if let Some(re) = url_regex() {
        let hardcoded: Vec<&str> = re
            .captures_iter(content)
            .filter(|c| {
                let host = c.get(1).map(|h| h.as_str()).unwrap_or_default();
                !LOCAL_HOSTS.contains(&host) && !SCHEMA_HOSTS.contains(&host)
            })
            .filter_map(|c| c.get(0).map(|m| m.as_str()))
            .collect();
        if let Some(first) = hardcoded.first() {
            out.push(
                cat,
                Severity::Warn,
                "Hardcoded URL",
                format!("{} hardcoded URL(s), e.g. {}; prefer configuration", hardcoded.len(), first),
                Some(path),
                line_of(content, first),
            );
        }
    }

    let unbalanced = [
        ("setInterval(", "clearInterval("),
        ("addEventListener(", "removeEventListener("),
        (".subscribe(", "unsubscribe"),
    ];
    for (open, close) in unbalanced {
        if content.contains(open) && !content.contains(close) {
            out.push(
                cat,
                Severity::Warn,
                "Subscription without cleanup",
                format!("{} is never paired with {}", open.trim_end_matches('('), close.trim_end_matches('(')),
                Some(path),
                line_of(content, open),
            );
        }
    }

    let any_count = any_regex().map(|re| re.find_iter(content).count()).unwrap_or(0);
    if any_count > MAX_ANY_ANNOTATIONS {
        out.push(
            cat,
            Severity::Warn,
            "Excessive `any`",
            format!("{} untyped annotations", any_count),
            Some(path),
            None,
        );
    }
}

/// Read-only routes exposed by a request-handler module, parameterised
/// routes skipped, at most five.
pub fn extract_get_routes(path: &str, content: &str) -> Vec<String> {
    let mut routes = Vec::new();

    if let Some(caps) = next_route_path_regex().and_then(|re| re.captures(path)) {
        let segment = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let exports_get = route_export_regex()
            .map(|re| re.captures_iter(content).any(|c| &c[1] == "GET"))
            .unwrap_or(false);
        if exports_get && !segment.contains('[') {
            routes.push(format!("/api/{}", segment));
        }
    }

    if let Some(re) = express_get_regex() {
        for cap in re.captures_iter(content) {
            let route = cap[1].to_string();
            if !route.contains(':') && !route.contains('*') && !routes.contains(&route) {
                routes.push(route);
            }
        }
    }

    routes.truncate(MAX_ROUTES_PER_MODULE);
    routes
}

#[derive(Debug, Deserialize)]
struct FindingsResponse {
    #[serde(default)]
    findings: Vec<Finding>,
}

#[derive(Debug, Deserialize)]
struct Finding {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    file: Option<String>,
}

pub struct Verifier {
    deps: AgentDeps,
}

impl Verifier {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    pub async fn run(&self, budget: &mut TokenBudget, request: &str, files: &[ProducedFile]) -> TestReport {
        let started = Instant::now();
        let mut results = Results::default();

        for file in files {
            static_checks(file, &mut results);
        }
        self.smoke(files, &mut results).await;
        self.functional(budget, request, files, &mut results).await;

        let report = TestReport::from_results(results.items, files.len(), started.elapsed());
        info!(
            passed = report.passed,
            warnings = report.warnings,
            failures = report.failures,
            "verification finished"
        );
        report
    }

    async fn smoke(&self, files: &[ProducedFile], out: &mut Results) {
        let targets: Vec<(&str, Vec<String>)> = files
            .iter()
            .map(|f| (f.path.as_str(), extract_get_routes(&f.path, &f.content)))
            .filter(|(_, routes)| !routes.is_empty())
            .collect();
        if targets.is_empty() {
            return;
        }

        let client = match reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(self.deps.config.smoke_timeout_secs))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                out.push(TestCategory::ApiSmoke, Severity::Warn, "Smoke tests skipped", err.to_string(), None, None);
                return;
            }
        };
        let base = match url::Url::parse(&self.deps.config.smoke_base_url) {
            Ok(base) => base,
            Err(err) => {
                out.push(
                    TestCategory::ApiSmoke,
                    Severity::Warn,
                    "Smoke tests skipped",
                    format!("Invalid smoke base URL {:?}: {}", self.deps.config.smoke_base_url, err),
                    None,
                    None,
                );
                return;
            }
        };

        for (path, routes) in targets {
            for route in routes {
                let title = format!("GET {}", route);
                let url = match base.join(&route) {
                    Ok(url) => url,
                    Err(err) => {
                        out.push(TestCategory::ApiSmoke, Severity::Warn, title, err.to_string(), Some(path), None);
                        continue;
                    }
                };
                match client.get(url.clone()).send().await {
                    Ok(response) => {
                        let status = response.status();
                        debug!(%url, status = status.as_u16(), "smoke probe");
                        if status.is_success() || status.is_redirection() {
                            out.push(TestCategory::ApiSmoke, Severity::Pass, title, format!("HTTP {}", status.as_u16()), Some(path), None);
                        } else if status == reqwest::StatusCode::NOT_FOUND {
                            out.push(
                                TestCategory::ApiSmoke,
                                Severity::Fail,
                                title,
                                "HTTP 404: route is not registered with the running server",
                                Some(path),
                                None,
                            );
                        } else {
                            out.push(TestCategory::ApiSmoke, Severity::Warn, title, format!("HTTP {}", status.as_u16()), Some(path), None);
                        }
                    }
                    Err(err) => out.push(
                        TestCategory::ApiSmoke,
                        Severity::Warn,
                        title,
                        format!("Could not connect ({}); the server may not be running", truncate(&err.to_string(), 120)),
                        Some(path),
                        None,
                    ),
                }
            }
        }
    }

    async fn functional(&self, budget: &mut TokenBudget, request: &str, files: &[ProducedFile], out: &mut Results) {
        if files.is_empty() {
            return;
        }
        if budget.is_exceeded() {
            out.push(
                TestCategory::Functional,
                Severity::Warn,
                "Functional review skipped",
                "The session token budget is exhausted",
                None,
                None,
            );
            return;
        }
        let mut diff = String::new();
        for file in files {
            diff.push_str(&unified_diff(
                &file.path,
                file.original.as_deref().unwrap_or_default(),
                &file.content,
            ));
            diff.push('\n');
        }
        let user = format!(
            "USER REQUEST:\n{}\n\nDIFF:\n{}",
            request,
            truncate_output(&diff, MAX_DIFF_CHARS)
        );
        let call = LlmRequest::new(Model::Reviewer, prompts::FUNCTIONAL_REVIEW_SYSTEM, user).json();

        let findings = match self.deps.complete(budget, call).await {
            Ok(response) => parse_structured_content::<FindingsResponse>(&response.content),
            Err(err) => Err(err),
        };
        match findings {
            Ok(response) => {
                let returned = response.findings.len();
                if returned < MIN_FINDINGS {
                    warn!(returned, "functional review returned too few findings");
                    out.push(
                        TestCategory::Functional,
                        Severity::Warn,
                        "Functional review incomplete",
                        format!("Expected at least {} findings, got {}", MIN_FINDINGS, returned),
                        None,
                        None,
                    );
                }
                for finding in response.findings.into_iter().take(MAX_FINDINGS) {
                    out.push(
                        TestCategory::Functional,
                        Severity::parse(&finding.severity),
                        if finding.title.is_empty() { "Review finding".to_string() } else { finding.title },
                        finding.detail,
                        finding.file.as_deref().filter(|f| !f.is_empty()),
                        None,
                    );
                }
            }
            Err(err) => out.push(
                TestCategory::Functional,
                Severity::Warn,
                "Functional review unavailable",
                truncate(&err.to_string(), 200),
                None,
                None,
            ),
        }
    }
}
