//! Vetted shell commands
//!
//! Commands from a plan never reach a shell. They are checked against a
//! short allowlist of prefixes, split into argv, and spawned directly with
//! the project root as working directory.

use crate::error::AgentError;
use crate::util::{cached_regex, run_command_with_timeout, CommandRunResult};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$'];

const ALLOWED_PROGRAMS: &[&str] = &[
    "npm", "npx", "pnpm", "yarn", "ls", "cat", "head", "tail", "wc", "pwd", "echo", "grep", "find",
    "mkdir", "touch",
];

const GIT_READ_ONLY: &[&str] = &["status", "log", "diff", "show", "branch"];

/// `git branch` may only list.
const GIT_BRANCH_LIST_FLAGS: &[&str] = &[
    "-a", "-r", "-v", "-vv", "--list", "--all", "--remotes", "--verbose", "--show-current",
];

/// Words that mark a build, lint, or test invocation.
const VERIFICATION_WORDS: &[&str] = &[
    "build",
    "lint",
    "test",
    "tsc",
    "eslint",
    "jest",
    "vitest",
    "typecheck",
    "type-check",
];

const FIND_DANGEROUS_FLAGS: &[&str] = &["-exec", "-execdir", "-delete", "-ok", "-okdir"];

/// Outcome of vetting a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vetted {
    Run(Vec<String>),
    /// Allowed but intentionally not executed.
    Skip(String),
}

/// Split a command line into argv, honouring single and double quotes.
pub fn split_args(command: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_token = false;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                has_token = true;
            }
            None if ch.is_whitespace() => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            None => {
                current.push(ch);
                has_token = true;
            }
        }
    }
    if quote.is_some() {
        return Err("Unterminated quote".to_string());
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}

/// Check a plan-supplied command against the allowlist.
pub fn vet_command(command: &str) -> Result<Vetted, AgentError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(AgentError::not_allowed(command, "empty command"));
    }

    let argv = split_args(trimmed).map_err(|e| AgentError::not_allowed(trimmed, e))?;
    let Some(program) = argv.first().map(String::as_str) else {
        return Err(AgentError::not_allowed(trimmed, "empty command"));
    };

    let is_echo = program == "echo";
    if !is_echo && trimmed.contains(SHELL_METACHARACTERS) {
        return Err(AgentError::not_allowed(
            trimmed,
            "shell metacharacters are not permitted",
        ));
    }

    if program == "git" {
        vet_git(trimmed, &argv)?;
    } else if !ALLOWED_PROGRAMS.contains(&program) {
        return Err(AgentError::not_allowed(
            trimmed,
            format!("'{}' is not on the allowlist", program),
        ));
    }

    if matches!(program, "npm" | "npx" | "pnpm" | "yarn")
        && argv[1..]
            .iter()
            .any(|a| VERIFICATION_WORDS.contains(&a.as_str()))
    {
        return Ok(Vetted::Skip(
            "build/lint/test commands run during verification".to_string(),
        ));
    }

    if program == "find"
        && argv[1..]
            .iter()
            .any(|a| FIND_DANGEROUS_FLAGS.contains(&a.as_str()))
    {
        return Err(AgentError::not_allowed(trimmed, "find actions are not permitted"));
    }

    if !is_echo && !matches!(program, "npm" | "npx" | "pnpm" | "yarn" | "grep") {
        for arg in &argv[1..] {
            // `--flag=value` values are paths as often as not.
            let candidate = match arg.strip_prefix('-') {
                Some(flag) => match flag.split_once('=') {
                    Some((_, value)) => value,
                    None => continue,
                },
                None => arg.as_str(),
            };
            if escapes_root(candidate) {
                return Err(AgentError::PathEscape { path: arg.clone() });
            }
        }
    }

    Ok(Vetted::Run(argv))
}

fn escapes_root(arg: &str) -> bool {
    let p = Path::new(arg);
    p.is_absolute() || p.components().any(|c| matches!(c, std::path::Component::ParentDir))
}

/// Read-only subcommands only, with no flag that writes.
fn vet_git(command: &str, argv: &[String]) -> Result<(), AgentError> {
    let sub = argv.get(1).map(String::as_str).unwrap_or_default();
    if !GIT_READ_ONLY.contains(&sub) {
        return Err(AgentError::not_allowed(
            command,
            "only read-only git subcommands are allowed",
        ));
    }
    let args = &argv[2..];
    if args
        .iter()
        .any(|a| a == "-o" || a == "--output" || a.starts_with("--output="))
    {
        return Err(AgentError::not_allowed(command, "git output files are not permitted"));
    }
    if sub == "branch" && !args.iter().all(|a| GIT_BRANCH_LIST_FLAGS.contains(&a.as_str())) {
        return Err(AgentError::not_allowed(command, "git branch may only list branches"));
    }
    Ok(())
}

fn package_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        r"^(@[a-z0-9][a-z0-9._-]*/)?[a-z0-9][a-z0-9._-]*(@[A-Za-z0-9.^~<>=*_-]+)?$",
    )
}

/// Whether `name` is a plain `name[@version]` package spec.
pub fn is_valid_package(name: &str) -> bool {
    package_regex().map(|re| re.is_match(name)).unwrap_or(false)
}

/// Validate every package; the first invalid one fails the whole list.
pub fn validate_packages(packages: &[String]) -> Result<Vec<String>, AgentError> {
    let cleaned: Vec<String> = packages
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if cleaned.is_empty() {
        return Err(AgentError::not_allowed("install", "no packages given"));
    }
    if let Some(bad) = cleaned.iter().find(|p| !is_valid_package(p)) {
        return Err(AgentError::not_allowed(
            bad.clone(),
            "invalid package name",
        ));
    }
    Ok(cleaned)
}

/// argv for installing packages with the configured package manager.
pub fn install_argv(package_manager: &str, packages: &[String], dev: bool) -> Vec<String> {
    let verb = if package_manager == "npm" { "install" } else { "add" };
    let mut argv = vec![package_manager.to_string(), verb.to_string()];
    if dev {
        argv.push(if package_manager == "npm" { "--save-dev" } else { "-D" }.to_string());
    }
    argv.extend(packages.iter().cloned());
    argv
}

/// Spawn a vetted argv in `root` with a timeout.
pub async fn run_argv(root: &Path, argv: &[String], timeout: Duration) -> anyhow::Result<CommandRunResult> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    let mut command = Command::new(program);
    command.args(args).current_dir(root);
    run_command_with_timeout(&mut command, timeout)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}
