//! Execution plans
//!
//! A plan is parsed from untyped model JSON, validated step by step into a
//! closed set of actions, and post-processed by a few heuristics before the
//! session runs it.

use crate::util::normalize_rel_path;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Chat,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        OneOrMany::Many(v) => v,
    })
}

/// The closed action vocabulary. Anything else is dropped at validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    SearchWeb {
        #[serde(default)]
        query: String,
    },
    SearchCodebase {
        #[serde(default, alias = "query")]
        pattern: String,
        #[serde(default)]
        path: Option<String>,
    },
    GenerateComponent {
        #[serde(default)]
        path: String,
        #[serde(default, alias = "instruction")]
        description: String,
    },
    ModifyFile {
        #[serde(default)]
        path: String,
        #[serde(default, alias = "description")]
        instruction: String,
    },
    ModifyFiles {
        #[serde(default, alias = "files")]
        paths: Vec<String>,
        #[serde(default, alias = "description")]
        instruction: String,
    },
    InstallPackages {
        #[serde(default, alias = "package", deserialize_with = "string_or_list")]
        packages: Vec<String>,
        #[serde(default)]
        dev: bool,
    },
    RunCommand {
        #[serde(default)]
        command: String,
    },
    DelegateBackend {
        #[serde(default, alias = "description")]
        instruction: String,
    },
    CreateApi {
        #[serde(default)]
        path: String,
        #[serde(default, alias = "instruction")]
        description: String,
    },
    ReadFile {
        #[serde(default)]
        path: String,
    },
    ListDirectory {
        #[serde(default)]
        path: String,
    },
    DeleteFile {
        #[serde(default)]
        path: String,
    },
    Chat {
        #[serde(default)]
        message: String,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::SearchWeb { .. } => "search_web",
            StepAction::SearchCodebase { .. } => "search_codebase",
            StepAction::GenerateComponent { .. } => "generate_component",
            StepAction::ModifyFile { .. } => "modify_file",
            StepAction::ModifyFiles { .. } => "modify_files",
            StepAction::InstallPackages { .. } => "install_packages",
            StepAction::RunCommand { .. } => "run_command",
            StepAction::DelegateBackend { .. } => "delegate_backend",
            StepAction::CreateApi { .. } => "create_api",
            StepAction::ReadFile { .. } => "read_file",
            StepAction::ListDirectory { .. } => "list_directory",
            StepAction::DeleteFile { .. } => "delete_file",
            StepAction::Chat { .. } => "chat",
        }
    }

    /// Whether the step can change files on disk.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            StepAction::GenerateComponent { .. }
                | StepAction::ModifyFile { .. }
                | StepAction::ModifyFiles { .. }
                | StepAction::InstallPackages { .. }
                | StepAction::RunCommand { .. }
                | StepAction::DelegateBackend { .. }
                | StepAction::CreateApi { .. }
                | StepAction::DeleteFile { .. }
        )
    }

    /// Context-gathering steps never fail the plan.
    pub fn is_context_only(&self) -> bool {
        matches!(
            self,
            StepAction::ReadFile { .. }
                | StepAction::ListDirectory { .. }
                | StepAction::SearchCodebase { .. }
                | StepAction::SearchWeb { .. }
        )
    }

    /// Files this step is expected to write, if known up front.
    pub fn target_paths(&self) -> Vec<String> {
        match self {
            StepAction::GenerateComponent { path, .. }
            | StepAction::ModifyFile { path, .. }
            | StepAction::CreateApi { path, .. }
            | StepAction::DeleteFile { path } => vec![path.clone()],
            StepAction::ModifyFiles { paths, .. } => paths.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default = "pending")]
    pub status: StepStatus,
}

fn pending() -> StepStatus {
    StepStatus::Pending
}

impl PlanStep {
    pub fn new(id: impl Into<String>, title: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            detail: String::new(),
            action,
            status: StepStatus::Pending,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, StepStatus::Done | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub intent: Intent,
    pub confidence: u8,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarify_question: Option<String>,
    pub steps: Vec<PlanStep>,
}

/// What validation removed or filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub dropped: Vec<String>,
    pub filled_ids: usize,
}

fn confidence_from(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(v) if v.is_finite() => v.round().clamp(0.0, 100.0) as u8,
        _ => 100,
    }
}

fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl ExecutionPlan {
    /// Single chat step used when the planner's output is unusable.
    pub fn fallback_chat(message: &str, reason: &str) -> Self {
        let mut step = PlanStep::new(
            "step-1",
            "Respond",
            StepAction::Chat {
                message: message.to_string(),
            },
        );
        step.detail = reason.to_string();
        Self {
            intent: Intent::Chat,
            confidence: 100,
            summary: "Conversational reply".to_string(),
            clarify_question: None,
            steps: vec![step],
        }
    }

    /// Build a plan from the planner's JSON. Steps whose action is not in
    /// the vocabulary are dropped; missing ids and titles are assigned.
    /// A `clarify` intent is coerced to `build`.
    pub fn from_value(value: &Value) -> (Self, ValidationReport) {
        let mut report = ValidationReport::default();

        let intent = match str_field(value, &["intent"]).map(str::to_ascii_lowercase) {
            Some(i) if i == "chat" => Intent::Chat,
            _ => Intent::Build,
        };
        let confidence = confidence_from(value.get("confidence"));
        let summary = str_field(value, &["summary"]).unwrap_or_default().to_string();
        let clarify_question = str_field(value, &["clarifyQuestion", "clarify_question", "question"])
            .map(str::to_string);

        let raw_steps = value
            .get("steps")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut steps: Vec<PlanStep> = Vec::with_capacity(raw_steps.len());
        for (idx, mut raw) in raw_steps.into_iter().enumerate() {
            let Some(obj) = raw.as_object_mut() else {
                report.dropped.push(format!("step {} is not an object", idx + 1));
                continue;
            };
            let action = obj
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or("<missing>")
                .to_string();

            let has_id = obj
                .get("id")
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !has_id {
                obj.insert("id".to_string(), Value::String(format!("step-{}", idx + 1)));
                report.filled_ids += 1;
            }
            let has_title = obj
                .get("title")
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !has_title {
                obj.insert("title".to_string(), Value::String(action.replace('_', " ")));
            }
            obj.insert("status".to_string(), Value::String("pending".to_string()));

            match serde_json::from_value::<PlanStep>(raw) {
                Ok(step) => steps.push(step),
                Err(_) => report.dropped.push(action),
            }
        }

        // Duplicate ids would make event streams ambiguous.
        for idx in 0..steps.len() {
            if steps[..idx].iter().any(|s| s.id == steps[idx].id) {
                steps[idx].id = format!("step-{}", idx + 1);
            }
        }

        (
            Self {
                intent,
                confidence,
                summary,
                clarify_question,
                steps,
            },
            report,
        )
    }

    /// The question to ask instead of executing, when confidence is below
    /// the threshold and the planner supplied one.
    pub fn clarification(&self, threshold: u8) -> Option<&str> {
        if self.confidence >= threshold {
            return None;
        }
        self.clarify_question
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Rewrite creation requests the planner mis-routed as edits of the
    /// currently open file. Returns the number of steps changed.
    pub fn auto_correct(&mut self, request: &str, open_file: Option<&str>) -> usize {
        let Some(open_file) = open_file.map(normalize_rel_path).filter(|p| !p.is_empty()) else {
            return 0;
        };
        let Some(name) = creation_subject(request) else {
            return 0;
        };

        let mut changed = 0;
        for step in &mut self.steps {
            let StepAction::ModifyFile { path, instruction } = &step.action else {
                continue;
            };
            if normalize_rel_path(path) != open_file {
                continue;
            }
            let new_path = infer_new_path(&open_file, &name);
            step.action = StepAction::GenerateComponent {
                path: new_path,
                description: instruction.clone(),
            };
            changed += 1;
        }
        changed
    }
}

const CREATION_VERBS: &[&str] = &["create", "build", "make", "generate", "scaffold"];
/// Verbs that also mean "change" ("make the header sticky", "fix the build").
const AMBIGUOUS_VERBS: &[&str] = &["build", "make"];
const OBJECT_OPENERS: &[&str] = &["a", "an", "new", "another", "some", "me", "us"];
const LEAD_WORDS: &[&str] = &[
    "please", "can", "could", "would", "will", "you", "i", "we", "want", "need", "to", "lets", "let", "s",
    "us", "and", "then", "also", "now",
];
const SKIP_WORDS: &[&str] = &["a", "an", "the", "new", "some", "me", "us", "another"];

/// PascalCase name for what the request asks to create, if it is a
/// creation request at all. The verb has to open a clause.
pub fn creation_subject(request: &str) -> Option<String> {
    request
        .split(|c: char| matches!(c, '.' | ',' | ';' | '!' | '?' | '\n'))
        .find_map(clause_subject)
}

fn clause_subject(clause: &str) -> Option<String> {
    let words: Vec<String> = clause
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    let verb_idx = words.iter().position(|w| !LEAD_WORDS.contains(&w.as_str()))?;
    let verb = words[verb_idx].as_str();
    if !CREATION_VERBS.contains(&verb) {
        return None;
    }
    if AMBIGUOUS_VERBS.contains(&verb) {
        let next = words.get(verb_idx + 1).map(String::as_str)?;
        if !OBJECT_OPENERS.contains(&next) {
            return None;
        }
    }

    let subject: Vec<&String> = words[verb_idx + 1..]
        .iter()
        .skip_while(|w| SKIP_WORDS.contains(&w.as_str()))
        .take(2)
        .collect();
    if subject.is_empty() {
        return Some("NewComponent".to_string());
    }
    Some(
        subject
            .iter()
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect(),
    )
}

/// Sibling of the open file named `name`, with the open file's extension.
pub fn infer_new_path(open_file: &str, name: &str) -> String {
    let path = Path::new(open_file);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("tsx");
    let file = format!("{}.{}", name, ext);
    match path.parent().map(|p| p.to_string_lossy().replace('\\', "/")) {
        Some(parent) if !parent.is_empty() => format!("{}/{}", parent, file),
        _ => file,
    }
}
