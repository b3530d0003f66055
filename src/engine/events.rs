//! Progress events streamed to the caller while a session runs.

use super::session::SessionResult;
use crate::git_ops::Snapshot;
use crate::plan::{ExecutionPlan, StepStatus};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Generated,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "plan")]
    Plan { plan: ExecutionPlan },
    #[serde(rename = "step_start")]
    StepStart {
        id: String,
        title: String,
        action: String,
    },
    #[serde(rename = "progress")]
    Progress {
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        message: String,
        /// Set when the caller is being told about a destructive action
        /// before it happens.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        confirm: bool,
    },
    #[serde(rename = "task-done")]
    TaskDone {
        id: String,
        status: StepStatus,
        detail: String,
    },
    #[serde(rename = "file-update")]
    FileUpdate {
        path: String,
        language: String,
        kind: FileKind,
        description: String,
    },
    #[serde(rename = "snapshot")]
    Snapshot { snapshot: Snapshot },
    #[serde(rename = "result")]
    Result { result: Box<SessionResult> },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "done")]
    Done,
}

impl SessionEvent {
    /// Wire name used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Plan { .. } => "plan",
            SessionEvent::StepStart { .. } => "step_start",
            SessionEvent::Progress { .. } => "progress",
            SessionEvent::TaskDone { .. } => "task-done",
            SessionEvent::FileUpdate { .. } => "file-update",
            SessionEvent::Snapshot { .. } => "snapshot",
            SessionEvent::Result { .. } => "result",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Done => "done",
        }
    }

    pub fn progress(step_id: Option<&str>, message: impl Into<String>) -> Self {
        SessionEvent::Progress {
            step_id: step_id.map(str::to_string),
            message: message.into(),
            confirm: false,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.name()))
    }
}

/// Where a session sends its events. A silent sink drops them; sends after
/// the receiver is gone are ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn silent() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
