//! Deterministic doubles for engine tests.

use crate::config::Config;
use crate::engine::AgentDeps;
use crate::llm::{LlmClient, LlmRequest, LlmResponse, Model, Usage};
use crate::research::{SearchProvider, SearchResult};
use crate::workspace::Workspace;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A recorded call: tier, system prompt, and the last user message.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: Model,
    pub system: String,
    pub user: String,
}

/// Replays queued replies in order, charging a fixed token count per call.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, String>>>,
    tokens_per_call: u32,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            tokens_per_call: 10,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn tokens_per_call(mut self, tokens: u32) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    /// Queue a provider failure.
    pub fn fail(self, message: &str) -> Self {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    /// Queue another successful reply.
    pub fn reply(self, content: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(content.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete<'a>(&'a self, request: &'a LlmRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: request.model,
            system: request.system.clone(),
            user: request.user_text().to_string(),
        });
        let next = self.replies.lock().unwrap().pop_front();
        let tokens = self.tokens_per_call;
        Box::pin(async move {
            match next {
                Some(Ok(content)) => Ok(LlmResponse {
                    content,
                    usage: Some(Usage::new(tokens, 0)),
                    model: "scripted".to_string(),
                }),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("scripted llm has no replies left")),
            }
        })
    }
}

pub struct StaticSearch(pub Vec<SearchResult>);

impl SearchProvider for StaticSearch {
    fn search<'a>(&'a self, _query: &'a str, count: usize) -> BoxFuture<'a, anyhow::Result<Vec<SearchResult>>> {
        let results = self.0.iter().take(count).cloned().collect();
        Box::pin(async move { Ok(results) })
    }
}

/// Deps over a temp project with a scripted model.
pub fn deps(root: &std::path::Path, llm: Arc<ScriptedLlm>) -> AgentDeps {
    deps_with_config(root, llm, Config::default())
}

pub fn deps_with_config(root: &std::path::Path, llm: Arc<ScriptedLlm>, config: Config) -> AgentDeps {
    AgentDeps::new(llm, Workspace::new(root).unwrap(), config)
}
