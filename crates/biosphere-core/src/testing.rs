//! Scripted fakes shared by the unit tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::collaborators::Collaborator;
use crate::error::CollaboratorError;
use crate::llm::LanguageModel;
use crate::types::ActionRequest;

struct Rule {
    needle: String,
    reply: std::result::Result<String, String>,
    delay: Duration,
}

/// Language model that answers by substring rules over `system + prompt`.
/// The first matching rule wins; otherwise the fallback reply is returned.
pub struct ScriptedModel {
    rules: Vec<Rule>,
    fallback: String,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(fallback: &str) -> Self {
        Self {
            rules: Vec::new(),
            fallback: fallback.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, needle: &str, reply: &str) -> Self {
        self.on_slow(needle, reply, Duration::ZERO)
    }

    pub fn on_slow(mut self, needle: &str, reply: &str, delay: Duration) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            reply: Ok(reply.to_string()),
            delay,
        });
        self
    }

    pub fn failing_on(mut self, needle: &str, error: &str) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            reply: Err(error.to_string()),
            delay: Duration::ZERO,
        });
        self
    }

    /// Every (system, prompt) pair received so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(s, p)| s.contains(needle) || p.contains(needle))
            .count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), prompt.to_string()));

        let haystack = format!("{}\n{}", system, prompt);
        let Some(rule) = self.rules.iter().find(|r| haystack.contains(&r.needle)) else {
            return Ok(self.fallback.clone());
        };
        if !rule.delay.is_zero() {
            tokio::time::sleep(rule.delay).await;
        }
        rule.reply.clone().map_err(|e| anyhow!("{}", e))
    }
}

/// Collaborator that records every request and replays queued outcomes
pub struct RecordingCollaborator {
    name: String,
    outcomes: Mutex<VecDeque<std::result::Result<Value, CollaboratorError>>>,
    default: Value,
    delay: Duration,
    requests: Mutex<Vec<ActionRequest>>,
    calls: AtomicUsize,
}

impl RecordingCollaborator {
    pub fn new(name: &str, default: Value) -> Self {
        Self {
            name: name.to_string(),
            outcomes: Mutex::new(VecDeque::new()),
            default,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes returned ahead of the default, in order
    pub fn then(self, outcome: std::result::Result<Value, CollaboratorError>) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Collaborator for RecordingCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &ActionRequest) -> std::result::Result<Value, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.outcomes.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(self.default.clone()))
    }
}
