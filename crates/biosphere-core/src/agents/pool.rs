//! Agent pool — picks agents for an intent and chains them
//!
//! The pool owns no session state. Everything an agent sees (history,
//! environment, earlier agents' findings) is passed in per call, so one pool
//! serves every session concurrently.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use super::profile::AgentDescriptor;
use crate::biomes::Biome;
use crate::capabilities::action_for;
use crate::context::{build_system_prompt, describe_state, format_history};
use crate::error::AgentChainLimitError;
use crate::llm::LanguageModel;
use crate::types::{
    ActionRequest, EnvParameter, EnvironmentDelta, EnvironmentState, Intent, IntentCategory, Message,
};

#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    /// Maximum number of agent calls for one turn
    pub max_chain_depth: usize,
    /// Agent used when no specialization matches
    pub default_agent: String,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 3,
            default_agent: "general".to_string(),
        }
    }
}

/// What one resolution call reads from its session
pub struct AgentContext<'a> {
    pub message: &'a Message,
    pub history: &'a [Message],
    pub state: &'a EnvironmentState,
}

/// One agent's contribution to a turn
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    pub agent: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub turns: Vec<AgentTurn>,
    pub action: Option<ActionRequest>,
    /// The chain was cut short; `turns` is the best available answer
    pub partial: bool,
}

impl Resolution {
    pub fn response_text(&self) -> String {
        self.turns
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct AgentPool {
    model: Arc<dyn LanguageModel>,
    descriptors: Arc<[AgentDescriptor]>,
    default_index: usize,
    config: AgentPoolConfig,
}

impl AgentPool {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        descriptors: Vec<AgentDescriptor>,
        config: AgentPoolConfig,
    ) -> Result<Self> {
        if config.max_chain_depth == 0 {
            bail!("max_chain_depth must be at least 1");
        }
        for (i, d) in descriptors.iter().enumerate() {
            if descriptors[..i].iter().any(|other| other.name == d.name) {
                bail!("duplicate agent name '{}'", d.name);
            }
        }
        let Some(default_index) = descriptors.iter().position(|d| d.name == config.default_agent) else {
            bail!("default agent '{}' is not among the configured agents", config.default_agent);
        };

        info!(
            "AgentPool: {} agents (default '{}', chain cap {})",
            descriptors.len(),
            config.default_agent,
            config.max_chain_depth
        );
        Ok(Self {
            model,
            descriptors: descriptors.into(),
            default_index,
            config,
        })
    }

    pub fn descriptors(&self) -> &[AgentDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.descriptors.iter().find(|d| d.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Agent for a category, falling back to the default agent
    pub fn select(&self, category: IntentCategory) -> &AgentDescriptor {
        match self.descriptors.iter().find(|d| d.accepts(category)) {
            Some(d) => d,
            None => {
                debug!("AgentPool: no specialist for {}, using default", category);
                &self.descriptors[self.default_index]
            }
        }
    }

    /// Answer a validated intent and derive the action it calls for.
    ///
    /// Secondary categories and `HANDOFF:` directives extend the chain; each
    /// agent sees the findings of the agents before it. At most
    /// `max_chain_depth` agents are called.
    pub async fn resolve(&self, intent: &Intent, ctx: &AgentContext<'_>) -> Resolution {
        let action = derive_action(intent, ctx);

        let mut queue: VecDeque<&AgentDescriptor> = VecDeque::new();
        queue.push_back(self.select(intent.category));
        for &category in &intent.secondary {
            let agent = self.select(category);
            if !queue.iter().any(|a| a.name == agent.name) {
                queue.push_back(agent);
            }
        }

        let mut turns: Vec<AgentTurn> = Vec::new();
        let mut partial = false;
        let mut depth = 0;

        while let Some(agent) = queue.pop_front() {
            if depth >= self.config.max_chain_depth {
                let limit = AgentChainLimitError {
                    cap: self.config.max_chain_depth,
                };
                warn!(
                    "AgentPool: {} ({} agents still queued), returning partial answer",
                    limit,
                    queue.len() + 1
                );
                partial = true;
                break;
            }
            depth += 1;

            let system = self.system_prompt(agent, intent, ctx, &turns);
            let prompt = user_prompt(ctx.message, action.as_ref());
            debug!("AgentPool: calling '{}' (hop {}/{})", agent.name, depth, self.config.max_chain_depth);

            let reply = match self.model.complete(&system, &prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("AgentPool: agent '{}' failed: {}", agent.name, e);
                    turns.push(AgentTurn {
                        agent: agent.name.clone(),
                        text: "I couldn't reach the language model just now, please try again.".to_string(),
                    });
                    partial = partial || !queue.is_empty();
                    break;
                }
            };

            let (text, handoff) = split_handoff(&reply);
            turns.push(AgentTurn {
                agent: agent.name.clone(),
                text,
            });

            if let Some(target) = handoff {
                match self.get(&target) {
                    Some(next) if next.name != agent.name => {
                        debug!("AgentPool: '{}' handed off to '{}'", agent.name, next.name);
                        queue.push_back(next);
                    }
                    Some(_) => debug!("AgentPool: '{}' ignored self-handoff", agent.name),
                    None => warn!("AgentPool: '{}' handed off to unknown agent '{}'", agent.name, target),
                }
            }
        }

        Resolution {
            turns,
            action,
            partial,
        }
    }

    fn system_prompt(
        &self,
        agent: &AgentDescriptor,
        intent: &Intent,
        ctx: &AgentContext<'_>,
        prior: &[AgentTurn],
    ) -> String {
        let location = intent.location_id().unwrap_or(&ctx.state.location_id);
        let location_context = match Biome::lookup(location) {
            Some(b) => format!("{}: {}", b.name, b.description),
            None => location.to_string(),
        };

        let mut extra = format!("Current environment: {}", describe_state(ctx.state));
        if !ctx.history.is_empty() {
            extra.push_str("\n\nRecent conversation:\n");
            extra.push_str(&format_history(ctx.history));
        }
        if !prior.is_empty() {
            extra.push_str("\n\nFindings from other agents:\n");
            for turn in prior {
                extra.push_str(&format!("[{}] {}\n", turn.agent, turn.text));
            }
        }
        let others: Vec<&str> = self
            .descriptors
            .iter()
            .filter(|d| d.name != agent.name)
            .map(|d| d.name.as_str())
            .collect();
        if !others.is_empty() {
            extra.push_str(&format!("\n\nOther agents: {}", others.join(", ")));
        }

        build_system_prompt(&agent.role_prompt, &location_context, &extra)
    }
}

fn user_prompt(message: &Message, action: Option<&ActionRequest>) -> String {
    match action {
        Some(a) => format!(
            "{} asks: {}\n\nPlanned action: {} for {}",
            message.author, message.text, a.kind, a.location_id
        ),
        None => format!("{} asks: {}", message.author, message.text),
    }
}

/// The collaborator call a validated intent asks for, built from its
/// parameters rather than any model text
fn derive_action(intent: &Intent, ctx: &AgentContext<'_>) -> Option<ActionRequest> {
    let kind = action_for(intent.category)?;

    let delta = if intent.category == IntentCategory::AdjustParameter {
        let parameter = intent.param_str("parameter").and_then(EnvParameter::parse)?;
        match intent.param_f64("target") {
            Some(target) => Some(EnvironmentDelta::towards(parameter, target, ctx.state)),
            None => Some(EnvironmentDelta::single(parameter, intent.param_f64("amount")?)),
        }
    } else {
        None
    };

    Some(ActionRequest {
        kind,
        session_id: ctx.message.session_id.clone(),
        location_id: intent
            .location_id()
            .unwrap_or(&ctx.state.location_id)
            .to_string(),
        parameters: intent.parameters.clone(),
        delta,
        environment: ctx.state.clone(),
    })
}

/// Strip a trailing `HANDOFF: <agent>` line, returning the visible text and the target
fn split_handoff(reply: &str) -> (String, Option<String>) {
    let mut lines: Vec<&str> = reply.trim_end().lines().collect();
    let Some(last) = lines.last() else {
        return (String::new(), None);
    };

    let trimmed = last.trim().trim_matches('`');
    let target = trimmed
        .get(..8)
        .filter(|prefix| prefix.eq_ignore_ascii_case("handoff:"))
        .map(|_| {
            trimmed[8..]
                .trim()
                .trim_matches(|c: char| c == '<' || c == '>' || c == '`' || c == '.')
                .to_string()
        })
        .filter(|t| !t.is_empty());

    if target.is_some() {
        lines.pop();
    }
    (lines.join("\n").trim_end().to_string(), target)
}
