//! Conversational history and environment state, per session
//!
//! The store is the single writer path for environment mutation:
//! [`ContextStore::propose_state`] applies a delta only when the caller's
//! `expected_version` matches the stored one. Sessions are isolated; the
//! in-memory backend shards them in a `DashMap` so independent sessions never
//! contend on a shared lock.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConflictError, StoreError};
use crate::types::{EnvironmentDelta, EnvironmentState, Message};

/// Everything the store holds for one session, returned when it is removed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub history: Vec<Message>,
    pub state: EnvironmentState,
}

/// Backing storage for session history and environment state
pub trait ContextStore: Send + Sync {
    /// Create the session if it does not exist; returns its current state
    fn open(&self, session_id: &str, location_id: &str) -> Result<EnvironmentState, StoreError>;

    /// Append an immutable message to the session log
    fn append(&self, session_id: &str, message: Message) -> Result<(), StoreError>;

    /// The most recent `window` messages in order, or all of them
    fn history(&self, session_id: &str, window: Option<usize>) -> Result<Vec<Message>, StoreError>;

    fn current_state(&self, session_id: &str) -> Result<EnvironmentState, StoreError>;

    /// Apply `delta` if `expected_version` is current; bumps the version by one
    fn propose_state(
        &self,
        session_id: &str,
        delta: &EnvironmentDelta,
        expected_version: u64,
        author: &str,
    ) -> Result<EnvironmentState, StoreError>;

    /// Drop the session, returning what it held
    fn remove(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError>;
}

struct SessionRecord {
    history: Vec<Message>,
    state: EnvironmentState,
}

/// Process-local ContextStore
#[derive(Default)]
pub struct InMemoryContextStore {
    sessions: DashMap<String, SessionRecord>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl ContextStore for InMemoryContextStore {
    fn open(&self, session_id: &str, location_id: &str) -> Result<EnvironmentState, StoreError> {
        let record = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("ContextStore: opened session '{}' at '{}'", session_id, location_id);
                SessionRecord {
                    history: Vec::new(),
                    state: EnvironmentState::initial(location_id),
                }
            });
        Ok(record.state.clone())
    }

    fn append(&self, session_id: &str, message: Message) -> Result<(), StoreError> {
        if message.session_id != session_id {
            return Err(StoreError::ForeignMessage {
                message_id: message.id,
                owner: message.session_id,
                session_id: session_id.to_string(),
            });
        }
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        record.history.push(message);
        Ok(())
    }

    fn history(&self, session_id: &str, window: Option<usize>) -> Result<Vec<Message>, StoreError> {
        let record = self
            .sessions
            .get(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let start = match window {
            Some(n) => record.history.len().saturating_sub(n),
            None => 0,
        };
        Ok(record.history[start..].to_vec())
    }

    fn current_state(&self, session_id: &str) -> Result<EnvironmentState, StoreError> {
        self.sessions
            .get(session_id)
            .map(|r| r.state.clone())
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    fn propose_state(
        &self,
        session_id: &str,
        delta: &EnvironmentDelta,
        expected_version: u64,
        author: &str,
    ) -> Result<EnvironmentState, StoreError> {
        if delta.is_empty() {
            return Err(StoreError::InvalidDelta("delta changes nothing".to_string()));
        }
        if let Some((param, _)) = delta.entries().iter().find(|(_, v)| !v.is_finite()) {
            return Err(StoreError::InvalidDelta(format!("{} is not a finite number", param)));
        }

        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        let actual = record.state.version;
        if actual != expected_version {
            debug!(
                "ContextStore: rejected stale proposal on '{}' (expected v{}, at v{})",
                session_id, expected_version, actual
            );
            return Err(ConflictError {
                expected: expected_version,
                actual,
            }
            .into());
        }

        let state = &mut record.state;
        state.apply(delta);
        state.version += 1;
        state.last_modified_by = Some(author.to_string());
        debug!(
            "ContextStore: '{}' → v{} by {} ({})",
            session_id,
            state.version,
            author,
            delta.describe()
        );
        Ok(state.clone())
    }

    fn remove(&self, session_id: &str) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.sessions.remove(session_id).map(|(id, record)| SessionSnapshot {
            session_id: id,
            history: record.history,
            state: record.state,
        }))
    }
}

/// Render history as "author: text" lines for prompt injection
pub fn format_history(history: &[Message]) -> String {
    history
        .iter()
        .map(|m| format!("{} ({}): {}", m.author, m.role, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compact description of an environment for prompts and notices
pub fn describe_state(state: &EnvironmentState) -> String {
    format!(
        "location={} temperature={:.1}°C humidity={:.1}% light={:.1}% co2={:.0}ppm (v{})",
        state.location_id, state.temperature, state.humidity, state.light, state.co2, state.version
    )
}

/// Build complete system prompt from components
pub fn build_system_prompt(role_prompt: &str, location_context: &str, extra_context: &str) -> String {
    let mut prompt = String::new();

    if !role_prompt.is_empty() {
        prompt.push_str("# ROLE\n\n");
        prompt.push_str(role_prompt);
        prompt.push_str("\n\n");
    }

    if !location_context.is_empty() {
        prompt.push_str("# LOCATION\n\n");
        prompt.push_str(location_context);
        prompt.push_str("\n\n");
    }

    // Conversation history, environment, other agents' findings
    if !extra_context.is_empty() {
        prompt.push_str("# CONTEXT\n\n");
        prompt.push_str(extra_context);
        prompt.push_str("\n\n");
    }

    prompt.push_str("# CURRENT TIME\n\n");
    prompt.push_str(&chrono::Utc::now().to_rfc3339());
    prompt.push_str("\n\n");

    prompt.push_str("# INSTRUCTIONS\n\n");
    prompt.push_str("Always use the actual data provided in the context. Never make up or guess values. ");
    prompt.push_str("If the data is not available, say you don't have enough data to answer. ");
    prompt.push_str("Be precise and scientific. ");
    prompt.push_str("If another specialist should continue, end with a line `HANDOFF: <agent name>`.\n");

    debug!("Built system prompt ({} chars)", prompt.len());

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnvParameter, Role};
    use std::sync::Arc;

    fn store_with(session: &str) -> InMemoryContextStore {
        let store = InMemoryContextStore::new();
        store.open(session, "rainforest").unwrap();
        store
    }

    #[test]
    fn test_open_is_idempotent() {
        let store = store_with("s1");
        store
            .propose_state("s1", &EnvironmentDelta::single(EnvParameter::Light, -10.0), 0, "alice")
            .unwrap();
        let reopened = store.open("s1", "desert").unwrap();
        assert_eq!(reopened.location_id, "rainforest");
        assert_eq!(reopened.version, 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_history_window() {
        let store = store_with("s1");
        for i in 0..5 {
            store
                .append("s1", Message::new("s1", "alice", Role::User, format!("m{}", i)))
                .unwrap();
        }
        let last_two = store.history("s1", Some(2)).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].text, "m3");
        assert_eq!(last_two[1].text, "m4");
        assert_eq!(store.history("s1", None).unwrap().len(), 5);
        assert_eq!(store.history("s1", Some(50)).unwrap().len(), 5);
    }

    #[test]
    fn test_append_rejects_foreign_message() {
        let store = store_with("s1");
        let err = store
            .append("s1", Message::new("s2", "alice", Role::User, "hi"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignMessage { .. }));
        assert!(store.history("s1", None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_session() {
        let store = InMemoryContextStore::new();
        assert!(matches!(
            store.current_state("nope"),
            Err(StoreError::SessionNotFound(_))
        ));
        assert!(store.remove("nope").unwrap().is_none());
    }

    #[test]
    fn test_propose_bumps_version_by_one() {
        let store = store_with("s1");
        let delta = EnvironmentDelta::single(EnvParameter::Temperature, 2.0);
        let state = store.propose_state("s1", &delta, 0, "alice").unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.temperature, 30.0);
        assert_eq!(state.last_modified_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_stale_proposal_rejected_without_mutation() {
        let store = store_with("s1");
        let delta = EnvironmentDelta::single(EnvParameter::Temperature, 2.0);
        store.propose_state("s1", &delta, 0, "alice").unwrap();
        let before = store.current_state("s1").unwrap();

        for _ in 0..3 {
            let err = store.propose_state("s1", &delta, 0, "bob").unwrap_err();
            match err {
                StoreError::Conflict(c) => {
                    assert_eq!(c.expected, 0);
                    assert_eq!(c.actual, 1);
                }
                other => panic!("expected conflict, got {other:?}"),
            }
        }
        assert_eq!(store.current_state("s1").unwrap(), before);
    }

    #[test]
    fn test_invalid_deltas_rejected() {
        let store = store_with("s1");
        assert!(matches!(
            store.propose_state("s1", &EnvironmentDelta::default(), 0, "a"),
            Err(StoreError::InvalidDelta(_))
        ));
        let nan = EnvironmentDelta::single(EnvParameter::Co2, f64::NAN);
        assert!(matches!(
            store.propose_state("s1", &nan, 0, "a"),
            Err(StoreError::InvalidDelta(_))
        ));
        assert_eq!(store.current_state("s1").unwrap().version, 0);
    }

    #[test]
    fn test_concurrent_chained_proposals_serialize() {
        let store = Arc::new(store_with("s1"));
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut accepted = Vec::new();
                for _ in 0..25 {
                    loop {
                        let current = store.current_state("s1").unwrap();
                        let delta = EnvironmentDelta::single(EnvParameter::Co2, 1.0);
                        match store.propose_state("s1", &delta, current.version, &format!("t{}", t)) {
                            Ok(state) => {
                                accepted.push(state.version);
                                break;
                            }
                            Err(StoreError::Conflict(_)) => continue,
                            Err(e) => panic!("unexpected {e}"),
                        }
                    }
                }
                accepted
            }));
        }

        let mut versions: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        versions.sort_unstable();
        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(versions, expected);

        let state = store.current_state("s1").unwrap();
        assert_eq!(state.version, 200);
        assert_eq!(state.co2, 600.0);
    }

    #[test]
    fn test_two_users_race_on_same_version() {
        let store = store_with("s1");
        for v in 0..5 {
            store
                .propose_state("s1", &EnvironmentDelta::single(EnvParameter::Light, -1.0), v, "setup")
                .unwrap();
        }
        let base = store.current_state("s1").unwrap();
        assert_eq!(base.version, 5);

        let plus2 = EnvironmentDelta::single(EnvParameter::Temperature, 2.0);
        let plus3 = EnvironmentDelta::single(EnvParameter::Temperature, 3.0);
        let first = store.propose_state("s1", &plus2, 5, "alice").unwrap();
        assert_eq!(first.version, 6);

        let conflict = store.propose_state("s1", &plus3, 5, "bob").unwrap_err();
        assert!(matches!(conflict, StoreError::Conflict(ConflictError { expected: 5, actual: 6 })));

        let retried = store.propose_state("s1", &plus3, 6, "bob").unwrap();
        assert_eq!(retried.version, 7);
        assert_eq!(retried.temperature, base.temperature + 5.0);
    }

    #[test]
    fn test_remove_returns_snapshot() {
        let store = store_with("s1");
        store.append("s1", Message::new("s1", "alice", Role::User, "hi")).unwrap();
        let snapshot = store.remove("s1").unwrap().unwrap();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.state.location_id, "rainforest");
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_format_history() {
        let history = vec![
            Message::new("s1", "alice", Role::User, "hello"),
            Message::new("s1", "general", Role::Agent, "hi alice"),
        ];
        assert_eq!(
            format_history(&history),
            "alice (user): hello\ngeneral (agent): hi alice"
        );
    }

    #[test]
    fn test_build_system_prompt_sections() {
        let prompt = build_system_prompt("You analyse data", "Rainforest", "history here");
        let role = prompt.find("# ROLE").unwrap();
        let location = prompt.find("# LOCATION").unwrap();
        let context = prompt.find("# CONTEXT").unwrap();
        let instructions = prompt.find("# INSTRUCTIONS").unwrap();
        assert!(role < location && location < context && context < instructions);
        assert!(prompt.contains("HANDOFF"));
    }

    #[test]
    fn test_build_system_prompt_empty() {
        let prompt = build_system_prompt("", "", "");
        assert!(!prompt.contains("# ROLE"));
        assert!(!prompt.contains("# LOCATION"));
        assert!(!prompt.contains("# CONTEXT"));
        assert!(prompt.contains("# CURRENT TIME"));
    }
}
