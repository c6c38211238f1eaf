//! Collaboration session — one shared exploration of a location
//!
//! All mutation of a session funnels through this type:
//!
//! - environment changes queue on a per-session FIFO lock (phase `Locked`)
//!   and are committed through the store's version check,
//! - messages are committed to history and broadcast in the order their
//!   requests were accepted, whatever the latency of each turn,
//! - closing cancels in-flight turns and their results are discarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentContext, AgentPool};
use crate::biomes::Biome;
use crate::context::{ContextStore, SessionSnapshot, describe_state};
use crate::dispatcher::ActionDispatcher;
use crate::error::{SessionError, StoreError};
use crate::intent::IntentRouter;
use crate::sequencer::{Sequencer, Ticket};
use crate::types::{
    ActionKind, ActionRequest, ActionResult, EnvironmentDelta, EnvironmentState, Intent, Message, Role,
};

/// Author used for notices the session itself produces
pub const SYSTEM_AUTHOR: &str = "biosphere";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Active,
    /// An environment-mutating action is in flight
    Locked,
    /// Terminal
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Locked => write!(f, "locked"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Broadcast to every participant of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Message { message: Message },
    StateChanged { state: EnvironmentState },
    ActionCompleted { result: ActionResult },
    PhaseChanged { phase: SessionPhase },
    Closed { session_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are closed by the hub's reaper
    pub idle_timeout: Duration,
    /// Re-read-and-retry rounds for a stale proposal within one turn
    pub conflict_retries: u32,
    pub broadcast_capacity: usize,
    /// Where closed sessions are archived as `<session_id>.json`
    pub archive_dir: Option<PathBuf>,
    /// Location for sessions created without one
    pub default_location: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            conflict_retries: 3,
            broadcast_capacity: 256,
            archive_dir: None,
            default_location: "rainforest".to_string(),
        }
    }
}

/// Process-wide components shared by every session. Built once at startup.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn ContextStore>,
    pub router: Arc<IntentRouter>,
    pub pool: Arc<AgentPool>,
    pub dispatcher: Arc<ActionDispatcher>,
}

/// Summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub location_id: String,
    pub participants: Vec<String>,
    pub phase: SessionPhase,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

#[derive(Serialize)]
struct SessionArchive<'a> {
    session_id: &'a str,
    created_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
    reason: &'a str,
    history: &'a [Message],
    state: &'a EnvironmentState,
}

pub struct CollaborationSession {
    id: String,
    created_at: DateTime<Utc>,
    services: SessionServices,
    config: SessionConfig,
    /// Open connections per participant id
    participants: Mutex<BTreeMap<String, usize>>,
    phase: watch::Sender<SessionPhase>,
    /// FIFO queue for environment mutations; holding it is the `Locked` phase
    mutation_lock: tokio::sync::Mutex<()>,
    sequencer: Sequencer,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
}

impl CollaborationSession {
    pub fn new(
        id: impl Into<String>,
        location_id: &str,
        services: SessionServices,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        validate_session_id(&id)?;
        let state = services.store.open(&id, location_id)?;
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (phase, _) = watch::channel(SessionPhase::Active);

        info!("Session {}: created at '{}' (v{})", id, state.location_id, state.version);
        Ok(Self {
            id,
            created_at: Utc::now(),
            services,
            config,
            participants: Mutex::new(BTreeMap::new()),
            phase,
            mutation_lock: tokio::sync::Mutex::new(()),
            sequencer: Sequencer::new(),
            events,
            cancel: CancellationToken::new(),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch phase transitions
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn participants(&self) -> Vec<String> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Register a connection for a participant and subscribe it to session
    /// events. The same participant may hold several connections.
    pub fn join(&self, participant: &str) -> Result<broadcast::Receiver<SessionEvent>, SessionError> {
        self.ensure_open()?;
        let receiver = self.events.subscribe();
        let connections = {
            let mut participants = self.participants.lock().unwrap_or_else(PoisonError::into_inner);
            let count = participants.entry(participant.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if connections == 1 {
            info!("Session {}: '{}' joined", self.id, participant);
        } else {
            debug!("Session {}: '{}' opened connection #{}", self.id, participant, connections);
        }
        self.touch();
        Ok(receiver)
    }

    /// Drop one of a participant's connections; returns how many connections
    /// remain in the session, or None if the participant was not connected
    pub fn leave(&self, participant: &str) -> Option<usize> {
        let mut participants = self.participants.lock().unwrap_or_else(PoisonError::into_inner);
        let count = participants.get_mut(participant)?;
        *count -= 1;
        if *count == 0 {
            participants.remove(participant);
            info!("Session {}: '{}' left", self.id, participant);
        }
        Some(participants.values().sum())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn current_state(&self) -> Result<EnvironmentState, SessionError> {
        Ok(self.services.store.current_state(&self.id)?)
    }

    pub fn history(&self, window: Option<usize>) -> Result<Vec<Message>, SessionError> {
        Ok(self.services.store.history(&self.id, window)?)
    }

    pub fn info(&self) -> SessionInfo {
        let (location_id, version) = match self.services.store.current_state(&self.id) {
            Ok(state) => (state.location_id, state.version),
            Err(_) => (String::new(), 0),
        };
        SessionInfo {
            session_id: self.id.clone(),
            location_id,
            participants: self.participants(),
            phase: self.phase(),
            version,
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }

    /// Process one user message and return everything it committed: the
    /// message itself followed by the responses.
    pub async fn handle_message(&self, author: &str, text: &str) -> Result<Vec<Message>, SessionError> {
        self.ensure_open()?;
        self.touch();

        let ticket = self.sequencer.issue();
        let request = Message::new(&self.id, author, Role::User, text);
        debug!("Session {}: accepted message {} from '{}' (ticket {})", self.id, request.id, author, ticket.seq());

        let responses = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled(&request)),
            result = self.process(&request) => result.map_err(|e| self.on_error(e))?,
        };

        let mut committed = Vec::with_capacity(responses.len() + 1);
        committed.push(request);
        committed.extend(responses);
        self.commit(ticket, committed).await
    }

    /// Propose an environment change directly, outside a chat turn
    pub async fn propose_state(
        &self,
        author: &str,
        delta: &EnvironmentDelta,
        expected_version: u64,
    ) -> Result<EnvironmentState, SessionError> {
        self.ensure_open()?;
        self.touch();
        let ticket = self.sequencer.issue();

        let state = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled(self.id.clone())),
            guard = self.mutation_lock.lock() => {
                self.set_phase(SessionPhase::Locked);
                let result = self.services.store.propose_state(&self.id, delta, expected_version, author);
                self.set_phase(SessionPhase::Active);
                drop(guard);
                result.map_err(|e| self.on_error(e.into()))?
            }
        };
        self.emit(SessionEvent::StateChanged { state: state.clone() });

        let notice = self.notice(format!(
            "{} changed {} → {}",
            author,
            delta.describe(),
            describe_state(&state)
        ));
        self.commit(ticket, vec![notice]).await?;
        Ok(state)
    }

    /// Close the session. Idempotent; only the first call archives and
    /// returns the snapshot.
    pub async fn close(&self, reason: &str) -> Option<SessionSnapshot> {
        if !self.mark_closed(reason) {
            return None;
        }

        let snapshot = match self.services.store.remove(&self.id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Session {}: could not remove from store: {}", self.id, e);
                None
            }
        };

        if let (Some(dir), Some(snapshot)) = (&self.config.archive_dir, &snapshot) {
            match self.archive(dir, snapshot, reason).await {
                Ok(path) => info!("Session {}: archived to {}", self.id, path.display()),
                Err(e) => warn!("Session {}: archive failed: {:#}", self.id, e),
            }
        }
        snapshot
    }

    async fn process(&self, request: &Message) -> Result<Vec<Message>, SessionError> {
        let services = &self.services;
        let window = services.router.config().history_window;
        let history = services.store.history(&self.id, Some(window))?;

        let intent = services.router.classify(request, &history).await;
        if !services.router.meets_threshold(&intent) {
            debug!(
                "Session {}: {} at confidence {:.2} below threshold, asking for clarification",
                self.id, intent.category, intent.confidence
            );
            return Ok(vec![self.notice(clarification(&intent)).reply_to(&request.id)]);
        }

        let state = services.store.current_state(&self.id)?;
        let ctx = AgentContext {
            message: request,
            history: &history,
            state: &state,
        };
        let resolution = services.pool.resolve(&intent, &ctx).await;

        let mut responses: Vec<Message> = resolution
            .turns
            .iter()
            .map(|turn| Message::new(&self.id, &turn.agent, Role::Agent, &turn.text).reply_to(&request.id))
            .collect();
        if resolution.partial {
            responses.push(
                self.notice("Partial answer: the agent chain reached its depth limit.")
                    .reply_to(&request.id),
            );
        }

        if let Some(action) = resolution.action {
            let notices = if action.mutates_environment() {
                self.run_mutation(action, &request.author).await?
            } else {
                let result = services.dispatcher.execute(&action).await;
                self.emit(SessionEvent::ActionCompleted { result: result.clone() });
                vec![self.notice(describe_result(&result))]
            };
            responses.extend(notices.into_iter().map(|m| m.reply_to(&request.id)));
        }
        Ok(responses)
    }

    /// Queue behind other mutations, then apply one
    async fn run_mutation(&self, request: ActionRequest, author: &str) -> Result<Vec<Message>, SessionError> {
        let _guard = self.mutation_lock.lock().await;
        self.set_phase(SessionPhase::Locked);
        let outcome = self.apply_mutation(request, author).await;
        self.set_phase(SessionPhase::Active);
        outcome
    }

    async fn apply_mutation(&self, mut request: ActionRequest, author: &str) -> Result<Vec<Message>, SessionError> {
        let services = &self.services;
        let mut state = services.store.current_state(&self.id)?;

        if !same_location(&request.location_id, &state.location_id) {
            debug!(
                "Session {}: refusing change aimed at '{}' (session is at '{}')",
                self.id, request.location_id, state.location_id
            );
            return Ok(vec![self.notice(format!(
                "This session is exploring the {}, so nothing was changed. Open a session at the {} to adjust it there.",
                location_name(&state.location_id),
                location_name(&request.location_id)
            ))]);
        }

        let Some(mut delta) = request.delta_against(&state) else {
            return Ok(Vec::new());
        };
        if delta.is_empty() {
            return Ok(vec![self.notice(format!(
                "Nothing to change: {}.",
                describe_state(&state)
            ))]);
        }
        request.delta = Some(delta.clone());
        request.environment = state.clone();
        let mut notices = Vec::new();

        // The scene must accept the change before it is committed
        if services.dispatcher.registry().supports(ActionKind::SceneUpdate) {
            let result = services.dispatcher.execute(&request).await;
            self.emit(SessionEvent::ActionCompleted { result: result.clone() });
            notices.push(self.notice(describe_result(&result)));
            if !result.succeeded {
                return Ok(notices);
            }
        }

        let retries = self.config.conflict_retries;
        for attempt in 0..=retries {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Cancelled(self.id.clone()));
            }
            match services.store.propose_state(&self.id, &delta, state.version, author) {
                Ok(updated) => {
                    self.emit(SessionEvent::StateChanged { state: updated.clone() });
                    notices.push(self.notice(format!(
                        "{} changed {} → {}",
                        author,
                        delta.describe(),
                        describe_state(&updated)
                    )));
                    return Ok(notices);
                }
                Err(StoreError::Conflict(conflict)) => {
                    warn!(
                        "Session {}: {} (attempt {}/{})",
                        self.id,
                        conflict,
                        attempt + 1,
                        retries + 1
                    );
                    state = services.store.current_state(&self.id)?;
                    // Targets are re-resolved against the state that won
                    delta = request.delta_against(&state).unwrap_or(delta);
                    if delta.is_empty() {
                        notices.push(self.notice(format!("Nothing to change: {}.", describe_state(&state))));
                        return Ok(notices);
                    }
                }
                Err(StoreError::InvalidDelta(reason)) => {
                    notices.push(self.notice(format!("Could not apply the change: {}.", reason)));
                    return Ok(notices);
                }
                Err(e) => return Err(e.into()),
            }
        }

        notices.push(self.notice(format!(
            "Another change landed first and {} could not be applied after {} attempts. Please retry.",
            delta.describe(),
            retries + 1
        )));
        Ok(notices)
    }

    /// Wait for this ticket's turn, then append and broadcast in order
    async fn commit(&self, ticket: Ticket, messages: Vec<Message>) -> Result<Vec<Message>, SessionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled(self.id.clone())),
            _ = ticket.wait_turn() => {}
        }

        for message in &messages {
            if let Err(e) = self.services.store.append(&self.id, message.clone()) {
                return Err(self.on_error(e.into()));
            }
            self.emit(SessionEvent::Message {
                message: message.clone(),
            });
        }
        ticket.complete();
        self.touch();
        Ok(messages)
    }

    fn notice(&self, text: impl Into<String>) -> Message {
        Message::new(&self.id, SYSTEM_AUTHOR, Role::System, text)
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine: nobody is connected
        let _ = self.events.send(event);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, to: SessionPhase) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Closed || *phase == to {
                false
            } else {
                *phase = to;
                true
            }
        });
        if changed {
            self.emit(SessionEvent::PhaseChanged { phase: to });
        }
    }

    /// Move to `Closed` exactly once
    fn mark_closed(&self, reason: &str) -> bool {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Closed {
                false
            } else {
                *phase = SessionPhase::Closed;
                true
            }
        });
        if changed {
            info!("Session {}: closed ({})", self.id, reason);
            self.cancel.cancel();
            self.participants
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            self.emit(SessionEvent::PhaseChanged {
                phase: SessionPhase::Closed,
            });
            self.emit(SessionEvent::Closed {
                session_id: self.id.clone(),
                reason: reason.to_string(),
            });
        }
        changed
    }

    fn cancelled(&self, request: &Message) -> SessionError {
        debug!("Session {}: discarded result for message {}", self.id, request.id);
        SessionError::Cancelled(self.id.clone())
    }

    /// Storage failures are fatal to the session
    fn on_error(&self, err: SessionError) -> SessionError {
        if let SessionError::Store(store_err) = &err {
            if store_err.is_fatal() {
                warn!("Session {}: fatal store error: {}", self.id, store_err);
                self.mark_closed("storage failure");
            }
        }
        err
    }

    async fn archive(&self, dir: &Path, snapshot: &SessionSnapshot, reason: &str) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let record = SessionArchive {
            session_id: &snapshot.session_id,
            created_at: self.created_at,
            closed_at: Utc::now(),
            reason,
            history: &snapshot.history,
            state: &snapshot.state,
        };
        let path = dir.join(format!("{}.json", self.id));
        let body = serde_json::to_vec_pretty(&record).context("Failed to serialize session archive")?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Session ids become file names when archived
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(id.to_string()))
    }
}

fn clarification(intent: &Intent) -> String {
    let mut text = String::from("I'm not sure what you'd like me to do");
    if let Some(reason) = intent.param_str("reason") {
        text.push_str(&format!(" ({})", reason));
    }
    text.push_str(
        ". Could you rephrase? For example: \"show me the rainforest biome in 3D\", \
         \"plot the desert temperature trend\" or \"raise the humidity by 5\".",
    );
    text
}

fn same_location(a: &str, b: &str) -> bool {
    match (Biome::lookup(a), Biome::lookup(b)) {
        (Some(x), Some(y)) => x.id == y.id,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

fn location_name(location_id: &str) -> String {
    Biome::lookup(location_id)
        .map(|b| b.name.to_string())
        .unwrap_or_else(|| location_id.to_string())
}

fn describe_result(result: &ActionResult) -> String {
    if result.succeeded {
        let payload = serde_json::to_string(&result.payload).unwrap_or_default();
        format!("{} ready: {}", result.action_kind, payload)
    } else {
        format!(
            "{} failed: {}. Ask again to retry.",
            result.action_kind,
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}
