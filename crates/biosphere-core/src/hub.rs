//! Collaboration hub — the registry of live sessions
//!
//! Constructed once at startup and passed by reference to whatever needs
//! sessions (gateway, CLI). Sessions are created on first contact and removed
//! when they close.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::SessionSnapshot;
use crate::error::{SessionError, StoreError};
use crate::session::{
    CollaborationSession, SessionConfig, SessionEvent, SessionInfo, SessionServices, validate_session_id,
};
use crate::types::{EnvironmentDelta, EnvironmentState, Message};

pub struct CollaborationHub {
    services: SessionServices,
    config: SessionConfig,
    sessions: DashMap<String, Arc<CollaborationSession>>,
}

impl CollaborationHub {
    pub fn new(services: SessionServices, config: SessionConfig) -> Self {
        Self {
            services,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<CollaborationSession>> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .filter(|s| !s.is_closed())
    }

    /// Existing live session, or a new one at `location` (default location if none)
    pub fn get_or_create(
        &self,
        session_id: &str,
        location: Option<&str>,
    ) -> Result<Arc<CollaborationSession>, SessionError> {
        validate_session_id(session_id)?;
        if let Some(session) = self.get(session_id) {
            return Ok(session);
        }

        let mut entry = self.sessions.entry(session_id.to_string()).or_try_insert_with(|| {
            self.create(session_id, location)
        })?;
        // A closed session left in the map is replaced, never reopened
        if entry.is_closed() {
            *entry = self.create(session_id, location)?;
        }
        Ok(entry.value().clone())
    }

    fn create(&self, session_id: &str, location: Option<&str>) -> Result<Arc<CollaborationSession>, SessionError> {
        let location = location.unwrap_or(&self.config.default_location);
        Ok(Arc::new(CollaborationSession::new(
            session_id,
            location,
            self.services.clone(),
            self.config.clone(),
        )?))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|s| !s.is_closed())
            .map(|s| s.info())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Connect a participant, creating the session on first connection
    pub fn join(
        &self,
        session_id: &str,
        participant: &str,
        location: Option<&str>,
    ) -> Result<(Arc<CollaborationSession>, broadcast::Receiver<SessionEvent>), SessionError> {
        let session = self.get_or_create(session_id, location)?;
        let events = session.join(participant)?;
        Ok((session, events))
    }

    /// Disconnect a participant; the last one out closes the session.
    /// Returns true if the session closed.
    pub async fn leave(&self, session_id: &str, participant: &str) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        if session.leave(participant) != Some(0) {
            return false;
        }
        self.close(session_id, "all participants disconnected").await.is_some()
    }

    /// Close and remove a session
    pub async fn close(&self, session_id: &str, reason: &str) -> Option<SessionSnapshot> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.close(reason).await
    }

    pub async fn handle_message(
        &self,
        session_id: &str,
        author: &str,
        text: &str,
    ) -> Result<Vec<Message>, SessionError> {
        let session = self.get_or_create(session_id, None)?;
        let result = session.handle_message(author, text).await;
        self.evict_if_closed(&session);
        result
    }

    pub fn current_state(&self, session_id: &str) -> Result<EnvironmentState, SessionError> {
        self.get(session_id)
            .ok_or_else(|| SessionError::Store(StoreError::SessionNotFound(session_id.to_string())))?
            .current_state()
    }

    pub async fn propose_state(
        &self,
        session_id: &str,
        author: &str,
        delta: &EnvironmentDelta,
        expected_version: u64,
    ) -> Result<EnvironmentState, SessionError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| SessionError::Store(StoreError::SessionNotFound(session_id.to_string())))?;
        let result = session.propose_state(author, delta, expected_version).await;
        self.evict_if_closed(&session);
        result
    }

    /// Close every session idle longer than the configured timeout
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.is_closed() || s.idle_for() >= self.config.idle_timeout)
            .map(|s| s.key().clone())
            .collect();

        for id in &idle {
            self.close(id, "idle timeout").await;
        }
        if !idle.is_empty() {
            info!("CollaborationHub: reaped {} idle sessions", idle.len());
        }
        idle
    }

    /// Background task closing idle sessions until `cancel` fires
    pub fn spawn_idle_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = (self.config.idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("CollaborationHub: idle reaper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        hub.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.close(&id, "server shutting down").await;
        }
    }

    fn evict_if_closed(&self, session: &Arc<CollaborationSession>) {
        if session.is_closed() {
            self.sessions
                .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentPool, AgentPoolConfig, default_descriptors};
    use crate::capabilities::CapabilityRegistry;
    use crate::collaborators::{Collaborator, LocalSceneService};
    use crate::context::{ContextStore, InMemoryContextStore};
    use crate::dispatcher::{ActionDispatcher, DispatcherConfig};
    use crate::error::ConflictError;
    use crate::intent::{IntentRouter, IntentRouterConfig};
    use crate::session::{SYSTEM_AUTHOR, SessionPhase};
    use crate::testing::{RecordingCollaborator, ScriptedModel};
    use crate::types::{ActionKind, EnvParameter, Role};
    use serde_json::json;

    struct Fixture {
        hub: Arc<CollaborationHub>,
        store: Arc<InMemoryContextStore>,
        agents: Arc<ScriptedModel>,
    }

    fn keyword_router() -> IntentRouter {
        IntentRouter::heuristic(IntentRouterConfig::default())
    }

    fn fixture_with(
        router: IntentRouter,
        agents: ScriptedModel,
        registry: CapabilityRegistry,
        config: SessionConfig,
    ) -> Fixture {
        let store = Arc::new(InMemoryContextStore::new());
        let agents = Arc::new(agents);
        let pool = AgentPool::new(agents.clone(), default_descriptors(), AgentPoolConfig::default()).unwrap();
        let dispatcher = ActionDispatcher::new(
            Arc::new(registry),
            DispatcherConfig {
                timeout: Duration::from_secs(5),
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let services = SessionServices {
            store: store.clone(),
            router: Arc::new(router),
            pool: Arc::new(pool),
            dispatcher: Arc::new(dispatcher),
        };
        Fixture {
            hub: Arc::new(CollaborationHub::new(services, config)),
            store,
            agents,
        }
    }

    fn scene_registry(scene: Arc<dyn Collaborator>) -> CapabilityRegistry {
        CapabilityRegistry::builder()
            .register(ActionKind::SceneUpdate, scene)
            .build()
    }

    fn drain_messages(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Message { message } = event {
                messages.push(message);
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_rainforest_3d_end_to_end() {
        let router_model = Arc::new(ScriptedModel::new(
            r#"{"category":"visualize_3d","parameters":{"location_id":"rainforest"},"confidence":0.93}"#,
        ));
        let fx = fixture_with(
            IntentRouter::new(router_model, IntentRouterConfig::default()),
            ScriptedModel::new("Here is the rainforest canopy in 3D."),
            scene_registry(Arc::new(LocalSceneService)),
            SessionConfig::default(),
        );
        let (_session, mut rx) = fx.hub.join("s1", "alice", Some("rainforest")).unwrap();

        let messages = fx
            .hub
            .handle_message("s1", "alice", "show me the rainforest biome in 3D")
            .await
            .unwrap();
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].author, "visualizer");
        assert!(messages.last().unwrap().text.starts_with("scene_update ready"));

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::ActionCompleted { result } = event {
                completed = Some(result);
            }
        }
        let result = completed.expect("scene action should complete");
        assert_eq!(result.action_kind, ActionKind::SceneUpdate);
        assert!(result.succeeded);
        assert_eq!(result.payload["location_id"], "rainforest");

        // Viewing does not mutate
        assert_eq!(fx.hub.current_state("s1").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_low_confidence_never_executes() {
        let router_model = Arc::new(ScriptedModel::new(
            r#"{"category":"visualize_3d","parameters":{"location_id":"rainforest"},"confidence":0.2}"#,
        ));
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})));
        let fx = fixture_with(
            IntentRouter::new(router_model, IntentRouterConfig::default()),
            ScriptedModel::new("should not be asked"),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );

        let messages = fx.hub.handle_message("s1", "alice", "uh, rainforest 3d maybe?").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::System);
        assert!(messages[1].text.contains("rephrase"));
        assert_eq!(messages[1].in_reply_to.as_deref(), Some(messages[0].id.as_str()));
        assert_eq!(scene.call_count(), 0);
        assert!(fx.agents.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_classification_gets_clarification() {
        let router_model = Arc::new(ScriptedModel::new(
            r#"{"category":"visualize_3d","parameters":{},"confidence":0.99}"#,
        ));
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})));
        let fx = fixture_with(
            IntentRouter::new(router_model, IntentRouterConfig::default()),
            ScriptedModel::new("unused"),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );

        let messages = fx.hub.handle_message("s1", "alice", "show it in 3D").await.unwrap();
        assert!(messages[1].text.contains("location_id"));
        assert_eq!(scene.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_messages_commit_in_acceptance_order() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("fast answer").on_slow("first question", "slow answer", Duration::from_millis(150)),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let (_session, mut rx) = fx.hub.join("s1", "alice", None).unwrap();

        let (first, second) = tokio::join!(
            fx.hub.handle_message("s1", "alice", "first question"),
            fx.hub.handle_message("s1", "bob", "second question"),
        );
        assert_eq!(first.unwrap()[1].text, "slow answer");
        assert_eq!(second.unwrap()[1].text, "fast answer");

        let texts: Vec<String> = drain_messages(&mut rx).into_iter().map(|m| m.text).collect();
        assert_eq!(
            texts,
            vec!["first question", "slow answer", "second question", "fast answer"]
        );
        let stored: Vec<String> = fx
            .store
            .history("s1", None)
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(stored, texts);
    }

    #[tokio::test]
    async fn test_chain_cap_flags_partial() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("Let me pass this on.\nHANDOFF: data_analyst")
                .on("data analyst", "Back to you.\nHANDOFF: general"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let messages = fx.hub.handle_message("s1", "alice", "hello there").await.unwrap();
        let agent_turns = messages.iter().filter(|m| m.role == Role::Agent).count();
        assert_eq!(agent_turns, 3);
        assert!(messages.iter().any(|m| m.author == SYSTEM_AUTHOR && m.text.starts_with("Partial answer")));
    }

    #[tokio::test]
    async fn test_adjust_turn_updates_state_after_scene() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({"ok": true})));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("Warming things up."),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );
        let (session, mut rx) = fx.hub.join("s1", "alice", Some("rainforest")).unwrap();
        let mut phases = session.watch_phase();

        let messages = fx
            .hub
            .handle_message("s1", "alice", "raise the temperature by 2")
            .await
            .unwrap();
        let state = fx.hub.current_state("s1").unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.temperature, 30.0);
        assert_eq!(state.last_modified_by.as_deref(), Some("alice"));
        assert_eq!(scene.call_count(), 1);
        assert_eq!(scene.requests()[0].delta.as_ref().unwrap().temperature, Some(2.0));
        assert!(messages.last().unwrap().text.contains("temperature +2.0 °C"));
        assert_eq!(*phases.borrow_and_update(), SessionPhase::Active);

        let mut saw_locked = false;
        let mut saw_state = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::PhaseChanged { phase: SessionPhase::Locked } => saw_locked = true,
                SessionEvent::StateChanged { state } => saw_state = state.version == 1,
                _ => {}
            }
        }
        assert!(saw_locked && saw_state);
    }

    #[tokio::test]
    async fn test_set_to_value_commits_difference() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("Setting it."),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );
        fx.hub.get_or_create("s1", Some("rainforest")).unwrap();

        fx.hub
            .handle_message("s1", "alice", "set the temperature to 25")
            .await
            .unwrap();
        let state = fx.hub.current_state("s1").unwrap();
        assert_eq!(state.temperature, 25.0);
        assert_eq!(state.version, 1);
        assert_eq!(scene.requests()[0].delta.as_ref().unwrap().temperature, Some(-3.0));

        let messages = fx
            .hub
            .handle_message("s1", "bob", "set the temperature to 25")
            .await
            .unwrap();
        assert!(messages.last().unwrap().text.starts_with("Nothing to change"));
        assert_eq!(fx.hub.current_state("s1").unwrap().version, 1);
        assert_eq!(scene.call_count(), 1);
    }

    #[tokio::test]
    async fn test_adjust_for_another_location_is_refused() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("On it."),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );
        fx.hub.get_or_create("s2", None).unwrap();

        let messages = fx
            .hub
            .handle_message("s2", "alice", "raise the ocean humidity by 5")
            .await
            .unwrap();
        let state = fx.hub.current_state("s2").unwrap();
        assert_eq!(state.location_id, "rainforest");
        assert_eq!(state.humidity, 85.0);
        assert_eq!(state.version, 0);
        assert_eq!(scene.call_count(), 0);
        let notice = messages.last().unwrap();
        assert_eq!(notice.author, SYSTEM_AUTHOR);
        assert!(notice.text.contains("Rainforest") && notice.text.contains("Ocean"));

        fx.hub
            .handle_message("s2", "alice", "raise the rainforest humidity by 5")
            .await
            .unwrap();
        let state = fx.hub.current_state("s2").unwrap();
        assert_eq!(state.humidity, 90.0);
        assert_eq!(state.version, 1);
        assert_eq!(scene.requests()[0].location_id, "rainforest");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_locked_session_queues_adjust_turns_in_arrival_order() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})).with_delay(Duration::from_millis(150)));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("ok").on_slow("hello there", "hi", Duration::from_millis(60)),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );
        let session = fx.hub.get_or_create("s1", Some("desert")).unwrap();

        let hub = fx.hub.clone();
        let chat = tokio::spawn(async move { hub.handle_message("s1", "carol", "hello there").await });
        let mut turns = Vec::new();
        for amount in 1..=3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let hub = fx.hub.clone();
            turns.push(tokio::spawn(async move {
                hub.handle_message("s1", "alice", &format!("raise the temperature by {amount}"))
                    .await
            }));
        }

        // The chat turn finishes while the first change still holds the lock
        let chat = chat.await.unwrap().unwrap();
        assert_eq!(chat[1].text, "hi");
        assert_eq!(session.phase(), SessionPhase::Locked);
        assert_eq!(fx.hub.current_state("s1").unwrap().version, 0);

        for (i, turn) in turns.into_iter().enumerate() {
            let messages = turn.await.unwrap().unwrap();
            let last = messages.last().unwrap();
            assert!(last.text.contains(&format!("(v{})", i + 1)), "{}", last.text);
        }

        let requests = scene.requests();
        assert_eq!(requests.len(), 3);
        for (i, request) in requests.iter().enumerate() {
            assert_eq!(request.environment.version, i as u64);
            assert_eq!(request.delta.as_ref().unwrap().temperature, Some((i + 1) as f64));
        }
        let state = fx.hub.current_state("s1").unwrap();
        assert_eq!(state.version, 3);
        assert_eq!(state.temperature, 36.0);
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(fx.agents.calls_matching("hello there"), 1);

        let asked: Vec<String> = fx
            .store
            .history("s1", None)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text)
            .collect();
        assert_eq!(
            asked,
            vec![
                "hello there",
                "raise the temperature by 1",
                "raise the temperature by 2",
                "raise the temperature by 3"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_scene_blocks_commit() {
        let scene = Arc::new(
            RecordingCollaborator::new("scene", json!({}))
                .then(Err(crate::error::CollaboratorError::Transport("down".into()))),
        );
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("Trying."),
            scene_registry(scene.clone()),
            SessionConfig::default(),
        );
        let messages = fx
            .hub
            .handle_message("s1", "alice", "lower the light by 10")
            .await
            .unwrap();
        assert_eq!(fx.hub.current_state("s1").unwrap().version, 0);
        assert_eq!(scene.call_count(), 1);
        assert!(messages.last().unwrap().text.contains("scene_update failed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_out_of_band_conflict_is_retried() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})).with_delay(Duration::from_millis(80)));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("ok"),
            scene_registry(scene),
            SessionConfig::default(),
        );
        fx.hub.get_or_create("s1", Some("desert")).unwrap();

        let store = fx.store.clone();
        let bump = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store
                .propose_state("s1", &EnvironmentDelta::single(EnvParameter::Co2, 10.0), 0, "sensor")
                .unwrap()
        });

        fx.hub
            .handle_message("s1", "alice", "raise the temperature by 2")
            .await
            .unwrap();
        assert_eq!(bump.await.unwrap().version, 1);

        let state = fx.hub.current_state("s1").unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.temperature, 32.0);
        assert_eq!(state.co2, 410.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_conflict_exhaustion_asks_to_retry() {
        let scene = Arc::new(RecordingCollaborator::new("scene", json!({})).with_delay(Duration::from_millis(80)));
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("ok"),
            scene_registry(scene),
            SessionConfig {
                conflict_retries: 0,
                ..Default::default()
            },
        );
        fx.hub.get_or_create("s1", None).unwrap();

        let store = fx.store.clone();
        let bump = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store
                .propose_state("s1", &EnvironmentDelta::single(EnvParameter::Co2, 10.0), 0, "sensor")
                .unwrap();
        });

        let messages = fx
            .hub
            .handle_message("s1", "alice", "raise the temperature by 2")
            .await
            .unwrap();
        bump.await.unwrap();
        assert!(messages.last().unwrap().text.contains("Please retry"));
        assert_eq!(fx.hub.current_state("s1").unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_users_concurrent_deltas() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("ok"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        fx.hub.get_or_create("s1", Some("ocean")).unwrap();
        for v in 0..5 {
            fx.hub
                .propose_state("s1", "setup", &EnvironmentDelta::single(EnvParameter::Light, -1.0), v)
                .await
                .unwrap();
        }
        let base = fx.hub.current_state("s1").unwrap();
        assert_eq!(base.version, 5);

        let plus2 = EnvironmentDelta::single(EnvParameter::Temperature, 2.0);
        let plus3 = EnvironmentDelta::single(EnvParameter::Temperature, 3.0);
        let (a, b) = tokio::join!(
            fx.hub.propose_state("s1", "alice", &plus2, 5),
            fx.hub.propose_state("s1", "bob", &plus3, 5),
        );

        let (winner, loser_delta, loser) = match (a, b) {
            (Ok(state), Err(e)) => (state, &plus3, e),
            (Err(e), Ok(state)) => (state, &plus2, e),
            other => panic!("exactly one proposal should win: {other:?}"),
        };
        assert_eq!(winner.version, 6);
        assert!(matches!(
            loser,
            SessionError::Store(StoreError::Conflict(ConflictError { expected: 5, actual: 6 }))
        ));

        let retried = fx.hub.propose_state("s1", "loser", loser_delta, 6).await.unwrap();
        assert_eq!(retried.version, 7);
        assert_eq!(retried.temperature, base.temperature + 5.0);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_turn() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("unused").on_slow("hello", "too late", Duration::from_secs(5)),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let session = fx.hub.get_or_create("s1", None).unwrap();

        let hub = fx.hub.clone();
        let turn = tokio::spawn(async move { hub.handle_message("s1", "alice", "hello there").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let snapshot = fx.hub.close("s1", "test").await.unwrap();

        let result = turn.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled(_))));
        assert!(snapshot.history.is_empty());
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(matches!(
            session.handle_message("alice", "again").await,
            Err(SessionError::Closed(_))
        ));
        assert!(fx.hub.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_last_participant_leaving_closes() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        fx.hub.join("s1", "alice", None).unwrap();
        fx.hub.join("s1", "bob", None).unwrap();
        assert!(!fx.hub.leave("s1", "alice").await);
        assert_eq!(fx.hub.list()[0].participants, vec!["bob".to_string()]);
        assert!(!fx.hub.leave("s1", "mallory").await);
        assert!(fx.hub.leave("s1", "bob").await);
        assert!(fx.hub.list().is_empty());
        assert_eq!(fx.store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_second_tab_keeps_session_open() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let (session, _first) = fx.hub.join("s1", "alice", None).unwrap();
        let (_, mut second) = fx.hub.join("s1", "alice", None).unwrap();
        assert_eq!(session.participants(), vec!["alice".to_string()]);

        assert!(!fx.hub.leave("s1", "alice").await);
        assert!(!session.is_closed());
        assert!(fx.hub.get("s1").is_some());

        fx.hub.handle_message("s1", "alice", "hello").await.unwrap();
        let delivered = drain_messages(&mut second);
        assert_eq!(delivered[0].text, "hello");

        assert!(fx.hub.leave("s1", "alice").await);
        assert!(session.is_closed());
        assert!(!fx.hub.leave("s1", "alice").await);
    }

    #[tokio::test]
    async fn test_reconnect_after_close_creates_fresh_session() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let first = fx.hub.get_or_create("s1", None).unwrap();
        fx.hub.close("s1", "test").await;
        let second = fx.hub.get_or_create("s1", None).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.phase(), SessionPhase::Active);
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_idle_sessions_reaped_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("Hello!"),
            CapabilityRegistry::builder().build(),
            SessionConfig {
                idle_timeout: Duration::from_millis(20),
                archive_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        );
        fx.hub.handle_message("s1", "alice", "hello there").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(fx.hub.reap_idle().await, vec!["s1".to_string()]);
        assert!(fx.hub.is_empty());

        let archived: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("s1.json")).unwrap()).unwrap();
        assert_eq!(archived["session_id"], "s1");
        assert_eq!(archived["reason"], "idle timeout");
        assert_eq!(archived["history"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_idle_reaper_task() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig {
                idle_timeout: Duration::from_millis(40),
                ..Default::default()
            },
        );
        fx.hub.get_or_create("s1", None).unwrap();
        let cancel = CancellationToken::new();
        let reaper = fx.hub.spawn_idle_reaper(cancel.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.hub.get("s1").is_none());
        cancel.cancel();
        reaper.await.unwrap();
    }

    #[test]
    fn test_invalid_session_ids_rejected() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        let too_long = "x".repeat(129);
        for bad in ["", "../etc", "a b", too_long.as_str()] {
            assert!(matches!(
                fx.hub.get_or_create(bad, None),
                Err(SessionError::InvalidSessionId(_))
            ));
        }
        assert!(fx.hub.get_or_create("lab-2_B", None).is_ok());
    }

    #[tokio::test]
    async fn test_state_of_unknown_session() {
        let fx = fixture_with(
            keyword_router(),
            ScriptedModel::new("hi"),
            CapabilityRegistry::builder().build(),
            SessionConfig::default(),
        );
        assert!(matches!(
            fx.hub.current_state("nope"),
            Err(SessionError::Store(StoreError::SessionNotFound(_)))
        ));
        let delta = EnvironmentDelta::single(EnvParameter::Temperature, 1.0);
        assert!(fx.hub.propose_state("nope", "a", &delta, 0).await.is_err());
    }
}
