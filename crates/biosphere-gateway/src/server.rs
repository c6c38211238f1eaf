//! Gateway server — Axum-based HTTP + WS front end for the collaboration hub

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use biosphere_core::session::validate_session_id;
use biosphere_core::{CollaborationHub, CollaborationSession, EnvironmentState, SessionError, SessionEvent, StoreError};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::protocol::{ChatRequest, ChatResponse, ClientFrame, ErrorBody, ErrorFrame, StateProposalRequest};

/// Author recorded for state proposals that do not name one
const API_AUTHOR: &str = "api";

/// Shared state for all handlers
#[derive(Clone)]
pub struct GatewayState {
    pub hub: Arc<CollaborationHub>,
    pub auth_token: String,
    pub start_time: std::time::Instant,
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, hub: Arc<CollaborationHub>, auth_token: String) -> Self {
        let state = GatewayState {
            hub,
            auth_token,
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    pub fn hub(&self) -> &Arc<CollaborationHub> {
        &self.state.hub
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/state/{session_id}", get(get_state_handler).post(propose_state_handler))
        .route("/ws/{session_id}", get(ws_handler))
        .route("/api/status", get(status_handler))
        .route("/api/sessions", get(sessions_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──

/// A failed request, rendered as `{error, expected?, actual?}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(error),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            SessionError::Store(StoreError::InvalidDelta(_)) | SessionError::InvalidSessionId(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::Store(StoreError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            SessionError::Closed(_) => StatusCode::GONE,
            SessionError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Store(StoreError::ForeignMessage { .. } | StoreError::Storage(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut body = ErrorBody::new(err.to_string());
        if let SessionError::Store(StoreError::Conflict(conflict)) = &err {
            body.expected = Some(conflict.expected);
            body.actual = Some(conflict.actual);
        }
        if status.is_server_error() {
            error!("Gateway: request failed: {}", err);
        } else {
            debug!("Gateway: request rejected ({}): {}", status, err);
        }
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn require_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), ApiError> {
    if auth::check_auth(&state.auth_token, headers, None) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

// ── HTTP Handlers ──

async fn chat_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    require_auth(&state, &headers)?;
    if req.author.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "author must not be empty"));
    }
    if req.text.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "text must not be empty"));
    }

    let messages = state
        .hub
        .handle_message(&req.session_id, req.author.trim(), &req.text)
        .await?;
    Ok(Json(ChatResponse { messages }))
}

async fn get_state_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<EnvironmentState>, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.hub.current_state(&session_id)?))
}

async fn propose_state_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(req): Json<StateProposalRequest>,
) -> Result<Json<EnvironmentState>, ApiError> {
    require_auth(&state, &headers)?;
    let author = req
        .author
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(API_AUTHOR);
    let updated = state
        .hub
        .propose_state(&session_id, author, &req.delta, req.expected_version)
        .await?;
    Ok(Json(updated))
}

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let sessions = state.hub.list();
    let participants: usize = sessions.iter().map(|s| s.participants.len()).sum();

    Json(serde_json::json!({
        "status": "ok",
        "sessions": sessions.len(),
        "participants": participants,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn sessions_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(serde_json::json!({ "sessions": state.hub.list() })))
}

// ── WebSocket Handler ──

#[derive(Debug, Deserialize)]
struct WsParams {
    participant: Option<String>,
    location: Option<String>,
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !auth::check_auth(&state.auth_token, &headers, params.token.as_deref()) {
        return ApiError::unauthorized().into_response();
    }
    if let Err(e) = validate_session_id(&session_id) {
        return ApiError::from(e).into_response();
    }
    let Some(participant) = params.participant.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()) else {
        return ApiError::new(StatusCode::BAD_REQUEST, "participant query parameter is required").into_response();
    };

    info!("WebSocket connection from {} as '{}' to session {}", addr, participant, session_id);
    ws.on_upgrade(move |socket| handle_ws(socket, state, session_id, participant, params.location, addr))
}

async fn handle_ws(
    socket: WebSocket,
    state: GatewayState,
    session_id: String,
    participant: String,
    location: Option<String>,
    addr: SocketAddr,
) {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (session, mut events) = match state.hub.join(&session_id, &participant, location.as_deref()) {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Client {} could not join session {}: {}", addr, session_id, e);
            let frame = ErrorFrame::new(ApiError::from(e).body);
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = ws_sender.send(WsMessage::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    // Errors for this client only; session events go to everyone
    let (reply_tx, mut reply_rx) = mpsc::channel::<ErrorFrame>(16);

    let mut send_task = tokio::spawn(async move {
        loop {
            let (json, last) = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        let last = matches!(event, SessionEvent::Closed { .. });
                        (serde_json::to_string(&event), last)
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} lagged by {} events", addr, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(frame) = reply_rx.recv() => (serde_json::to_string(&frame), false),
            };
            match json {
                Ok(json) => {
                    if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize frame: {}", e),
            }
            if last {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = &mut send_task => break,
        };
        let text = match msg {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("Client {} disconnected", addr);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };

        let Some((frame, fatal)) = run_frame(&session, &participant, &text).await else {
            continue;
        };
        debug!("Client {} request failed: {}", addr, frame.body.error);
        if reply_tx.send(frame).await.is_err() || fatal {
            break;
        }
    }

    send_task.abort();
    state.hub.leave(&session_id, &participant).await;
    info!("Client {} ('{}') left session {}", addr, participant, session_id);
}

/// Run one client frame against the session. Returns the error frame for
/// this client, if any, and whether the connection should end.
async fn run_frame(session: &CollaborationSession, participant: &str, raw: &str) -> Option<(ErrorFrame, bool)> {
    let frame = match ClientFrame::parse(raw) {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(e) => {
            let body = ErrorBody::new(format!("unrecognized frame: {}", e));
            return Some((ErrorFrame::new(body), false));
        }
    };
    let outcome = match frame {
        ClientFrame::Chat { text } => session.handle_message(participant, &text).await.map(|_| ()),
        ClientFrame::ProposeState { delta, expected_version } => session
            .propose_state(participant, &delta, expected_version)
            .await
            .map(|_| ()),
    };
    let e = outcome.err()?;
    let fatal = matches!(e, SessionError::Closed(_) | SessionError::Cancelled(_));
    Some((ErrorFrame::new(ApiError::from(e).body), fatal))
}
