//! Error taxonomy for the orchestration layer

use thiserror::Error;

/// A proposal carried a version that no longer matches the stored state
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("stale environment version: expected {expected}, current is {actual}")]
pub struct ConflictError {
    pub expected: u64,
    pub actual: u64,
}

/// ContextStore failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("invalid environment delta: {0}")]
    InvalidDelta(String),
    #[error("message {message_id} belongs to session '{owner}', not '{session_id}'")]
    ForeignMessage {
        message_id: String,
        owner: String,
        session_id: String,
    },
    /// Unrecoverable backing-store failure; fatal to the session
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Why a model response could not become an actionable intent
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassificationError {
    #[error("no JSON object in model response")]
    NoJson,
    #[error("malformed JSON: {0}")]
    BadJson(String),
    #[error("unknown intent category '{0}'")]
    UnknownCategory(String),
    #[error("{category} is missing required parameter '{parameter}'")]
    MissingParameter { category: String, parameter: String },
    #[error("invalid value for '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },
    #[error("classifier backend failed: {0}")]
    Backend(String),
}

/// Downstream service failures, normalized into a failed ActionResult
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("no collaborator registered for {0}")]
    NotRegistered(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("collaborator returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("collaborator timed out after {0}s")]
    Timeout(u64),
    #[error("unusable collaborator payload: {0}")]
    BadPayload(String),
}

impl CollaboratorError {
    /// Transient failures worth another attempt on read-only calls
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A multi-agent chain wanted more hops than the configured cap
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("agent chain exceeded depth cap of {cap}")]
pub struct AgentChainLimitError {
    pub cap: usize,
}

/// CollaborationSession failures surfaced to callers
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' is closed")]
    Closed(String),
    #[error("request cancelled because session '{0}' closed")]
    Cancelled(String),
    #[error("invalid session id '{0}': use 1-128 letters, digits, '-' or '_'")]
    InvalidSessionId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
