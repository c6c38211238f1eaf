//! Gateway wire types — JSON bodies for the REST endpoints and WebSocket frames

use biosphere_core::{EnvironmentDelta, Message};
use serde::{Deserialize, Serialize};

/// `POST /chat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub author: String,
    pub text: String,
}

/// Everything the turn committed: the user message followed by the responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub messages: Vec<Message>,
}

/// `POST /state/{session_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateProposalRequest {
    #[serde(default)]
    pub author: Option<String>,
    pub delta: EnvironmentDelta,
    pub expected_version: u64,
}

/// Error body for every non-2xx response. `expected`/`actual` are set on conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            expected: None,
            actual: None,
        }
    }
}

/// Client → Gateway WebSocket frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat {
        text: String,
    },
    ProposeState {
        delta: EnvironmentDelta,
        expected_version: u64,
    },
}

impl ClientFrame {
    /// Parse a text frame. Blank frames yield `None`; plain text is chat.
    /// Text that opens a JSON object must be a valid frame.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).map(Some);
        }
        Ok(Some(Self::Chat {
            text: trimmed.to_string(),
        }))
    }
}

/// Gateway → Client frame reporting a failed request on this connection only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: ErrorBody,
}

impl ErrorFrame {
    pub fn new(body: ErrorBody) -> Self {
        Self {
            kind: "error".to_string(),
            body,
        }
    }
}
