//! JSON-over-HTTP collaborator client

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::Collaborator;
use crate::error::CollaboratorError;
use crate::types::ActionRequest;

/// POSTs the request payload to a fixed endpoint and returns its JSON body
#[derive(Clone)]
pub struct HttpCollaborator {
    name: String,
    endpoint: Url,
    client: Client,
}

impl std::fmt::Debug for HttpCollaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCollaborator")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

impl HttpCollaborator {
    pub fn new(name: impl Into<String>, endpoint: Url) -> Result<Self, CollaboratorError> {
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(CollaboratorError::Transport(format!(
                "unsupported scheme '{}' in {}",
                endpoint.scheme(),
                endpoint
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            endpoint,
            client,
        })
    }

    /// Parse `endpoint` and build a client for it
    pub fn parse(name: impl Into<String>, endpoint: &str) -> Result<Self, CollaboratorError> {
        let url = Url::parse(endpoint)
            .map_err(|e| CollaboratorError::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        Self::new(name, url)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &ActionRequest) -> Result<Value, CollaboratorError> {
        debug!("{}: POST {} ({})", self.name, self.endpoint, request.kind);

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request.payload())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout(120)
                } else {
                    CollaboratorError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CollaboratorError::BadPayload(e.to_string()))
    }
}
