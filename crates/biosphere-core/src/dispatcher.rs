//! Action dispatcher — executes an ActionRequest against its collaborator
//!
//! Read-only calls (data queries, plots) are retried on transient failure.
//! Calls with side effects are issued exactly once; repeating them is the
//! session's decision.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capabilities::CapabilityRegistry;
use crate::error::CollaboratorError;
use crate::types::{ActionRequest, ActionResult};

/// Upper bound on the wait between read retries
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Total attempts for read-only calls
    pub read_attempts: u32,
    /// Per-call timeout
    pub timeout: Duration,
    /// Base delay between read retries, doubled each attempt up to
    /// `MAX_RETRY_DELAY`
    pub retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            read_attempts: 3,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(250),
        }
    }
}

pub struct ActionDispatcher {
    registry: Arc<CapabilityRegistry>,
    config: DispatcherConfig,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Execute one request and normalize the outcome. Never panics or errors;
    /// failures come back as `succeeded = false`.
    pub async fn execute(&self, request: &ActionRequest) -> ActionResult {
        let kind = request.kind;
        let Some(collaborator) = self.registry.collaborator(kind) else {
            let err = CollaboratorError::NotRegistered(kind.to_string());
            warn!("ActionDispatcher: {}", err);
            return ActionResult::failure(kind, err.to_string());
        };

        let attempts = if kind.is_read_only() {
            self.config.read_attempts.max(1)
        } else {
            1
        };

        let mut last_error = None;
        for attempt in 0..attempts {
            debug!(
                "ActionDispatcher: {} → {} attempt {}/{}",
                kind,
                collaborator.name(),
                attempt + 1,
                attempts
            );

            let outcome = match tokio::time::timeout(self.config.timeout, collaborator.call(request)).await {
                Ok(result) => result,
                Err(_) => Err(CollaboratorError::Timeout(self.config.timeout.as_secs())),
            };

            match outcome {
                Ok(payload) => {
                    info!("ActionDispatcher: {} succeeded via {}", kind, collaborator.name());
                    return ActionResult::success(kind, payload);
                }
                Err(e) => {
                    let retry = e.is_transient() && attempt + 1 < attempts;
                    warn!(
                        "ActionDispatcher: {} failed via {} (attempt {}, will_retry={}): {}",
                        kind,
                        collaborator.name(),
                        attempt + 1,
                        retry,
                        e
                    );
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }

        let message = last_error
            .map(|e| format!("{} failed: {}", collaborator.name(), e))
            .unwrap_or_else(|| format!("{} failed", collaborator.name()));
        ActionResult::failure(kind, message)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_RETRY_DELAY)
    }
}
