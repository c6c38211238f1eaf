//! Failover across model backends

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::LanguageModel;

/// Tries backends in order, retrying transient failures with backoff
pub struct FailoverModel {
    /// Backends in failover order (index 0 = primary)
    backends: Vec<Arc<dyn LanguageModel>>,
    max_retries_per_backend: u32,
    base_retry_delay: Duration,
}

impl FailoverModel {
    pub fn new(backends: Vec<Arc<dyn LanguageModel>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(anyhow!("FailoverModel requires at least one backend"));
        }
        Ok(Self {
            backends,
            max_retries_per_backend: 2,
            base_retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries_per_backend = max_retries.max(1);
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}

#[async_trait]
impl LanguageModel for FailoverModel {
    fn provider_name(&self) -> &str {
        self.backends[0].provider_name()
    }

    fn model(&self) -> &str {
        self.backends[0].model()
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let mut last_error = None;

        for (idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..self.max_retries_per_backend {
                debug!(
                    "Trying backend {} ({}) attempt {}/{}",
                    backend.provider_name(),
                    backend.model(),
                    attempt + 1,
                    self.max_retries_per_backend,
                );

                match backend.complete(system, prompt).await {
                    Ok(text) => {
                        if idx > 0 {
                            info!(
                                "Request succeeded on failover backend {} ({})",
                                backend.provider_name(),
                                backend.model()
                            );
                        }
                        return Ok(text);
                    }
                    Err(e) => {
                        let retryable = is_retryable_error(&e.to_string());
                        warn!(
                            "Backend {} failed (attempt {}, retryable={}): {}",
                            backend.provider_name(),
                            attempt + 1,
                            retryable,
                            e
                        );
                        last_error = Some(e);
                        if !retryable {
                            break;
                        }
                        if attempt + 1 < self.max_retries_per_backend {
                            let delay = self.base_retry_delay * 2u32.pow(attempt);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All backends failed")))
    }
}

/// Determine if an error is retryable (rate limit, server error, timeout)
fn is_retryable_error(err: &str) -> bool {
    let retryable_patterns = [
        "429",
        "500",
        "502",
        "503",
        "504",
        "rate limit",
        "overloaded",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "error sending request",
    ];
    let lower = err.to_lowercase();
    retryable_patterns.iter().any(|p| lower.contains(p))
}
