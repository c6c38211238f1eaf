//! Language-model backends
//!
//! Every model invocation goes through [`LanguageModel::complete`]; callers
//! treat the returned text as untrusted input and validate it before it can
//! drive any side effect.

pub mod anthropic;
pub mod failover;
pub mod ollama;

use anyhow::Result;
use async_trait::async_trait;

pub use anthropic::AnthropicModel;
pub use failover::FailoverModel;
pub use ollama::OllamaModel;

/// Trait that all model backends implement
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Human-readable backend name (e.g. "anthropic", "ollama")
    fn provider_name(&self) -> &str;

    /// Model identifier (e.g. "llama3.2:3b")
    fn model(&self) -> &str;

    /// Single-shot completion of `prompt` under `system`
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}
