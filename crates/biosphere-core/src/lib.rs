//! biosphere-core - Multi-agent query orchestration for BioSphere 2
//!
//! This crate provides:
//! - Intent classification of natural-language requests, with validation
//! - An agent pool that answers intents and chains specialists
//! - An action dispatcher for the data, plot, image and 3D-scene services
//! - Collaborative sessions with ordered delivery and versioned environment state
//! - Language-model backends (Anthropic, Ollama, failover)

pub mod agents;
pub mod biomes;
pub mod capabilities;
pub mod collaborators;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod intent;
pub mod llm;
pub mod sequencer;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use agents::{AgentDescriptor, AgentPool, AgentPoolConfig, default_descriptors};
pub use biomes::Biome;
pub use capabilities::CapabilityRegistry;
pub use collaborators::{Collaborator, HttpCollaborator, LocalSceneService};
pub use context::{ContextStore, InMemoryContextStore};
pub use dispatcher::{ActionDispatcher, DispatcherConfig};
pub use error::{
    AgentChainLimitError, ClassificationError, CollaboratorError, ConflictError, SessionError, StoreError,
};
pub use hub::CollaborationHub;
pub use intent::{IntentRouter, IntentRouterConfig};
pub use llm::{AnthropicModel, FailoverModel, LanguageModel, OllamaModel};
pub use session::{CollaborationSession, SessionConfig, SessionEvent, SessionInfo, SessionPhase, SessionServices};
pub use types::{
    ActionKind, ActionRequest, ActionResult, EnvParameter, EnvironmentDelta, EnvironmentState, Intent,
    IntentCategory, Message, Role,
};
