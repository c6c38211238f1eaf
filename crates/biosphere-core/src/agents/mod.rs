pub mod pool;
pub mod profile;

pub use pool::{AgentContext, AgentPool, AgentPoolConfig, AgentTurn, Resolution};
pub use profile::{AgentDescriptor, default_descriptors};
