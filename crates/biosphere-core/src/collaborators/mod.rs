//! External services invoked by the ActionDispatcher
//!
//! The data, plot, image and 3D-scene services live outside this crate; only
//! their call boundary is modelled here.

pub mod http;
pub mod scene;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CollaboratorError;
use crate::types::ActionRequest;

pub use http::HttpCollaborator;
pub use scene::LocalSceneService;

/// A downstream service the dispatcher can call
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Name used in logs and failure messages
    fn name(&self) -> &str;

    /// Issue one call; the dispatcher owns any retry decision
    async fn call(&self, request: &ActionRequest) -> Result<Value, CollaboratorError>;
}
