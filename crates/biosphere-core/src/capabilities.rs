//! Capability registry: which collaborator satisfies which intent
//!
//! Built once at startup and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::collaborators::Collaborator;
use crate::types::{ActionKind, IntentCategory};

/// Action kind an intent category resolves to, if it acts at all
pub fn action_for(category: IntentCategory) -> Option<ActionKind> {
    match category {
        IntentCategory::DataQuery => Some(ActionKind::DataQuery),
        IntentCategory::Visualize2d => Some(ActionKind::Plot2d),
        IntentCategory::Visualize3d | IntentCategory::AdjustParameter => Some(ActionKind::SceneUpdate),
        IntentCategory::GenerateImage => Some(ActionKind::ImageGeneration),
        IntentCategory::Chat => None,
    }
}

/// Static mapping from action kinds to their collaborators
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    collaborators: HashMap<ActionKind, Arc<dyn Collaborator>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (kind, collaborator) in &self.collaborators {
            map.entry(&kind.to_string(), &collaborator.name());
        }
        map.finish()
    }
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    pub fn action_for(&self, category: IntentCategory) -> Option<ActionKind> {
        action_for(category)
    }

    pub fn collaborator(&self, kind: ActionKind) -> Option<&Arc<dyn Collaborator>> {
        self.collaborators.get(&kind)
    }

    pub fn supports(&self, kind: ActionKind) -> bool {
        self.collaborators.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    collaborators: HashMap<ActionKind, Arc<dyn Collaborator>>,
}

impl CapabilityRegistryBuilder {
    /// Register `collaborator` for `kind`, replacing any earlier registration
    pub fn register(mut self, kind: ActionKind, collaborator: Arc<dyn Collaborator>) -> Self {
        self.collaborators.insert(kind, collaborator);
        self
    }

    pub fn build(self) -> CapabilityRegistry {
        let mut names: Vec<String> = self
            .collaborators
            .iter()
            .map(|(k, c)| format!("{}={}", k, c.name()))
            .collect();
        names.sort();
        info!("CapabilityRegistry: {} collaborators [{}]", names.len(), names.join(", "));
        CapabilityRegistry {
            collaborators: self.collaborators,
        }
    }
}
