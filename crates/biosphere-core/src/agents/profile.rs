//! Agent descriptor — an agent's name, role prompt and the intents it accepts

use serde::{Deserialize, Serialize};

use crate::types::IntentCategory;

/// Static description of one agent. Loaded at startup, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub name: String,
    pub role_prompt: String,
    /// Intent categories this agent handles; empty means none (fallback only)
    #[serde(default)]
    pub specializations: Vec<IntentCategory>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, role_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role_prompt: role_prompt.into(),
            specializations: Vec::new(),
        }
    }

    pub fn specialized(mut self, categories: &[IntentCategory]) -> Self {
        self.specializations = categories.to_vec();
        self
    }

    pub fn accepts(&self, category: IntentCategory) -> bool {
        self.specializations.contains(&category)
    }
}

/// Built-in descriptor set used when no profiles are configured
pub fn default_descriptors() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new(
            "general",
            "You are a helpful assistant for the BioSphere 2 research facility. \
             Answer questions about its biomes and guide users towards data, plots, \
             images and 3D views.",
        )
        .specialized(&[IntentCategory::Chat]),
        AgentDescriptor::new(
            "data_analyst",
            "You are the data analyst for BioSphere 2. Interpret environmental \
             measurements, summarise trends and report values with units.",
        )
        .specialized(&[IntentCategory::DataQuery]),
        AgentDescriptor::new(
            "visualizer",
            "You are the visualization specialist for BioSphere 2. Describe the chart \
             or 3D view being produced and what the user should look for in it.",
        )
        .specialized(&[IntentCategory::Visualize2d, IntentCategory::Visualize3d]),
        AgentDescriptor::new(
            "imager",
            "You are the imaging specialist for BioSphere 2. Describe the scene that \
             will be generated for the requested biome and feature.",
        )
        .specialized(&[IntentCategory::GenerateImage]),
        AgentDescriptor::new(
            "steward",
            "You are the environment steward for BioSphere 2. Explain the ecological \
             effect of the requested parameter change on the biome.",
        )
        .specialized(&[IntentCategory::AdjustParameter]),
    ]
}
