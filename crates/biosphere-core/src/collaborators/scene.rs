//! In-process 3D scene service
//!
//! Produces the scene-update descriptor a renderer consumes: the environment
//! plus visual effects derived from how far it sits from the biome baseline.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::Collaborator;
use crate::biomes::Biome;
use crate::error::CollaboratorError;
use crate::types::{ActionKind, ActionRequest, EnvironmentState};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SceneEffects {
    pub color_intensity: f64,
    pub opacity: f64,
    pub atmosphere_color: [f64; 3],
    pub light_intensity: f64,
    pub biome_tint: [f64; 3],
}

/// Compute render effects for an environment against its biome baseline
pub fn compute_effects(state: &EnvironmentState) -> SceneEffects {
    let biome = Biome::lookup(&state.location_id).unwrap_or_else(Biome::fallback);

    let temp_factor = (state.temperature - biome.base_temp) / 20.0;
    let humidity_factor = (state.humidity - biome.base_humidity) / 50.0;
    let co2_factor = (state.co2 - 400.0) / 600.0;
    let light_factor = state.light / 100.0;

    let base = biome.color_tint;
    // Warmer shifts towards red, extremes wash out green
    let temp_color = [
        (base[0] * (1.0 + temp_factor * 0.5)).min(1.0),
        base[1] * (1.0 - temp_factor.abs() * 0.3),
        base[2] * (1.0 - temp_factor * 0.3),
    ];
    let atmosphere_color = [
        temp_color[0] * (0.8 + co2_factor * 0.4),
        temp_color[1] * (0.8 + co2_factor * 0.2),
        temp_color[2] * (0.8 - co2_factor * 0.2),
    ];

    SceneEffects {
        color_intensity: biome.light_intensity * (1.0 + temp_factor * 0.3),
        opacity: (biome.fog_density + humidity_factor * 0.5).clamp(0.1, 1.0),
        atmosphere_color,
        light_intensity: biome.light_intensity * light_factor * (1.0 - co2_factor * 0.2),
        biome_tint: biome.color_tint,
    }
}

/// Scene collaborator used when no external 3D service is configured
#[derive(Debug, Default, Clone)]
pub struct LocalSceneService;

#[async_trait]
impl Collaborator for LocalSceneService {
    fn name(&self) -> &str {
        "local-scene"
    }

    async fn call(&self, request: &ActionRequest) -> Result<Value, CollaboratorError> {
        if request.kind != ActionKind::SceneUpdate {
            return Err(CollaboratorError::BadPayload(format!(
                "scene service cannot handle {}",
                request.kind
            )));
        }

        // Render against the environment as it will be once the delta lands
        let mut projected = request.environment.clone();
        if let Some(delta) = &request.delta {
            projected.apply(delta);
        }

        let biome = Biome::lookup(&request.location_id);
        Ok(serde_json::json!({
            "type": "scene_update",
            "location_id": request.location_id,
            "model": biome.map(|b| format!("models/{}.gltf", b.id)),
            "deltas": request.delta,
            "environment": projected,
            "effects": compute_effects(&projected),
        }))
    }
}
