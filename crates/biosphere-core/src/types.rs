//! Shared types for biosphere-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::biomes::Biome;

/// Who produced a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    /// Router/session notices: clarifications, action results, state changes
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single turn in a session's history. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    /// User id or agent name
    pub author: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        author: impl Into<String>,
        role: Role,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            author: author.into(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            in_reply_to: None,
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.in_reply_to = Some(message_id.into());
        self
    }
}

/// What a request is asking for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    DataQuery,
    #[serde(rename = "visualize_2d")]
    Visualize2d,
    #[serde(rename = "visualize_3d")]
    Visualize3d,
    GenerateImage,
    AdjustParameter,
    Chat,
}

impl IntentCategory {
    pub const ALL: [IntentCategory; 6] = [
        Self::DataQuery,
        Self::Visualize2d,
        Self::Visualize3d,
        Self::GenerateImage,
        Self::AdjustParameter,
        Self::Chat,
    ];

    /// Parse a category name as produced by the model (e.g. "visualize_3d")
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "data_query" => Some(Self::DataQuery),
            "visualize_2d" => Some(Self::Visualize2d),
            "visualize_3d" => Some(Self::Visualize3d),
            "generate_image" => Some(Self::GenerateImage),
            "adjust_parameter" => Some(Self::AdjustParameter),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }

    /// Parameters that must be present before an intent of this category may act
    pub fn required_parameters(&self) -> &'static [&'static str] {
        match self {
            Self::DataQuery => &["location_id", "variable"],
            Self::Visualize2d => &["location_id", "variable"],
            Self::Visualize3d => &["location_id"],
            Self::GenerateImage => &["location_id"],
            // plus one of `amount` (signed change) or `target` (absolute value)
            Self::AdjustParameter => &["parameter"],
            Self::Chat => &[],
        }
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DataQuery => "data_query",
            Self::Visualize2d => "visualize_2d",
            Self::Visualize3d => "visualize_3d",
            Self::GenerateImage => "generate_image",
            Self::AdjustParameter => "adjust_parameter",
            Self::Chat => "chat",
        };
        write!(f, "{}", s)
    }
}

/// Structured, validated interpretation of a request. Lives for one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub category: IntentCategory,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub confidence: f32,
    /// Additional categories that need another agent's input
    #[serde(default)]
    pub secondary: Vec<IntentCategory>,
}

impl Intent {
    pub fn new(category: IntentCategory, confidence: f32) -> Self {
        Self {
            category,
            parameters: Map::new(),
            confidence,
            secondary: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Degraded intent for unparseable or incomplete classifications
    pub fn unclassified(reason: impl Into<String>) -> Self {
        Self::new(IntentCategory::Chat, 0.0).with_param("reason", reason.into())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        match self.parameters.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_start_matches('+').parse().ok(),
            _ => None,
        }
    }

    pub fn location_id(&self) -> Option<&str> {
        self.param_str("location_id")
    }
}

/// One of the four tunable ecological parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvParameter {
    Temperature,
    Humidity,
    Light,
    Co2,
}

impl EnvParameter {
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "temperature" | "temp" => Some(Self::Temperature),
            "humidity" | "relative humidity" => Some(Self::Humidity),
            "light" | "light level" | "sunlight" => Some(Self::Light),
            "co2" | "co₂" | "carbon dioxide" => Some(Self::Co2),
            _ => None,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity | Self::Light => "%",
            Self::Co2 => "ppm",
        }
    }

    /// Physical bounds a value is clamped to
    fn bounds(&self) -> (f64, f64) {
        match self {
            Self::Temperature => (-20.0, 60.0),
            Self::Humidity | Self::Light => (0.0, 100.0),
            Self::Co2 => (0.0, 5000.0),
        }
    }
}

impl std::fmt::Display for EnvParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Humidity => write!(f, "humidity"),
            Self::Light => write!(f, "light"),
            Self::Co2 => write!(f, "co2"),
        }
    }
}

/// Per-session ecological parameters, versioned for optimistic concurrency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentState {
    pub location_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub light: f64,
    pub co2: f64,
    #[serde(default)]
    pub last_modified_by: Option<String>,
    pub version: u64,
}

impl EnvironmentState {
    /// Initial state for a location, seeded from its biome baseline
    pub fn initial(location_id: &str) -> Self {
        let biome = Biome::lookup(location_id).unwrap_or_else(Biome::fallback);
        Self {
            location_id: location_id.to_string(),
            temperature: biome.base_temp,
            humidity: biome.base_humidity,
            light: 100.0,
            co2: 400.0,
            last_modified_by: None,
            version: 0,
        }
    }

    pub fn get(&self, param: EnvParameter) -> f64 {
        match param {
            EnvParameter::Temperature => self.temperature,
            EnvParameter::Humidity => self.humidity,
            EnvParameter::Light => self.light,
            EnvParameter::Co2 => self.co2,
        }
    }

    fn slot(&mut self, param: EnvParameter) -> &mut f64 {
        match param {
            EnvParameter::Temperature => &mut self.temperature,
            EnvParameter::Humidity => &mut self.humidity,
            EnvParameter::Light => &mut self.light,
            EnvParameter::Co2 => &mut self.co2,
        }
    }

    /// Apply a delta, clamping each parameter; does not touch `version`
    pub fn apply(&mut self, delta: &EnvironmentDelta) {
        for (param, amount) in delta.entries() {
            let (lo, hi) = param.bounds();
            let slot = self.slot(param);
            *slot = (*slot + amount).clamp(lo, hi);
        }
    }
}

/// Additive change to an EnvironmentState
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
}

impl EnvironmentDelta {
    pub fn single(param: EnvParameter, amount: f64) -> Self {
        let mut delta = Self::default();
        match param {
            EnvParameter::Temperature => delta.temperature = Some(amount),
            EnvParameter::Humidity => delta.humidity = Some(amount),
            EnvParameter::Light => delta.light = Some(amount),
            EnvParameter::Co2 => delta.co2 = Some(amount),
        }
        delta
    }

    /// The change that moves `param` from its value in `state` to `target`,
    /// clamped to the parameter's bounds. Empty when it is already there.
    pub fn towards(param: EnvParameter, target: f64, state: &EnvironmentState) -> Self {
        let (lo, hi) = param.bounds();
        let change = target.clamp(lo, hi) - state.get(param);
        if change == 0.0 {
            Self::default()
        } else {
            Self::single(param, change)
        }
    }

    pub fn entries(&self) -> Vec<(EnvParameter, f64)> {
        [
            (EnvParameter::Temperature, self.temperature),
            (EnvParameter::Humidity, self.humidity),
            (EnvParameter::Light, self.light),
            (EnvParameter::Co2, self.co2),
        ]
        .into_iter()
        .filter_map(|(p, v)| v.map(|v| (p, v)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Human-readable summary, e.g. "temperature +2.0 °C"
    pub fn describe(&self) -> String {
        self.entries()
            .iter()
            .map(|(p, v)| format!("{} {:+.1} {}", p, v, p.unit()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Kind of downstream collaborator call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DataQuery,
    #[serde(rename = "plot_2d")]
    Plot2d,
    SceneUpdate,
    ImageGeneration,
}

impl ActionKind {
    /// Read-only calls may be retried transparently; the rest never are
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::DataQuery | Self::Plot2d)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataQuery => write!(f, "data_query"),
            Self::Plot2d => write!(f, "plot_2d"),
            Self::SceneUpdate => write!(f, "scene_update"),
            Self::ImageGeneration => write!(f, "image_generation"),
        }
    }
}

/// A concrete call against one collaborator, derived from a validated intent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub session_id: String,
    pub location_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Environment change this action carries; present only for adjust turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<EnvironmentDelta>,
    /// Environment the action should be rendered against
    pub environment: EnvironmentState,
}

impl ActionRequest {
    /// Whether executing this request must be followed by a state proposal
    pub fn mutates_environment(&self) -> bool {
        self.delta.is_some()
    }

    /// The delta to commit on top of `state`. An absolute `target` parameter
    /// is resolved against `state`; a plain amount is returned as derived.
    pub fn delta_against(&self, state: &EnvironmentState) -> Option<EnvironmentDelta> {
        let delta = self.delta.as_ref()?;
        let parameter = self
            .parameters
            .get("parameter")
            .and_then(Value::as_str)
            .and_then(EnvParameter::parse);
        let target = self.parameters.get("target").and_then(Value::as_f64);
        match (parameter, target) {
            (Some(parameter), Some(target)) => Some(EnvironmentDelta::towards(parameter, target, state)),
            _ => Some(delta.clone()),
        }
    }

    /// JSON body sent to the collaborator
    pub fn payload(&self) -> Value {
        let biome = Biome::lookup(&self.location_id);
        let location_name = biome
            .as_ref()
            .map(|b| b.name.to_string())
            .unwrap_or_else(|| self.location_id.clone());

        match self.kind {
            ActionKind::DataQuery => serde_json::json!({
                "location": location_name,
                "variable": self.parameters.get("variable"),
                "range": self.parameters.get("range"),
            }),
            ActionKind::Plot2d => {
                let chart = self
                    .parameters
                    .get("chart")
                    .and_then(|v| v.as_str())
                    .unwrap_or("time_series");
                let variable = self
                    .parameters
                    .get("variable")
                    .and_then(|v| v.as_str())
                    .unwrap_or("temperature");
                let title = match chart {
                    "distribution" => format!("Distribution of {} in {}", variable, location_name),
                    "comparison" => format!("Comparison of {} across different biomes", variable),
                    _ => format!("{} over time in {}", variable, location_name),
                };
                serde_json::json!({
                    "type": chart,
                    "location": location_name,
                    "locations": self.parameters.get("locations"),
                    "variable": variable,
                    "title": title,
                })
            }
            ActionKind::SceneUpdate => serde_json::json!({
                "location_id": self.location_id,
                "deltas": self.delta,
                "environment": self.environment,
            }),
            ActionKind::ImageGeneration => {
                let mut prompt = format!(
                    "A photorealistic visualization of the {} biome in BioSphere 2",
                    location_name
                );
                if let Some(feature) = self.parameters.get("feature").and_then(|v| v.as_str()) {
                    prompt.push_str(&format!(", focusing on {}", feature));
                }
                prompt.push_str(", highly detailed scientific visualization");
                serde_json::json!({ "prompt": prompt, "location": location_name })
            }
        }
    }
}

/// Normalized outcome of a collaborator call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub action_kind: ActionKind,
    /// Collaborator artifact: image URL, plot spec, scene delta, data series
    pub payload: Value,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(kind: ActionKind, payload: Value) -> Self {
        Self {
            action_kind: kind,
            payload,
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(kind: ActionKind, error: impl Into<String>) -> Self {
        Self {
            action_kind: kind,
            payload: Value::Null,
            succeeded: false,
            error: Some(error.into()),
        }
    }
}
