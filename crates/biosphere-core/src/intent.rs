//! Intent classification
//!
//! Turns a natural-language message into a validated [`Intent`]. The model's
//! reply is untrusted input: it must name a known category and carry every
//! parameter that category requires, otherwise the turn degrades to
//! `chat` with confidence 0 and never reaches an action.
//!
//! A keyword classifier stands in when the model is disabled or its backend
//! call fails. Its results go through the same validation.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::biomes::{BIOMES, Biome};
use crate::context::format_history;
use crate::error::ClassificationError;
use crate::llm::LanguageModel;
use crate::types::{EnvParameter, Intent, IntentCategory, Message};

/// Confidence assigned to keyword classifications
const HEURISTIC_CONFIDENCE: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct IntentRouterConfig {
    /// Ask the language model; when false only keywords are used
    pub use_llm: bool,
    /// Intents below this never act; they become a clarification turn
    pub min_confidence: f32,
    /// Number of recent messages injected into the classification prompt
    pub history_window: usize,
}

impl Default for IntentRouterConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            min_confidence: 0.5,
            history_window: 6,
        }
    }
}

pub struct IntentRouter {
    model: Option<Arc<dyn LanguageModel>>,
    config: IntentRouterConfig,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn LanguageModel>, config: IntentRouterConfig) -> Self {
        Self {
            model: Some(model),
            config,
        }
    }

    /// Router that never calls a model
    pub fn heuristic(config: IntentRouterConfig) -> Self {
        Self {
            model: None,
            config: IntentRouterConfig {
                use_llm: false,
                ..config
            },
        }
    }

    pub fn config(&self) -> &IntentRouterConfig {
        &self.config
    }

    /// Whether an intent is confident enough to be acted on
    pub fn meets_threshold(&self, intent: &Intent) -> bool {
        intent.confidence >= self.config.min_confidence
    }

    /// Classify `message` given the turns that preceded it.
    ///
    /// Never fails: every problem degrades to a chat intent.
    pub async fn classify(&self, message: &Message, recent_history: &[Message]) -> Intent {
        let start = recent_history.len().saturating_sub(self.config.history_window);
        let window = &recent_history[start..];

        let model = match (&self.model, self.config.use_llm) {
            (Some(model), true) => model,
            _ => return self.classify_heuristic(&message.text, window),
        };

        let prompt = build_classification_prompt(&message.text, window);
        match model.complete(CLASSIFIER_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => match parse_intent_json(&reply).and_then(validate) {
                Ok(intent) => {
                    debug!(
                        "IntentRouter: '{}' → {} (confidence {:.2}, secondary {:?})",
                        truncate(&message.text, 60),
                        intent.category,
                        intent.confidence,
                        intent.secondary
                    );
                    intent
                }
                Err(e) => {
                    warn!("IntentRouter: rejected model classification: {}", e);
                    Intent::unclassified(e.to_string())
                }
            },
            Err(e) => {
                let err = ClassificationError::Backend(e.to_string());
                warn!("IntentRouter: {}, using keyword classifier", err);
                self.classify_heuristic(&message.text, window)
            }
        }
    }

    fn classify_heuristic(&self, text: &str, window: &[Message]) -> Intent {
        match validate(heuristic_intent(text, window)) {
            Ok(intent) => {
                debug!(
                    "IntentRouter: heuristic '{}' → {}",
                    truncate(text, 60),
                    intent.category
                );
                intent
            }
            Err(e) => {
                debug!("IntentRouter: heuristic classification incomplete: {}", e);
                Intent::unclassified(e.to_string())
            }
        }
    }
}

const CLASSIFIER_SYSTEM_PROMPT: &str =
    "You are the intent classifier for the BioSphere 2 research assistant. Output only valid JSON.";

fn build_classification_prompt(message: &str, history: &[Message]) -> String {
    let locations = BIOMES
        .iter()
        .map(|b| format!("{} ({})", b.id, b.name))
        .collect::<Vec<_>>()
        .join(", ");
    let history = if history.is_empty() {
        "(none)".to_string()
    } else {
        format_history(history)
    };

    format!(
        r#"Classify the user's request. Respond with ONLY valid JSON, no explanation.

Recent conversation:
{history}

User message: {message}

JSON schema to follow:
{{
  "category": "<one of: data_query, visualize_2d, visualize_3d, generate_image, adjust_parameter, chat>",
  "parameters": {{"<key>": "<value>"}},
  "confidence": <number between 0 and 1>,
  "secondary": ["<other categories this request also needs>"]
}}

Required parameters:
- data_query: location_id, variable
- visualize_2d: location_id, variable (optional: chart = time_series | distribution | comparison, locations)
- visualize_3d: location_id
- generate_image: location_id (optional: feature)
- adjust_parameter: parameter (temperature | humidity | light | co2), and either amount (signed change) or target (absolute value for "set ... to N")
- chat: none

Known locations: {locations}
Variables: temperature, humidity, light, co2

JSON:"#
    )
}

/// Parse a model reply into an unvalidated intent.
///
/// The JSON object may be wrapped in prose; the text between the first `{`
/// and the last `}` is used.
pub fn parse_intent_json(text: &str) -> Result<Intent, ClassificationError> {
    let start = text.find('{').ok_or(ClassificationError::NoJson)?;
    let end = text.rfind('}').ok_or(ClassificationError::NoJson)?;
    if end < start {
        return Err(ClassificationError::NoJson);
    }

    let value: Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| ClassificationError::BadJson(e.to_string()))?;

    let raw_category = value
        .get("category")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClassificationError::BadJson("missing \"category\"".to_string()))?;
    let category = IntentCategory::parse(raw_category)
        .ok_or_else(|| ClassificationError::UnknownCategory(raw_category.to_string()))?;

    let parameters = match value.get("parameters") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            return Err(ClassificationError::BadJson(format!(
                "\"parameters\" must be an object, got {}",
                other
            )));
        }
    };

    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0) as f32;

    let mut secondary = Vec::new();
    if let Some(items) = value.get("secondary").and_then(|v| v.as_array()) {
        for item in items.iter().filter_map(|v| v.as_str()) {
            match IntentCategory::parse(item) {
                Some(c) if c != category && c != IntentCategory::Chat && !secondary.contains(&c) => {
                    secondary.push(c)
                }
                Some(_) => {}
                None => debug!("IntentRouter: ignoring unknown secondary category '{}'", item),
            }
        }
    }

    Ok(Intent {
        category,
        parameters,
        confidence,
        secondary,
    })
}

/// Check required parameters and normalize the ones with a canonical form
pub fn validate(mut intent: Intent) -> Result<Intent, ClassificationError> {
    if let Some(location) = intent.location_id().map(str::to_string) {
        let canonical = Biome::lookup(&location)
            .map(|b| b.id.to_string())
            .unwrap_or_else(|| location.to_lowercase());
        intent.parameters.insert("location_id".into(), Value::String(canonical));
    }
    if let Some(variable) = intent.param_str("variable").and_then(EnvParameter::parse) {
        intent
            .parameters
            .insert("variable".into(), Value::String(variable.to_string()));
    }

    for &required in intent.category.required_parameters() {
        let present = match intent.parameters.get(required) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if !present {
            return Err(ClassificationError::MissingParameter {
                category: intent.category.to_string(),
                parameter: required.to_string(),
            });
        }
    }

    if intent.category == IntentCategory::AdjustParameter {
        let raw = intent.param_str("parameter").unwrap_or_default().to_string();
        let parameter = EnvParameter::parse(&raw).ok_or_else(|| ClassificationError::InvalidParameter {
            parameter: "parameter".to_string(),
            reason: format!("'{}' is not an adjustable parameter", raw),
        })?;
        intent
            .parameters
            .insert("parameter".into(), Value::String(parameter.to_string()));

        if intent.parameters.get("target").is_some_and(|v| !v.is_null()) {
            let target = intent
                .param_f64("target")
                .filter(|t| t.is_finite())
                .ok_or_else(|| ClassificationError::InvalidParameter {
                    parameter: "target".to_string(),
                    reason: "expected a number".to_string(),
                })?;
            intent.parameters.remove("amount");
            intent.parameters.insert("target".into(), target.into());
        } else {
            let amount = intent
                .param_f64("amount")
                .filter(|a| a.is_finite() && *a != 0.0)
                .ok_or_else(|| ClassificationError::InvalidParameter {
                    parameter: "amount".to_string(),
                    reason: "expected a non-zero number".to_string(),
                })?;
            intent.parameters.insert("amount".into(), amount.into());
        }
    }

    Ok(intent)
}

struct Keywords {
    lower: String,
    words: Vec<String>,
}

impl Keywords {
    fn new(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { lower, words }
    }

    fn has_word(&self, candidates: &[&str]) -> bool {
        self.words.iter().any(|w| candidates.contains(&w.as_str()))
    }

    fn contains(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.lower.contains(n))
    }
}

const INCREASE_WORDS: &[&str] = &["increase", "raise", "warm", "boost", "add", "heat"];
const DECREASE_WORDS: &[&str] = &["decrease", "lower", "cool", "reduce", "drop", "cut"];
const SET_WORDS: &[&str] = &["set", "change", "adjust", "make"];
/// Change verbs that are mostly adjectives ("is it warm?") unless they lead
const ADJECTIVE_VERBS: &[&str] = &["warm", "cool", "heat", "drop", "change", "make"];
/// Openers that turn a request into a question about the current state
const QUESTION_WORDS: &[&str] = &[
    "is", "are", "was", "were", "does", "do", "did", "how", "what", "why", "when", "where", "which", "who",
    "will", "has", "have",
];
/// Politeness allowed before a leading verb: "please raise ...", "can you set ..."
const FILLER_WORDS: &[&str] = &[
    "please", "can", "could", "would", "you", "ok", "okay", "now", "then", "and", "let", "lets", "us",
];
const IMAGE_WORDS: &[&str] = &["image", "picture", "photo", "render", "illustration"];
const PLOT_WORDS: &[&str] = &["plot", "chart", "graph", "trend", "histogram", "distribution", "compare"];
const DATA_WORDS: &[&str] = &["what", "average", "current", "level", "how", "value", "reading", "data"];

/// How an adjust request moves a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
enum Change {
    By(f64),
    To(f64),
}

/// Keyword classification; unvalidated
fn heuristic_intent(text: &str, history: &[Message]) -> Intent {
    let kw = Keywords::new(text);

    let mentioned = Biome::mentioned_in(text);
    let remembered = mentioned.or_else(|| {
        history
            .iter()
            .rev()
            .find_map(|m| Biome::mentioned_in(&m.text))
    });
    let variable = detect_variable(&kw);
    let question = kw.words.first().is_some_and(|w| QUESTION_WORDS.contains(&w.as_str()));

    let mut intent = if kw.has_word(&["3d", "3-d", "three-dimensional", "model"]) {
        Intent::new(IntentCategory::Visualize3d, HEURISTIC_CONFIDENCE)
    } else if kw.has_word(IMAGE_WORDS) || kw.contains(&["images", "pictures", "photos"]) {
        let mut intent = Intent::new(IntentCategory::GenerateImage, HEURISTIC_CONFIDENCE);
        if let Some(feature) = image_feature(&kw.lower) {
            intent = intent.with_param("feature", feature);
        }
        intent
    } else if kw.has_word(PLOT_WORDS) || kw.contains(&["plots", "charts", "graphs", "trends"]) {
        let chart = if kw.has_word(&["distribution", "histogram"]) {
            "distribution"
        } else if kw.has_word(&["compare", "comparison"]) {
            "comparison"
        } else {
            "time_series"
        };
        let mut intent = Intent::new(IntentCategory::Visualize2d, HEURISTIC_CONFIDENCE).with_param("chart", chart);
        if chart == "comparison" {
            let mentioned: Vec<Value> = BIOMES
                .iter()
                .filter(|b| kw.lower.contains(&b.name.to_lowercase()))
                .map(|b| Value::String(b.id.to_string()))
                .collect();
            if mentioned.len() > 1 {
                intent = intent.with_param("locations", mentioned);
            }
        }
        intent
    } else if variable.is_some() && question {
        Intent::new(IntentCategory::DataQuery, HEURISTIC_CONFIDENCE)
    } else if let Some(change) = variable.and_then(|_| requested_change(&kw, text)) {
        let intent = Intent::new(IntentCategory::AdjustParameter, HEURISTIC_CONFIDENCE);
        match change {
            Change::By(amount) => intent.with_param("amount", amount),
            Change::To(target) => intent.with_param("target", target),
        }
    } else if variable.is_some() && kw.has_word(DATA_WORDS) {
        Intent::new(IntentCategory::DataQuery, HEURISTIC_CONFIDENCE)
    } else {
        Intent::new(IntentCategory::Chat, HEURISTIC_CONFIDENCE)
    };

    // A change only ever targets a place the user named in this message
    let location = if intent.category == IntentCategory::AdjustParameter {
        mentioned
    } else {
        remembered
    };
    if let Some(biome) = location {
        intent = intent.with_param("location_id", biome.id);
    }
    if let Some(variable) = variable {
        let key = if intent.category == IntentCategory::AdjustParameter {
            "parameter"
        } else {
            "variable"
        };
        intent = intent.with_param(key, variable.to_string());
    }
    intent
}

/// An environment change is requested when a change verb leads the message
/// ("lower the humidity", "please set ..."), or when a verb that is not
/// usually an adjective comes with an explicit amount ("co2 should increase
/// by 50"). Questions never get here.
fn requested_change(kw: &Keywords, text: &str) -> Option<Change> {
    let leading = kw
        .words
        .iter()
        .map(String::as_str)
        .find(|w| !FILLER_WORDS.contains(w))?;
    let is_verb = |w: &str| INCREASE_WORDS.contains(&w) || DECREASE_WORDS.contains(&w) || SET_WORDS.contains(&w);

    let verb = if is_verb(leading) {
        leading
    } else {
        let verb = kw
            .words
            .iter()
            .map(String::as_str)
            .find(|w| is_verb(*w) && !ADJECTIVE_VERBS.contains(w))?;
        first_number(text)?;
        verb
    };

    if let Some(target) = number_after(text, "to") {
        return Some(Change::To(target));
    }
    let by = number_after(text, "by");
    if SET_WORDS.contains(&verb) {
        // "set humidity 80" names a value; "change it by -5" a difference
        return by.map(Change::By).or_else(|| first_number(text).map(Change::To));
    }

    let decrease = DECREASE_WORDS.contains(&verb);
    Some(match by.or_else(|| first_number(text)) {
        Some(n) if decrease => Change::By(-n.abs()),
        Some(n) => Change::By(n.abs()),
        None if decrease => Change::By(-1.0),
        None => Change::By(1.0),
    })
}

fn detect_variable(kw: &Keywords) -> Option<EnvParameter> {
    if kw.contains(&["temp", "warm", "cool", "heat", "degrees"]) {
        Some(EnvParameter::Temperature)
    } else if kw.contains(&["humid", "moisture"]) {
        Some(EnvParameter::Humidity)
    } else if kw.contains(&["co2", "co₂", "carbon dioxide"]) {
        Some(EnvParameter::Co2)
    } else if kw.contains(&["light", "sunlight", "brightness"]) {
        Some(EnvParameter::Light)
    } else {
        None
    }
}

/// First number in the text that starts a word, e.g. "+2" in "raise by +2°C".
/// Digits glued to letters ("co2") are not numbers.
fn first_number(text: &str) -> Option<f64> {
    text.split_whitespace().find_map(|token| {
        let token = token.trim_start_matches(['(', '"', '\'']);
        let first = token.chars().next()?;
        if !(first.is_ascii_digit() || first == '+' || first == '-' || first == '.') {
            return None;
        }
        let numeric: String = token
            .chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-')))
            .map(|(_, c)| c)
            .collect();
        numeric.trim_end_matches('.').parse::<f64>().ok()
    })
}

/// Number directly following `marker`, e.g. 25 in "set it to 25 °C"
fn number_after(text: &str, marker: &str) -> Option<f64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(marker))
        .and_then(|pair| first_number(pair[1]))
}

/// Subject of an image request: the words after "of" / "showing"
fn image_feature(lower: &str) -> Option<String> {
    let idx = ["showing ", "of the ", "of "]
        .iter()
        .find_map(|marker| lower.find(marker).map(|i| i + marker.len()))?;
    let feature: String = lower[idx..]
        .trim_end_matches(['.', '!', '?'])
        .split_whitespace()
        .filter(|w| !BIOMES.iter().any(|b| b.id == *w || b.name.to_lowercase() == *w))
        .filter(|w| !["in", "the", "biome", "a", "an"].contains(w))
        .take(6)
        .collect::<Vec<_>>()
        .join(" ");
    (!feature.is_empty()).then_some(feature)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}…", cut)
    }
}
