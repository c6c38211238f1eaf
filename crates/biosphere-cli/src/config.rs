use anyhow::{Context, Result, bail};
use biosphere_core::{AgentDescriptor, AgentPoolConfig, DispatcherConfig, IntentRouterConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BiosphereConfig {
    pub model: ModelConfig,
    pub router: RouterConfig,
    pub agents: AgentsConfig,
    pub dispatcher: DispatcherSection,
    pub collaborators: CollaboratorsConfig,
    pub session: SessionSection,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Ollama,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    /// Provider default when unset
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: String,
    pub max_tokens: u32,
    /// Tried after `provider` fails
    pub fallback: Option<FallbackModelConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            model: None,
            base_url: None,
            api_key: String::new(),
            max_tokens: 1024,
            fallback: None,
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("max_tokens", &self.max_tokens)
            .field("fallback", &self.fallback)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FallbackModelConfig {
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for FallbackModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackModelConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub use_llm: bool,
    pub min_confidence: f32,
    pub history_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let defaults = IntentRouterConfig::default();
        Self {
            use_llm: defaults.use_llm,
            min_confidence: defaults.min_confidence,
            history_window: defaults.history_window,
        }
    }
}

impl RouterConfig {
    pub fn to_router_config(&self) -> IntentRouterConfig {
        IntentRouterConfig {
            use_llm: self.use_llm,
            min_confidence: self.min_confidence.clamp(0.0, 1.0),
            history_window: self.history_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub max_chain_depth: usize,
    pub default_agent: String,
    /// Empty means the built-in descriptor set
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<AgentDescriptor>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        let defaults = AgentPoolConfig::default();
        Self {
            max_chain_depth: defaults.max_chain_depth,
            default_agent: defaults.default_agent,
            profiles: Vec::new(),
        }
    }
}

impl AgentsConfig {
    pub fn to_pool_config(&self) -> AgentPoolConfig {
        AgentPoolConfig {
            max_chain_depth: self.max_chain_depth,
            default_agent: self.default_agent.clone(),
        }
    }

    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        if self.profiles.is_empty() {
            biosphere_core::default_descriptors()
        } else {
            self.profiles.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub read_attempts: u32,
    pub timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            read_attempts: 3,
            timeout_secs: 30,
            retry_delay_ms: 250,
        }
    }
}

impl DispatcherSection {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            read_attempts: self.read_attempts.max(1),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Downstream service endpoints. Unset services are not registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    pub data: Option<String>,
    pub plot: Option<String>,
    pub image: Option<String>,
    /// Built-in local scene service when unset
    pub scene: Option<String>,
}

impl CollaboratorsConfig {
    pub fn endpoints(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("data", self.data.as_deref()),
            ("plot", self.plot.as_deref()),
            ("image", self.image.as_deref()),
            ("scene", self.scene.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub idle_timeout_secs: u64,
    pub conflict_retries: u32,
    pub broadcast_capacity: usize,
    pub archive_dir: Option<String>,
    pub default_location: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            conflict_retries: defaults.conflict_retries,
            broadcast_capacity: defaults.broadcast_capacity,
            archive_dir: None,
            default_location: defaults.default_location,
        }
    }
}

impl SessionSection {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            conflict_retries: self.conflict_retries,
            broadcast_capacity: self.broadcast_capacity.max(1),
            archive_dir: self.archive_dir.as_deref().map(expand_home),
            default_location: self.default_location.clone(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    /// Empty disables auth
    pub auth_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            auth_token: String::new(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("auth_token", &mask_secret(&self.auth_token))
            .finish()
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid gateway bind address '{}'", self.bind))
    }
}

pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".biosphere")
}

impl BiosphereConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse group/world-readable files; they may hold API keys
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    bail!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `biosphere init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        Ok(config)
    }

    /// Parse config text, expanding allowlisted `${VAR}` references first
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;

        if config.model.api_key.starts_with("sk-ant-") {
            warn!(
                "API key is hardcoded in config file. For security, use environment variables: api_key = \"${{ANTHROPIC_API_KEY}}\""
            );
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.router.min_confidence) {
            bail!(
                "router.min_confidence must be between 0 and 1, got {}",
                self.router.min_confidence
            );
        }
        if self.agents.max_chain_depth == 0 {
            bail!("agents.max_chain_depth must be at least 1");
        }
        if self.dispatcher.read_attempts > MAX_READ_ATTEMPTS {
            bail!(
                "dispatcher.read_attempts must be at most {}, got {}",
                MAX_READ_ATTEMPTS,
                self.dispatcher.read_attempts
            );
        }
        for (name, endpoint) in self.collaborators.endpoints() {
            let Some(endpoint) = endpoint else { continue };
            let url = url::Url::parse(endpoint)
                .with_context(|| format!("collaborators.{} is not a valid URL: '{}'", name, endpoint))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("collaborators.{} must be an http(s) URL, got '{}'", name, endpoint);
            }
        }
        self.gateway.bind_addr()?;
        Ok(())
    }
}

const MAX_READ_ATTEMPTS: u32 = 10;

/// Allowlist of environment variable names that may be expanded in config files.
/// Keeps a tampered config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &["ANTHROPIC_API_KEY", "BIOSPHERE_GATEWAY_TOKEN", "HOME", "USER"];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..abs_start], value, &result[abs_start + end + 1..]);
        // Skip past the expanded value so it is never re-expanded
        pos = abs_start + value.len();
    }
    result
}

fn expand_home(s: &str) -> PathBuf {
    match s.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(s)),
        None => PathBuf::from(s),
    }
}

/// Written by `biosphere init`
pub const DEFAULT_CONFIG: &str = r#"# BioSphere 2 orchestration config

[model]
provider = "anthropic"            # anthropic | ollama
# model = "claude-sonnet-4-5"
api_key = "${ANTHROPIC_API_KEY}"
max_tokens = 1024

# [model.fallback]
# provider = "ollama"
# model = "llama3.2:3b"

[router]
use_llm = true
min_confidence = 0.5
history_window = 6

[agents]
max_chain_depth = 3
default_agent = "general"

# [[agents.profiles]]
# name = "general"
# role_prompt = "You are a helpful assistant for the BioSphere 2 research facility."
# specializations = ["chat"]

[dispatcher]
read_attempts = 3
timeout_secs = 30
retry_delay_ms = 250

[collaborators]
# data = "http://localhost:8001/query"
# plot = "http://localhost:8002/plot"
# image = "http://localhost:8003/generate"
# scene = "http://localhost:8004/scene"

[session]
idle_timeout_secs = 1800
conflict_retries = 3
broadcast_capacity = 256
default_location = "rainforest"
# archive_dir = "~/.biosphere/archive"

[gateway]
bind = "127.0.0.1:8000"
auth_token = "${BIOSPHERE_GATEWAY_TOKEN}"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use biosphere_core::IntentCategory;

    #[test]
    fn test_default_config_parses() {
        let config = BiosphereConfig::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.model.provider, Provider::Anthropic);
        assert!(config.router.use_llm);
        assert_eq!(config.router.history_window, 6);
        assert_eq!(config.agents.max_chain_depth, 3);
        assert_eq!(config.dispatcher.read_attempts, 3);
        assert_eq!(config.session.idle_timeout_secs, 1800);
        assert!(config.collaborators.scene.is_none());
        assert_eq!(config.gateway.bind_addr().unwrap().port(), 8000);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BiosphereConfig::parse("").unwrap();
        assert_eq!(config.router.min_confidence, 0.5);
        assert_eq!(config.agents.default_agent, "general");
        assert_eq!(config.agents.descriptors().len(), biosphere_core::default_descriptors().len());
        assert_eq!(config.session.to_session_config().conflict_retries, 3);
    }

    #[test]
    fn test_custom_profiles_replace_builtins() {
        let toml = r#"
[agents]
default_agent = "ecologist"

[[agents.profiles]]
name = "ecologist"
role_prompt = "You study soils."
specializations = ["data_query", "visualize_2d"]
"#;
        let config = BiosphereConfig::parse(toml).unwrap();
        let descriptors = config.agents.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert!(descriptors[0].accepts(IntentCategory::Visualize2d));
        assert_eq!(config.agents.to_pool_config().default_agent, "ecologist");
    }

    #[test]
    fn test_ollama_with_fallback() {
        let toml = r#"
[model]
provider = "ollama"
model = "llama3.2:3b"

[model.fallback]
provider = "anthropic"
api_key = "sk-test-123456789"
"#;
        let config = BiosphereConfig::parse(toml).unwrap();
        assert_eq!(config.model.provider, Provider::Ollama);
        let fallback = config.model.fallback.as_ref().unwrap();
        assert_eq!(fallback.provider, Provider::Anthropic);
        let debug = format!("{:?}", config.model);
        assert!(!debug.contains("sk-test-123456789"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(BiosphereConfig::parse("[router]\nmin_confidence = 1.5\n").is_err());
        assert!(BiosphereConfig::parse("[agents]\nmax_chain_depth = 0\n").is_err());
        assert!(BiosphereConfig::parse("[gateway]\nbind = \"not an address\"\n").is_err());
        assert!(BiosphereConfig::parse("[model]\nprovider = \"gpt\"\n").is_err());
        assert!(BiosphereConfig::parse("[collaborators]\nplot = \"ftp://plots\"\n").is_err());
        assert!(BiosphereConfig::parse("[collaborators]\ndata = \"nowhere\"\n").is_err());
        assert!(BiosphereConfig::parse("[dispatcher]\nread_attempts = 40\n").is_err());
        assert!(BiosphereConfig::parse("[dispatcher]\nread_attempts = 10\n").is_ok());
    }

    #[test]
    fn test_dispatcher_conversion() {
        let section = DispatcherSection {
            read_attempts: 0,
            timeout_secs: 10,
            retry_delay_ms: 50,
        };
        let config = section.to_dispatcher_config();
        assert_eq!(config.read_attempts, 1);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_expand_env_vars_allowlist() {
        // HOME is allowlisted and set in any test environment
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("dir = \"${HOME}/x\""), format!("dir = \"{}/x\"", home));
        assert_eq!(expand_env_vars("key = \"${PATH}\""), "key = \"${PATH}\"");
        assert_eq!(expand_env_vars("unterminated ${HOME"), "unterminated ${HOME");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-ant-abcdefgh1234"), "sk-...1234");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BiosphereConfig::load(&Some(dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("biosphere init"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, DEFAULT_CONFIG).unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(BiosphereConfig::load(&Some(path.clone())).is_err());

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(BiosphereConfig::load(&Some(path)).is_ok());
    }
}
