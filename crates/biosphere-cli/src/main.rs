use anyhow::{Context, Result, bail};
use biosphere_core::{
    ActionDispatcher, ActionKind, AgentPool, AnthropicModel, CapabilityRegistry, CollaborationHub, Collaborator,
    FailoverModel, HttpCollaborator, InMemoryContextStore, IntentRouter, LanguageModel, LocalSceneService,
    OllamaModel, SessionServices,
};
use biosphere_gateway::GatewayServer;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{BiosphereConfig, CollaboratorsConfig, ModelConfig, Provider};

#[derive(Parser)]
#[command(name = "biosphere")]
#[command(version)]
#[command(about = "BioSphere 2 — multi-agent chat over ecological data")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Start,

    /// Send a one-shot message through a local session
    Ask {
        /// The message to send
        message: String,

        /// Session to use
        #[arg(long, default_value = "cli")]
        session: String,

        /// Author recorded on the message
        #[arg(long, default_value = "cli-user")]
        author: String,

        /// Print committed messages as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Ask {
            message,
            session,
            author,
            json,
        } => cmd_ask(&cli.config, &message, &session, &author, json).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("BioSphere initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure the model and collaborator endpoints.",
        config_path.display()
    );
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let mut cfg = BiosphereConfig::load(config_path)?;
    cfg.model.api_key = config::mask_secret(&cfg.model.api_key);
    if let Some(fallback) = cfg.model.fallback.as_mut() {
        fallback.api_key = config::mask_secret(&fallback.api_key);
    }
    cfg.gateway.auth_token = config::mask_secret(&cfg.gateway.auth_token);
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = BiosphereConfig::load(config_path)?;
    info!("Starting BioSphere gateway...");

    let hub = Arc::new(build_hub(&cfg)?);
    let cancel = CancellationToken::new();
    let reaper = hub.spawn_idle_reaper(cancel.clone());

    if cfg.gateway.auth_token.is_empty() {
        warn!("Gateway auth disabled: set gateway.auth_token to require a bearer token");
    }
    let server = GatewayServer::new(cfg.gateway.bind_addr()?, hub.clone(), cfg.gateway.auth_token.clone());
    let shutdown = cancel.clone();
    let mut gateway = server.spawn(async move { shutdown.cancelled().await });

    let stopped_early = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            None
        }
        result = &mut gateway => Some(result),
    };

    cancel.cancel();
    let outcome = match stopped_early {
        Some(outcome) => outcome,
        None => gateway.await,
    };
    let _ = reaper.await;
    hub.shutdown().await;

    outcome.context("Gateway task panicked")??;
    println!("BioSphere stopped.");
    Ok(())
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    message: &str,
    session: &str,
    author: &str,
    json: bool,
) -> Result<()> {
    let cfg = BiosphereConfig::load(config_path)?;
    let hub = build_hub(&cfg)?;

    let result = hub.handle_message(session, author, message).await;
    hub.shutdown().await;
    let messages = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    // The first committed message is the question itself
    for msg in messages.iter().skip(1) {
        println!("[{}] {}", msg.author, msg.text);
    }
    Ok(())
}

fn build_hub(cfg: &BiosphereConfig) -> Result<CollaborationHub> {
    let model = build_model(&cfg.model)?;
    info!(
        "Language model ready: {} ({})",
        model.provider_name(),
        model.model()
    );

    let router = IntentRouter::new(model.clone(), cfg.router.to_router_config());
    let pool = AgentPool::new(model, cfg.agents.descriptors(), cfg.agents.to_pool_config())
        .context("Invalid agent configuration")?;
    let registry = build_registry(&cfg.collaborators)?;
    let dispatcher = ActionDispatcher::new(Arc::new(registry), cfg.dispatcher.to_dispatcher_config());

    let services = SessionServices {
        store: Arc::new(InMemoryContextStore::new()),
        router: Arc::new(router),
        pool: Arc::new(pool),
        dispatcher: Arc::new(dispatcher),
    };
    Ok(CollaborationHub::new(services, cfg.session.to_session_config()))
}

fn build_model(cfg: &ModelConfig) -> Result<Arc<dyn LanguageModel>> {
    let primary = build_backend(
        cfg.provider,
        cfg.model.clone(),
        cfg.base_url.clone(),
        &cfg.api_key,
        cfg.max_tokens,
    )?;
    let Some(fallback) = &cfg.fallback else {
        return Ok(primary);
    };

    let secondary = build_backend(
        fallback.provider,
        fallback.model.clone(),
        fallback.base_url.clone(),
        &fallback.api_key,
        cfg.max_tokens,
    )
    .context("Failed to configure fallback model")?;
    info!("Model failover: {} → {}", cfg.provider, fallback.provider);
    Ok(Arc::new(FailoverModel::new(vec![primary, secondary])?))
}

fn build_backend(
    provider: Provider,
    model: Option<String>,
    base_url: Option<String>,
    api_key: &str,
    max_tokens: u32,
) -> Result<Arc<dyn LanguageModel>> {
    match provider {
        Provider::Anthropic => {
            let api_key = if api_key.is_empty() {
                std::env::var("ANTHROPIC_API_KEY").unwrap_or_default()
            } else {
                api_key.to_string()
            };
            if api_key.is_empty() {
                bail!("Anthropic provider selected but no API key configured. Set ANTHROPIC_API_KEY.");
            }
            let mut backend = AnthropicModel::new(api_key, model)?.with_max_tokens(max_tokens);
            if let Some(base_url) = base_url {
                backend = backend.with_base_url(base_url);
            }
            Ok(Arc::new(backend))
        }
        Provider::Ollama => Ok(Arc::new(OllamaModel::new(base_url, model)?)),
    }
}

fn build_registry(cfg: &CollaboratorsConfig) -> Result<CapabilityRegistry> {
    let mut builder = CapabilityRegistry::builder();

    let remote = [
        (ActionKind::DataQuery, "data", cfg.data.as_deref()),
        (ActionKind::Plot2d, "plot", cfg.plot.as_deref()),
        (ActionKind::ImageGeneration, "image", cfg.image.as_deref()),
        (ActionKind::SceneUpdate, "scene", cfg.scene.as_deref()),
    ];
    for (kind, name, endpoint) in remote {
        let Some(endpoint) = endpoint else {
            continue;
        };
        let collaborator = HttpCollaborator::parse(name, endpoint)
            .with_context(|| format!("Invalid {} collaborator endpoint", name))?;
        builder = builder.register(kind, Arc::new(collaborator));
    }

    if cfg.scene.is_none() {
        let scene: Arc<dyn Collaborator> = Arc::new(LocalSceneService);
        builder = builder.register(ActionKind::SceneUpdate, scene);
    }
    Ok(builder.build())
}
