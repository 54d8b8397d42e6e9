//! ollamabot - Entry Point
//!
//! Modes:
//! - Default: serve the Discord interactions endpoint
//! - --register / -r: register slash commands and exit

use anyhow::Context;
use ollamabot::channels::{self, AppState, DiscordClient};
use ollamabot::registry::open_registry;
use ollamabot::{
    AttachmentIngestor, CommandHandler, Config, ConsentGate, ContextConfig, ContextManager,
    ConversationStore, OllamaBackend, OllamaConfig,
};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let register_mode = args.iter().any(|a| a == "--register" || a == "-r");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("ollamabot v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: ollamabot [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --register, -r     Register slash commands with Discord and exit");
        println!("  --help, -h         Show this help");
        println!();
        println!("Default: serve the interactions endpoint");
        println!();
        println!("Environment variables:");
        println!("  DISCORD_TOKEN            Discord bot token");
        println!("  DISCORD_APPLICATION_ID   Discord application ID (or CLIENT_ID)");
        println!("  OLLAMA_URL               Ollama URL (default: http://localhost:11434)");
        println!("  BOT_DB_PATH              SQLite database path");
        println!("  BOT_BIND_ADDR            Bind address (default: 127.0.0.1)");
        println!("  BOT_PORT                 Port (default: 8787)");
        println!("  DISCORD_PUBLIC_KEY       Application public key for interaction signatures");
        println!("  BRIDGE_API_KEY           Shared key required from the relay");
        println!("  BACKEND_TIMEOUT_SECS     Model call deadline (default: 600)");
        println!("  ATTACHMENT_TIMEOUT_SECS  Attachment fetch deadline (default: 120)");
        println!("  MODEL_REGISTRY           sqlite | memory (default: sqlite)");
        println!("  LOG_FORMAT               json for JSON logs");
        return Ok(());
    }

    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let http = reqwest::Client::new();
    let discord = DiscordClient::new(config.discord()?, http.clone());

    if register_mode {
        info!("Registering slash commands");
        let count = discord
            .register_commands()
            .await
            .context("failed to register slash commands")?;
        info!("Registered {} commands", count);
        return Ok(());
    }

    info!("ollamabot v{}", env!("CARGO_PKG_VERSION"));

    let manager = build_manager(&config, http).await?;
    let state = Arc::new(AppState {
        handler: Arc::new(CommandHandler::new(Arc::new(manager))),
        discord,
        bridge_key: config.bridge_key.clone(),
        verifier: config.verifier()?,
    });

    channels::serve(state, config.socket_addr()).await
}

async fn build_manager(config: &Config, http: reqwest::Client) -> anyhow::Result<ContextManager> {
    info!("Database: {}", config.db_path.display());
    let store = ConversationStore::open(&config.db_path).context("failed to open conversation store")?;
    let consent = ConsentGate::open(&config.db_path).context("failed to open consent store")?;
    let registry = open_registry(config.registry, &config.db_path).context("failed to open model registry")?;
    info!("Model registry: {:?}", config.registry);

    let backend = OllamaBackend::new(OllamaConfig {
        url: config.ollama_url.clone(),
        request_timeout: config.backend_timeout,
    })?;
    info!("Ollama: {}", config.ollama_url);
    if !backend.is_available().await {
        warn!("Ollama is not reachable at {} - chat will fail until it is", config.ollama_url);
    }

    let stats = store.stats()?;
    info!(
        "Loaded {} conversations across {} guilds",
        stats.total_channels, stats.total_guilds
    );

    if config.backend_timeout.is_zero() {
        warn!("BACKEND_TIMEOUT_SECS is 0 - every model call will time out");
    }

    Ok(ContextManager::new(
        Arc::new(store),
        Arc::new(consent),
        Arc::from(registry),
        Arc::new(backend),
        AttachmentIngestor::new(http),
        ContextConfig {
            backend_timeout: config.backend_timeout,
            attachment_timeout: config.attachment_timeout,
        },
    ))
}
