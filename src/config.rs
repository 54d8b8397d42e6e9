//! Configuration management

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::DEFAULT_OLLAMA_URL;
use crate::channels::{DiscordConfig, InteractionVerifier};
use crate::registry::RegistryKind;

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token (required to register commands and deliver replies)
    pub discord_token: Option<String>,

    /// Discord application ID
    pub application_id: Option<String>,

    /// Ollama base URL
    pub ollama_url: String,

    /// SQLite database for conversations, consent and guild models
    pub db_path: PathBuf,

    /// Interactions endpoint bind address (default: 127.0.0.1)
    pub bind_addr: IpAddr,

    /// Interactions endpoint port
    pub port: u16,

    /// Shared key the relay must send
    pub bridge_key: Option<String>,

    /// Application public key (hex) for interaction signatures
    pub public_key: Option<String>,

    /// Deadline for one model call
    pub backend_timeout: Duration,

    /// Deadline for fetching one attachment
    pub attachment_timeout: Duration,

    /// Where per-guild default models live
    pub registry: RegistryKind,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let discord_token = std::env::var("DISCORD_TOKEN").ok();
        let application_id = std::env::var("DISCORD_APPLICATION_ID")
            .or_else(|_| std::env::var("CLIENT_ID"))
            .ok();

        let ollama_url = std::env::var("OLLAMA_URL")
            .unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());

        let db_path = std::env::var("BOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_db_path());

        let bind_addr = match std::env::var("BOT_BIND_ADDR") {
            Ok(addr) => addr
                .parse()
                .with_context(|| format!("invalid BOT_BIND_ADDR '{}'", addr))?,
            Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };

        let port = std::env::var("BOT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8787);

        let bridge_key = std::env::var("BRIDGE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let public_key = std::env::var("DISCORD_PUBLIC_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let backend_timeout = secs_var("BACKEND_TIMEOUT_SECS", 600);
        let attachment_timeout = secs_var("ATTACHMENT_TIMEOUT_SECS", 120);

        let registry = match std::env::var("MODEL_REGISTRY") {
            Ok(kind) => kind.parse().map_err(anyhow::Error::msg)?,
            Err(_) => RegistryKind::default(),
        };

        Ok(Self {
            discord_token,
            application_id,
            ollama_url,
            db_path,
            bind_addr,
            port,
            bridge_key,
            public_key,
            backend_timeout,
            attachment_timeout,
            registry,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Discord credentials, required for anything that talks to Discord
    pub fn discord(&self) -> Result<DiscordConfig> {
        let token = self
            .discord_token
            .clone()
            .context("DISCORD_TOKEN not set")?;
        let application_id = self
            .application_id
            .clone()
            .context("DISCORD_APPLICATION_ID not set")?;
        Ok(DiscordConfig::new(token, application_id))
    }

    /// Signature verifier, when a public key is configured
    pub fn verifier(&self) -> Result<Option<InteractionVerifier>> {
        self.public_key
            .as_deref()
            .map(InteractionVerifier::from_hex)
            .transpose()
            .context("invalid DISCORD_PUBLIC_KEY")
    }
}

/// `<local data dir>/ollamabot/bot.db`, or `./ollamabot/bot.db` when the
/// platform has no data dir
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ollamabot")
        .join("bot.db")
}

fn secs_var(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
