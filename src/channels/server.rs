//! Interactions HTTP Server
//!
//! Axum endpoint that receives Discord interactions from the relay in front
//! of the bot, answers the quick ones inline and defers the slow ones.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::discord::{self, DiscordClient, Interaction};
use super::signature::{InteractionVerifier, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::commands::{Command, CommandHandler, Reply};

/// Header carrying the shared relay key
pub const BRIDGE_KEY_HEADER: &str = "x-bridge-key";

pub struct AppState {
    pub handler: Arc<CommandHandler>,
    pub discord: DiscordClient,
    /// When set, requests must present it in [`BRIDGE_KEY_HEADER`]
    pub bridge_key: Option<String>,
    /// When set, requests must carry a valid Discord signature
    pub verifier: Option<InteractionVerifier>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/interactions", post(interactions))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl+C or SIGTERM
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    if state.bridge_key.is_none() && state.verifier.is_none() {
        warn!("Neither DISCORD_PUBLIC_KEY nor BRIDGE_API_KEY is set - interactions endpoint is unauthenticated");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Interactions endpoint listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authorized(state: &AppState, headers: &HeaderMap, body: &[u8]) -> bool {
    if let Some(key) = &state.bridge_key {
        if header(headers, BRIDGE_KEY_HEADER) != Some(key.as_str()) {
            return false;
        }
    }

    match &state.verifier {
        None => true,
        Some(verifier) => match (header(headers, SIGNATURE_HEADER), header(headers, TIMESTAMP_HEADER)) {
            (Some(signature), Some(timestamp)) => verifier.verify(signature, timestamp, body),
            _ => false,
        },
    }
}

async fn interactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers, &body) {
        warn!("Rejected unauthenticated interaction");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(interaction) => interaction,
        Err(e) => {
            warn!("Rejected malformed interaction: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    debug!("Interaction {} type {}", interaction.id, interaction.kind);

    match interaction.kind {
        discord::PING => Json(discord::pong()).into_response(),

        discord::MESSAGE_COMPONENT => {
            if interaction.custom_id() == Some(discord::CONSENT_BUTTON_ID) {
                Json(discord::consent_modal()).into_response()
            } else {
                StatusCode::BAD_REQUEST.into_response()
            }
        }

        discord::APPLICATION_COMMAND | discord::MODAL_SUBMIT => dispatch(state, interaction).await,

        other => {
            warn!("Unsupported interaction type {}", other);
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

async fn dispatch(state: Arc<AppState>, interaction: Interaction) -> Response {
    let Some(invocation) = interaction.invocation() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some(command) = interaction.command() else {
        return Json(discord::message(&Reply::ephemeral("Unknown command."))).into_response();
    };

    info!("/{} from {} in {}", command.name(), invocation.user.id, invocation.key);

    match command {
        // Model calls and uploads outlive Discord's 3 second response window
        Command::Chat { .. } | Command::Export => {
            // Local rejections are private and must not land in a public deferral
            if let Some(reply) = state.handler.precheck(&invocation, &command) {
                return Json(discord::message(&reply)).into_response();
            }

            let ephemeral = matches!(command, Command::Export);
            let token = interaction.token;

            tokio::spawn(async move {
                let reply = state.handler.handle(&invocation, command).await;
                if let Err(e) = state.discord.deliver(&token, &reply).await {
                    error!("Failed to deliver reply for {}: {}", invocation.key, e);
                }
            });

            Json(discord::deferred(ephemeral)).into_response()
        }
        command => {
            let reply = state.handler.handle(&invocation, command).await;
            Json(discord::message(&reply)).into_response()
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
