//! Chat platform adapters
//!
//! - `discord`: interaction wire types and the Discord REST client
//! - `server`: HTTP endpoint receiving interactions
//! - `signature`: ed25519 check of incoming interactions

pub mod discord;
pub mod server;
pub mod signature;

pub use discord::{DiscordClient, DiscordConfig, DiscordError, Interaction};
pub use server::{router, serve, AppState};
pub use signature::InteractionVerifier;
