//! ollamabot
//!
//! Discord bot that chats with a local Ollama server and remembers each
//! channel's conversation.
//!
//! # Features
//!
//! - **Per-channel memory**: transcripts keyed by (guild, channel) in SQLite
//! - **Attachments**: text files inlined, images passed to vision models
//! - **Consent gate**: one-time agreement before a user can chat or export
//! - **Guild defaults**: administrators pick each server's default model
//!
//! # Architecture
//!
//! ```text
//! Discord ──► relay ──► /interactions ──► CommandHandler ──► ContextManager ──► Ollama
//!                          (axum)                                 │
//!                                                                 ├── ConversationStore (SQLite)
//!                                                                 ├── ConsentGate (SQLite)
//!                                                                 ├── ModelRegistry (memory | SQLite)
//!                                                                 └── AttachmentIngestor (HTTP)
//! ```

pub mod attachment;
pub mod backend;
pub mod channels;
pub mod commands;
pub mod config;
pub mod consent;
pub mod context;
pub mod conversation;
pub mod db;
pub mod error;
pub mod registry;
pub mod transcript;

pub use attachment::{Attachment, AttachmentIngestor, MAX_ATTACHMENT_BYTES};
pub use backend::{BackendError, ChatMessage, ModelBackend, OllamaBackend, OllamaConfig};
pub use commands::{Command, CommandHandler, Invocation, Reply};
pub use config::Config;
pub use consent::{ConsentGate, ConsentRecord};
pub use context::{ContextConfig, ContextManager, ConverseRequest};
pub use conversation::{ConversationStats, ConversationStore};
pub use db::StoreError;
pub use error::BotError;
pub use registry::{InMemoryModelRegistry, ModelRegistry, RegistryKind, SqliteModelRegistry};
pub use transcript::{ChannelKey, Role, Sender, Transcript, Turn};
