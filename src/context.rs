//! Context Manager
//!
//! Drives one request/response cycle for a channel:
//!
//! ```text
//! consent ─► model ─► lock(channel) ─► load ─► + user turn(s) ─► backend ─► + reply ─► replace
//! ```
//!
//! Nothing is written unless the backend answers, so a failed call leaves
//! the stored transcript exactly as it was.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attachment::{check_size, Attachment, AttachmentIngestor};
use crate::backend::{ChatMessage, ModelBackend};
use crate::consent::ConsentGate;
use crate::conversation::ConversationStore;
use crate::error::{BotError, Result};
use crate::registry::ModelRegistry;
use crate::transcript::{ChannelKey, Sender, Turn};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Deadline for a model call when the request does not carry one
    pub backend_timeout: Duration,
    /// Deadline for fetching an attachment
    pub attachment_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(600),
            attachment_timeout: Duration::from_secs(120),
        }
    }
}

/// One `converse` call
#[derive(Debug, Clone)]
pub struct ConverseRequest {
    pub key: ChannelKey,
    pub user: Sender,
    pub prompt: String,
    pub model: Option<String>,
    pub attachment: Option<Attachment>,
    pub timeout: Option<Duration>,
}

impl ConverseRequest {
    pub fn new(key: ChannelKey, user: Sender, prompt: impl Into<String>) -> Self {
        Self {
            key,
            user,
            prompt: prompt.into(),
            model: None,
            attachment: None,
            timeout: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-channel async locks. Entries are never evicted; one per active channel.
#[derive(Default)]
struct ChannelLocks {
    locks: Mutex<HashMap<ChannelKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelLocks {
    async fn acquire(&self, key: &ChannelKey) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct ContextManager {
    store: Arc<ConversationStore>,
    consent: Arc<ConsentGate>,
    registry: Arc<dyn ModelRegistry>,
    backend: Arc<dyn ModelBackend>,
    ingestor: AttachmentIngestor,
    locks: ChannelLocks,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(
        store: Arc<ConversationStore>,
        consent: Arc<ConsentGate>,
        registry: Arc<dyn ModelRegistry>,
        backend: Arc<dyn ModelBackend>,
        ingestor: AttachmentIngestor,
        config: ContextConfig,
    ) -> Self {
        Self {
            store,
            consent,
            registry,
            backend,
            ingestor,
            locks: ChannelLocks::default(),
            config,
        }
    }

    fn require_consent(&self, user_id: &str) -> Result<()> {
        if !self.consent.has_agreed(user_id)? {
            return Err(BotError::ConsentRequired(user_id.to_string()));
        }
        Ok(())
    }

    fn resolve_model(&self, explicit: Option<&str>, guild_id: &str) -> Result<String> {
        if let Some(model) = explicit.map(str::trim).filter(|m| !m.is_empty()) {
            return Ok(model.to_string());
        }
        self.registry
            .get(guild_id)?
            .ok_or_else(|| BotError::NoDefaultModel(guild_id.to_string()))
    }

    /// Checks that need no I/O beyond the local stores. Returns the model to use.
    ///
    /// `converse` runs these first; adapters call it directly to reject a
    /// request before they commit to a slow reply.
    pub fn admit(&self, request: &ConverseRequest) -> Result<String> {
        self.require_consent(&request.user.id)?;
        let model = self.resolve_model(request.model.as_deref(), &request.key.guild_id)?;

        if let Some(attachment) = &request.attachment {
            check_size(attachment.size)?;
        }
        if request.prompt.trim().is_empty() && request.attachment.is_none() {
            return Err(BotError::EmptyPrompt);
        }
        Ok(model)
    }

    /// Run one conversational turn and return the model's reply.
    ///
    /// The timeout bounds the whole call: waiting for the channel, fetching
    /// the attachment and the model call share one deadline.
    pub async fn converse(&self, request: ConverseRequest) -> Result<String> {
        let model = self.admit(&request)?;
        let ConverseRequest {
            key,
            user,
            prompt,
            attachment,
            timeout,
            ..
        } = request;

        let timeout = timeout.unwrap_or(self.config.backend_timeout);
        // Out-of-range timeouts behave as no deadline
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365 * 30));
        let timed_out = || {
            warn!("Conversation {} exceeded its {:?} deadline", key, timeout);
            BotError::BackendTimeout(timeout)
        };

        let _guard = tokio::time::timeout_at(deadline, self.locks.acquire(&key))
            .await
            .map_err(|_| timed_out())?;

        let mut transcript = self.store.load(&key)?;
        if !prompt.trim().is_empty() {
            transcript.push(Turn::user(prompt, user.clone()));
        }
        if let Some(attachment) = &attachment {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            let budget = remaining.min(self.config.attachment_timeout);
            let turn = self.ingestor.ingest(attachment, &user, budget).await?;
            transcript.push(turn);
        }

        let messages: Vec<ChatMessage> = transcript.iter().map(ChatMessage::from).collect();
        debug!("Calling {} for {} with {} messages", model, key, messages.len());

        let reply = match tokio::time::timeout_at(deadline, self.backend.chat(&model, &messages)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Backend call failed for {}: {}", key, e);
                return Err(BotError::from_backend(e, timeout));
            }
            Err(_) => return Err(timed_out()),
        };

        // An empty assistant turn would not survive the next load
        if reply.trim().is_empty() {
            warn!("Backend returned an empty reply for {}", key);
            return Err(BotError::BackendError("model returned an empty response".to_string()));
        }

        transcript.push(Turn::assistant(reply.clone()));
        self.store.replace(&key, &transcript)?;

        info!("Conversation {} now has {} turns", key, transcript.len());
        Ok(reply)
    }

    /// Forget a channel's transcript. Returns whether one existed.
    pub async fn clear(&self, key: &ChannelKey) -> Result<bool> {
        let _guard = self.locks.acquire(key).await;
        Ok(self.store.clear(key)?)
    }

    /// Stored transcript blob for a channel, verbatim
    pub fn export(&self, key: &ChannelKey, user_id: &str) -> Result<Option<String>> {
        self.require_consent(user_id)?;
        Ok(self.store.load_raw(key)?)
    }

    /// Record consent. Returns `false` if the user had already agreed.
    pub fn agree(&self, user_id: &str, display_name: &str) -> Result<bool> {
        Ok(self.consent.record_agreement(user_id, display_name)?)
    }

    pub fn has_agreed(&self, user_id: &str) -> Result<bool> {
        Ok(self.consent.has_agreed(user_id)?)
    }

    pub fn set_default_model(&self, guild_id: &str, model: &str) -> Result<()> {
        Ok(self.registry.set(guild_id, model)?)
    }

    pub fn default_model(&self, guild_id: &str) -> Result<Option<String>> {
        Ok(self.registry.get(guild_id)?)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let timeout = self.config.backend_timeout;
        match tokio::time::timeout(timeout, self.backend.list_models()).await {
            Ok(result) => result.map_err(|e| BotError::from_backend(e, timeout)),
            Err(_) => Err(BotError::BackendTimeout(timeout)),
        }
    }
}
