//! Discord Channel Implementation
//!
//! Slash-command interactions over the Discord HTTP API. Interactions arrive
//! at the endpoint in [`super::server`]; this module holds the wire types,
//! the mapping to [`Command`]s and the REST client used to register
//! commands and fill in deferred replies.
//!
//! # Configuration
//!
//! Environment variables:
//! - `DISCORD_TOKEN`: Discord bot token
//! - `DISCORD_APPLICATION_ID` (or `CLIENT_ID`): Discord application ID

use reqwest::multipart;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::attachment::Attachment;
use crate::commands::{Command, Invocation, Reply};
use crate::transcript::{ChannelKey, Sender, DIRECT_MESSAGE_GUILD};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Discord's per-message character limit
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Interaction types
pub const PING: u8 = 1;
pub const APPLICATION_COMMAND: u8 = 2;
pub const MESSAGE_COMPONENT: u8 = 3;
pub const MODAL_SUBMIT: u8 = 5;

/// Interaction callback types
const PONG: u8 = 1;
const CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;
const DEFERRED_CHANNEL_MESSAGE_WITH_SOURCE: u8 = 5;
const MODAL: u8 = 9;

/// Message flag hiding a reply from everyone but the invoker
const EPHEMERAL: u64 = 1 << 6;

const ADMINISTRATOR: u64 = 1 << 3;

/// Application command option types
const OPTION_STRING: u8 = 3;
const OPTION_ATTACHMENT: u8 = 11;

pub const CONSENT_BUTTON_ID: &str = "eula_agree";
pub const CONSENT_MODAL_ID: &str = "eula_modal";
pub const CONSENT_INPUT_ID: &str = "eula_input";

/// Discord channel configuration
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Bot token
    pub bot_token: String,
    /// Application ID
    pub application_id: String,
    /// REST base URL, overridable for tests
    pub api_base: String,
    /// Maximum message length (Discord limit: 2000)
    pub max_message_length: usize,
}

impl DiscordConfig {
    pub fn new(bot_token: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            application_id: application_id.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            max_message_length: MAX_MESSAGE_LENGTH,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscordError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discord error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// REST client for the parts of the Discord API the bot uses
#[derive(Clone)]
pub struct DiscordClient {
    config: DiscordConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: f64,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.config.bot_token)
    }

    fn webhook_url(&self, token: &str) -> String {
        format!(
            "{}/webhooks/{}/{}",
            self.config.api_base, self.config.application_id, token
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DiscordError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after = serde_json::from_str::<RateLimitBody>(&body)
                .map(|b| b.retry_after)
                .unwrap_or(5.0);
            return Err(DiscordError::RateLimited(Duration::from_secs_f64(retry_after.max(0.0))));
        }

        Err(DiscordError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Overwrite the global slash commands. Returns how many were registered.
    pub async fn register_commands(&self) -> Result<usize, DiscordError> {
        let url = format!(
            "{}/applications/{}/commands",
            self.config.api_base, self.config.application_id
        );

        let response = self
            .client
            .put(&url)
            .header("Authorization", self.auth())
            .json(&command_definitions())
            .send()
            .await?;

        let registered: Vec<Value> = Self::check(response).await?.json().await?;
        info!("Registered {} slash commands", registered.len());
        Ok(registered.len())
    }

    /// Replace the content of a deferred interaction response
    pub async fn edit_original(&self, token: &str, payload: &Value) -> Result<(), DiscordError> {
        let url = format!("{}/messages/@original", self.webhook_url(token));
        let response = self
            .client
            .patch(&url)
            .json(payload)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Edit the deferred response, attaching one file
    pub async fn edit_original_with_file(
        &self,
        token: &str,
        content: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), DiscordError> {
        let url = format!("{}/messages/@original", self.webhook_url(token));
        let payload = json!({
            "content": content,
            "attachments": [{"id": 0, "filename": filename}],
        });

        let file = multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str("application/json")?;
        let form = multipart::Form::new()
            .text("payload_json", serde_json::to_string(&payload)?)
            .part("files[0]", file);

        let response = self.client.patch(&url).multipart(form).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Post an additional message after the original response
    pub async fn followup(&self, token: &str, content: &str, ephemeral: bool) -> Result<(), DiscordError> {
        let mut payload = json!({ "content": content });
        if ephemeral {
            payload["flags"] = json!(EPHEMERAL);
        }

        let response = self
            .client
            .post(self.webhook_url(token))
            .json(&payload)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Remove the deferred response placeholder
    pub async fn delete_original(&self, token: &str) -> Result<(), DiscordError> {
        let url = format!("{}/messages/@original", self.webhook_url(token));
        let response = self.client.delete(&url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Fill in a deferred response with a command's reply
    pub async fn deliver(&self, token: &str, reply: &Reply) -> Result<(), DiscordError> {
        match reply {
            Reply::Text { content, ephemeral } => {
                let chunks = split_message(content, self.config.max_message_length);
                let mut chunks = chunks.iter();

                // A deferred response keeps the visibility it was created with,
                // so private text replaces it with private follow-ups
                if *ephemeral {
                    self.delete_original(token).await?;
                    if let Some(first) = chunks.next() {
                        self.followup(token, first, true).await?;
                    }
                } else if let Some(first) = chunks.next() {
                    self.edit_original(token, &json!({ "content": first })).await?;
                }
                for chunk in chunks {
                    // Respect rate limits
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    self.followup(token, chunk, *ephemeral).await?;
                }
                debug!("Delivered {} chars", content.len());
                Ok(())
            }
            Reply::File {
                content,
                filename,
                data,
                ..
            } => {
                self.edit_original_with_file(token, content, filename, data.clone())
                    .await
            }
            Reply::ConsentPrompt { .. } => self.edit_original(token, &message_data(reply)).await,
        }
    }
}

/// Split long messages at line breaks, keeping code fences balanced
pub fn split_message(content: &str, max_len: usize) -> Vec<String> {
    if content.chars().count() <= max_len {
        return vec![content.to_string()];
    }

    // Room for a closing fence when a chunk ends inside a code block
    let budget = max_len.saturating_sub(4).max(1);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    fn flush(current: &mut String, current_len: &mut usize, chunks: &mut Vec<String>) {
        let open_blocks = current.matches("```").count();
        if open_blocks % 2 == 1 {
            current.push_str("\n```");
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
        *current_len = 0;
        if open_blocks % 2 == 1 {
            current.push_str("```\n");
            *current_len = 4;
        }
    }

    for line in content.lines() {
        let line_len = line.chars().count();
        let separator = usize::from(current_len > 0);

        if current_len + separator + line_len > budget && current_len > 0 {
            flush(&mut current, &mut current_len, &mut chunks);
        }

        // Hard-wrap lines that cannot fit on their own
        let mut rest = line;
        while current_len + rest.chars().count() > budget {
            let room = budget.saturating_sub(current_len).max(1);
            let cut = rest
                .char_indices()
                .nth(room)
                .map_or(rest.len(), |(i, _)| i);
            current.push_str(&rest[..cut]);
            current_len += room;
            rest = &rest[cut..];
            flush(&mut current, &mut current_len, &mut chunks);
        }

        if current_len > 0 && !current.ends_with('\n') {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(rest);
        current_len += rest.chars().count();
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Slash command definitions, in the shape `PUT /applications/{id}/commands` takes
pub fn command_definitions() -> Value {
    let admin_only = ADMINISTRATOR.to_string();
    json!([
        {
            "name": "chat",
            "description": "Chat with the local LLM (Ollama). Remembers this channel's conversation.",
            "options": [
                {"type": OPTION_STRING, "name": "prompt", "description": "Message to send to the LLM", "required": true},
                {"type": OPTION_STRING, "name": "model", "description": "Model to use (defaults to the server's model)", "required": false},
                {"type": OPTION_ATTACHMENT, "name": "file", "description": "Attachment (optional, up to 1GB)", "required": false}
            ]
        },
        {
            "name": "listmodels",
            "description": "List the models installed on the local Ollama server."
        },
        {
            "name": "setmodel",
            "description": "Set this server's default model. (Administrators only)",
            "default_member_permissions": admin_only,
            "options": [
                {"type": OPTION_STRING, "name": "model", "description": "Model name, e.g. mistral or llama3.1", "required": true}
            ]
        },
        {
            "name": "clearmemory",
            "description": "Clear this channel's conversation memory. (Administrators only)",
            "default_member_permissions": admin_only
        },
        {
            "name": "eula",
            "description": "Review and accept the privacy policy and notice."
        },
        {
            "name": "export",
            "description": "Export this channel's conversation as a JSON file. (Consenting users only)"
        }
    ])
}

/// Incoming interaction
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub token: String,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub channel: Option<PartialChannel>,
    pub member: Option<GuildMember>,
    pub user: Option<DiscordUser>,
    pub data: Option<InteractionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartialChannel {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMember {
    pub user: Option<DiscordUser>,
    /// Permission bitset, serialized as a decimal string
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractionData {
    pub name: Option<String>,
    pub custom_id: Option<String>,
    #[serde(default)]
    pub options: Vec<CommandOption>,
    pub resolved: Option<ResolvedData>,
    #[serde(default)]
    pub components: Vec<ComponentData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolvedData {
    #[serde(default)]
    pub attachments: HashMap<String, DiscordAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordAttachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub content_type: Option<String>,
}

impl From<&DiscordAttachment> for Attachment {
    fn from(a: &DiscordAttachment) -> Self {
        Self {
            url: a.url.clone(),
            filename: a.filename.clone(),
            content_type: a.content_type.clone(),
            size: a.size,
        }
    }
}

/// Modal rows and text inputs share this shape
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentData {
    pub custom_id: Option<String>,
    pub value: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentData>,
}

impl InteractionData {
    fn option(&self, name: &str) -> Option<&CommandOption> {
        self.options.iter().find(|o| o.name == name)
    }

    fn string_option(&self, name: &str) -> Option<String> {
        self.option(name)
            .filter(|o| o.kind == OPTION_STRING)
            .and_then(|o| o.value.as_ref())
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn attachment_option(&self, name: &str) -> Option<Attachment> {
        let id = self
            .option(name)
            .filter(|o| o.kind == OPTION_ATTACHMENT)
            .and_then(|o| o.value.as_ref())
            .and_then(Value::as_str)?;

        match self.resolved.as_ref().and_then(|r| r.attachments.get(id)) {
            Some(attachment) => Some(Attachment::from(attachment)),
            None => {
                warn!("Attachment option {} not present in resolved data", id);
                None
            }
        }
    }

    fn input_value(&self, custom_id: &str) -> Option<String> {
        fn find<'a>(components: &'a [ComponentData], custom_id: &str) -> Option<&'a str> {
            components.iter().find_map(|c| {
                if c.custom_id.as_deref() == Some(custom_id) {
                    c.value.as_deref()
                } else {
                    find(&c.components, custom_id)
                }
            })
        }
        find(&self.components, custom_id).map(str::to_string)
    }
}

impl Interaction {
    pub fn user(&self) -> Option<&DiscordUser> {
        self.member
            .as_ref()
            .and_then(|m| m.user.as_ref())
            .or(self.user.as_ref())
    }

    /// Guild and channel; DMs use the `@me` guild
    pub fn channel_key(&self) -> Option<ChannelKey> {
        let channel_id = self
            .channel_id
            .clone()
            .or_else(|| self.channel.as_ref().map(|c| c.id.clone()))?;
        let guild_id = self
            .guild_id
            .clone()
            .unwrap_or_else(|| DIRECT_MESSAGE_GUILD.to_string());
        Some(ChannelKey::new(guild_id, channel_id))
    }

    pub fn is_admin(&self) -> bool {
        self.member
            .as_ref()
            .and_then(|m| m.permissions.as_deref())
            .and_then(|p| p.parse::<u64>().ok())
            .is_some_and(|bits| bits & ADMINISTRATOR != 0)
    }

    pub fn invocation(&self) -> Option<Invocation> {
        let user = self.user()?;
        Some(Invocation {
            key: self.channel_key()?,
            user: Sender::new(user.id.clone(), user.username.clone()),
            is_admin: self.is_admin(),
        })
    }

    pub fn custom_id(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.custom_id.as_deref())
    }

    /// Map a slash command or modal submission to a [`Command`]
    pub fn command(&self) -> Option<Command> {
        let data = self.data.as_ref()?;

        match self.kind {
            APPLICATION_COMMAND => match data.name.as_deref()? {
                "chat" => Some(Command::Chat {
                    prompt: data.string_option("prompt").unwrap_or_default(),
                    model: data.string_option("model"),
                    attachment: data.attachment_option("file"),
                }),
                "listmodels" => Some(Command::ListModels),
                "setmodel" => Some(Command::SetModel {
                    model: data.string_option("model").unwrap_or_default(),
                }),
                "clearmemory" => Some(Command::ClearMemory),
                "eula" => Some(Command::Eula),
                "export" => Some(Command::Export),
                _ => None,
            },
            MODAL_SUBMIT if data.custom_id.as_deref() == Some(CONSENT_MODAL_ID) => {
                Some(Command::Agree {
                    display_name: data.input_value(CONSENT_INPUT_ID).unwrap_or_default(),
                })
            }
            _ => None,
        }
    }
}

/// Message body for an immediate reply or a follow-up edit
pub fn message_data(reply: &Reply) -> Value {
    let mut data = match reply {
        Reply::Text { content, .. } => json!({ "content": content }),
        Reply::File { content, .. } => json!({ "content": content }),
        Reply::ConsentPrompt { text } => json!({
            "embeds": [{
                "title": "Privacy Policy and Notice",
                "description": text,
            }],
            "components": [{
                "type": 1,
                "components": [{
                    "type": 2,
                    "style": 1,
                    "label": "I agree",
                    "custom_id": CONSENT_BUTTON_ID,
                }],
            }],
        }),
    };

    if reply.is_ephemeral() {
        data["flags"] = json!(EPHEMERAL);
    }
    data
}

pub fn pong() -> Value {
    json!({ "type": PONG })
}

pub fn deferred(ephemeral: bool) -> Value {
    if ephemeral {
        json!({ "type": DEFERRED_CHANNEL_MESSAGE_WITH_SOURCE, "data": { "flags": EPHEMERAL } })
    } else {
        json!({ "type": DEFERRED_CHANNEL_MESSAGE_WITH_SOURCE })
    }
}

pub fn message(reply: &Reply) -> Value {
    json!({ "type": CHANNEL_MESSAGE_WITH_SOURCE, "data": message_data(reply) })
}

/// Name form shown when the agree button is pressed
pub fn consent_modal() -> Value {
    json!({
        "type": MODAL,
        "data": {
            "custom_id": CONSENT_MODAL_ID,
            "title": "Privacy Policy Agreement",
            "components": [{
                "type": 1,
                "components": [{
                    "type": 4,
                    "custom_id": CONSENT_INPUT_ID,
                    "label": "Enter your name or user ID",
                    "style": 1,
                    "required": true,
                }],
            }],
        },
    })
}
