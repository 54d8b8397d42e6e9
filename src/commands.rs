//! Command layer
//!
//! Typed bot commands and the single place where failures become
//! user-visible text. Platform adapters parse their payloads into a
//! [`Command`] plus an [`Invocation`], call [`CommandHandler::handle`] and
//! deliver whatever [`Reply`] comes back.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::attachment::Attachment;
use crate::context::{ContextManager, ConverseRequest};
use crate::error::BotError;
use crate::transcript::{ChannelKey, Sender};

pub const EULA_TEXT: &str = "\
[Privacy Policy and Notice]

This bot generates responses using AI. AI can make mistakes; younger users in particular should have a guardian check its answers.
By using this bot you agree to this privacy policy and notice.
We store only your Discord ID and the name you provide, and only to operate the service.
All AI responses are for reference only and their accuracy is not guaranteed.
Younger users should confirm any AI response with an adult guardian before relying on it.";

/// File name used for conversation exports
pub const EXPORT_FILENAME: &str = "conversation.json";

/// A parsed user command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Chat {
        prompt: String,
        model: Option<String>,
        attachment: Option<Attachment>,
    },
    ListModels,
    SetModel {
        model: String,
    },
    ClearMemory,
    Eula,
    /// Submission of the consent form
    Agree {
        display_name: String,
    },
    Export,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::ListModels => "listmodels",
            Self::SetModel { .. } => "setmodel",
            Self::ClearMemory => "clearmemory",
            Self::Eula => "eula",
            Self::Agree { .. } => "eula_modal",
            Self::Export => "export",
        }
    }

    pub fn requires_admin(&self) -> bool {
        matches!(self, Self::SetModel { .. } | Self::ClearMemory)
    }
}

/// Who issued a command, and where
#[derive(Debug, Clone)]
pub struct Invocation {
    pub key: ChannelKey,
    pub user: Sender,
    pub is_admin: bool,
}

/// What to send back
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text {
        content: String,
        ephemeral: bool,
    },
    File {
        content: String,
        filename: String,
        data: Vec<u8>,
        ephemeral: bool,
    },
    /// Consent text with an agree button
    ConsentPrompt { text: String },
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            ephemeral: false,
        }
    }

    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            ephemeral: true,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        match self {
            Self::Text { ephemeral, .. } | Self::File { ephemeral, .. } => *ephemeral,
            Self::ConsentPrompt { .. } => true,
        }
    }
}

/// User-facing text for a failure
pub fn render_error(err: &BotError) -> Reply {
    match err {
        BotError::ConsentRequired(_) => {
            Reply::ephemeral("Please accept the privacy policy first with the /eula command.")
        }
        BotError::NoDefaultModel(_) => Reply::ephemeral(
            "No default model is set for this server. Set one with the `/setmodel` command.",
        ),
        BotError::AttachmentTooLarge { .. } => {
            Reply::ephemeral("The attached file is larger than 1GB.")
        }
        BotError::AttachmentProcessingFailed(_) => {
            Reply::ephemeral("An error occurred while processing the attachment.")
        }
        BotError::BackendUnavailable(_) => {
            Reply::text("The language model server is not reachable right now. Please try again later.")
        }
        BotError::BackendError(_) => {
            Reply::text("An error occurred while communicating with the LLM.")
        }
        BotError::BackendTimeout(_) => {
            Reply::text("The language model took too long to respond. Please try again.")
        }
        BotError::StorePersistFailed(_) => {
            Reply::text("The conversation could not be saved. Please try again.")
        }
        BotError::EmptyPrompt => Reply::ephemeral("Please enter a message or attach a file."),
        BotError::PermissionDenied => {
            Reply::ephemeral("This command can only be used by administrators.")
        }
    }
}

pub struct CommandHandler {
    manager: Arc<ContextManager>,
}

impl CommandHandler {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self { manager }
    }

    /// Execute a command. Never fails; errors are rendered into the reply.
    pub async fn handle(&self, invocation: &Invocation, command: Command) -> Reply {
        let name = command.name();
        match self.dispatch(invocation, command).await {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    BotError::StorePersistFailed(_)
                    | BotError::BackendError(_)
                    | BotError::BackendUnavailable(_) => {
                        error!("/{} failed in {}: {}", name, invocation.key, e)
                    }
                    _ => warn!("/{} rejected for {}: {}", name, invocation.user.id, e),
                }
                render_error(&e)
            }
        }
    }

    /// Rejections that can be decided without calling the model.
    ///
    /// Returns the rendered reply when `command` would fail its local
    /// checks, so the adapter can answer privately instead of deferring a
    /// public reply.
    pub fn precheck(&self, invocation: &Invocation, command: &Command) -> Option<Reply> {
        let result = match command {
            _ if command.requires_admin() && !invocation.is_admin => Err(BotError::PermissionDenied),
            Command::Chat {
                prompt,
                model,
                attachment,
            } => {
                let request = chat_request(invocation, prompt.clone(), model.clone(), attachment.clone());
                self.manager.admit(&request).map(|_| ())
            }
            Command::Export => match self.manager.has_agreed(&invocation.user.id) {
                Ok(true) => Ok(()),
                Ok(false) => Err(BotError::ConsentRequired(invocation.user.id.clone())),
                Err(e) => Err(e),
            },
            _ => Ok(()),
        };

        match result {
            Ok(()) => None,
            Err(e) => {
                warn!("/{} rejected for {}: {}", command.name(), invocation.user.id, e);
                Some(render_error(&e))
            }
        }
    }

    async fn dispatch(&self, invocation: &Invocation, command: Command) -> Result<Reply, BotError> {
        if command.requires_admin() && !invocation.is_admin {
            return Err(BotError::PermissionDenied);
        }

        match command {
            Command::Chat {
                prompt,
                model,
                attachment,
            } => {
                let request = chat_request(invocation, prompt, model, attachment);
                let reply = self.manager.converse(request).await?;
                Ok(Reply::text(reply))
            }

            Command::ListModels => {
                let models = self.manager.list_models().await?;
                let default = self.manager.default_model(&invocation.key.guild_id)?;
                let mut text = String::from("Available models:\n");
                if models.is_empty() {
                    text.push_str("No models are installed.");
                } else {
                    for model in &models {
                        if default.as_deref() == Some(model.as_str()) {
                            text.push_str(&format!("- {} (default)\n", model));
                        } else {
                            text.push_str(&format!("- {}\n", model));
                        }
                    }
                }
                Ok(Reply::ephemeral(text))
            }

            Command::SetModel { model } => {
                let model = model.trim();
                if model.is_empty() {
                    return Ok(Reply::ephemeral("Please provide a model name."));
                }
                self.manager.set_default_model(&invocation.key.guild_id, model)?;
                Ok(Reply::text(format!(
                    "The default model for this server is now **{}**.",
                    model
                )))
            }

            Command::ClearMemory => {
                self.manager.clear(&invocation.key).await?;
                Ok(Reply::text("Conversation memory for this channel has been cleared."))
            }

            Command::Eula => Ok(Reply::ConsentPrompt {
                text: EULA_TEXT.to_string(),
            }),

            Command::Agree { display_name } => {
                let display_name = display_name.trim();
                let display_name = if display_name.is_empty() {
                    invocation.user.display_name.as_str()
                } else {
                    display_name
                };

                if self.manager.agree(&invocation.user.id, display_name)? {
                    info!("Consent recorded for {}", invocation.user.id);
                    Ok(Reply::ephemeral("Agreement complete. You can now use the bot."))
                } else {
                    Ok(Reply::ephemeral("You have already agreed. You can use the bot."))
                }
            }

            Command::Export => {
                match self.manager.export(&invocation.key, &invocation.user.id)? {
                    Some(blob) => Ok(Reply::File {
                        content: "Exporting the conversation history as a JSON file.".to_string(),
                        filename: EXPORT_FILENAME.to_string(),
                        data: blob.into_bytes(),
                        ephemeral: true,
                    }),
                    None => Ok(Reply::ephemeral("There is no conversation history in this channel.")),
                }
            }
        }
    }
}

fn chat_request(
    invocation: &Invocation,
    prompt: String,
    model: Option<String>,
    attachment: Option<Attachment>,
) -> ConverseRequest {
    let mut request = ConverseRequest::new(invocation.key.clone(), invocation.user.clone(), prompt);
    request.model = model;
    request.attachment = attachment;
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentIngestor;
    use crate::backend::{BackendError, ChatMessage, ModelBackend};
    use crate::consent::ConsentGate;
    use crate::context::ContextConfig;
    use crate::conversation::ConversationStore;
    use crate::registry::InMemoryModelRegistry;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ModelBackend for Echo {
        async fn chat(&self, _model: &str, messages: &[ChatMessage]) -> Result<String, BackendError> {
            Ok(format!("echo: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")))
        }

        async fn list_models(&self) -> Result<Vec<String>, BackendError> {
            Ok(vec!["llama3".to_string(), "mistral".to_string()])
        }
    }

    fn handler() -> CommandHandler {
        let manager = ContextManager::new(
            Arc::new(ConversationStore::open_in_memory().unwrap()),
            Arc::new(ConsentGate::open_in_memory().unwrap()),
            Arc::new(InMemoryModelRegistry::new()),
            Arc::new(Echo),
            AttachmentIngestor::default(),
            ContextConfig::default(),
        );
        CommandHandler::new(Arc::new(manager))
    }

    fn member(is_admin: bool) -> Invocation {
        Invocation {
            key: ChannelKey::new("g1", "c1"),
            user: Sender::new("u1", "max"),
            is_admin,
        }
    }

    fn chat(prompt: &str) -> Command {
        Command::Chat {
            prompt: prompt.to_string(),
            model: Some("llama3".to_string()),
            attachment: None,
        }
    }

    fn text_of(reply: &Reply) -> &str {
        match reply {
            Reply::Text { content, .. } | Reply::File { content, .. } => content,
            Reply::ConsentPrompt { text } => text,
        }
    }

    #[tokio::test]
    async fn test_chat_requires_consent() {
        let handler = handler();
        let reply = handler.handle(&member(false), chat("hello")).await;
        assert!(reply.is_ephemeral());
        assert!(text_of(&reply).contains("/eula"));
    }

    #[tokio::test]
    async fn test_consent_flow_then_chat() {
        let handler = handler();
        let user = member(false);

        assert!(matches!(handler.handle(&user, Command::Eula).await, Reply::ConsentPrompt { .. }));

        let reply = handler
            .handle(&user, Command::Agree { display_name: "Max".into() })
            .await;
        assert!(text_of(&reply).starts_with("Agreement complete"));

        let again = handler
            .handle(&user, Command::Agree { display_name: "Max".into() })
            .await;
        assert!(text_of(&again).contains("already agreed"));

        let reply = handler.handle(&user, chat("hello")).await;
        assert_eq!(reply, Reply::text("echo: hello"));
    }

    #[tokio::test]
    async fn test_admin_commands_rejected_for_members() {
        let handler = handler();
        for command in [Command::SetModel { model: "llama3".into() }, Command::ClearMemory] {
            let reply = handler.handle(&member(false), command).await;
            assert_eq!(reply, render_error(&BotError::PermissionDenied));
        }
    }

    #[tokio::test]
    async fn test_setmodel_becomes_chat_default() {
        let handler = handler();
        let admin = member(true);
        handler.handle(&admin, Command::Agree { display_name: "Max".into() }).await;

        let no_default = Command::Chat {
            prompt: "hello".into(),
            model: None,
            attachment: None,
        };
        let reply = handler.handle(&admin, no_default.clone()).await;
        assert!(text_of(&reply).contains("/setmodel"));

        let reply = handler.handle(&admin, Command::SetModel { model: "mistral".into() }).await;
        assert!(text_of(&reply).contains("**mistral**"));

        let reply = handler.handle(&admin, no_default).await;
        assert_eq!(text_of(&reply), "echo: hello");
    }

    #[tokio::test]
    async fn test_listmodels() {
        let reply = handler().handle(&member(false), Command::ListModels).await;
        assert_eq!(text_of(&reply), "Available models:\n- llama3\n- mistral\n");
        assert!(reply.is_ephemeral());
    }

    #[tokio::test]
    async fn test_export() {
        let handler = handler();
        let user = member(false);

        // Needs consent
        let reply = handler.handle(&user, Command::Export).await;
        assert!(text_of(&reply).contains("/eula"));

        handler.handle(&user, Command::Agree { display_name: "Max".into() }).await;
        let reply = handler.handle(&user, Command::Export).await;
        assert!(text_of(&reply).contains("no conversation history"));

        handler.handle(&user, chat("hello")).await;
        match handler.handle(&user, Command::Export).await {
            Reply::File { filename, data, .. } => {
                assert_eq!(filename, EXPORT_FILENAME);
                let turns: serde_json::Value = serde_json::from_slice(&data).unwrap();
                assert_eq!(turns[0]["content"], "hello");
                assert_eq!(turns[1]["content"], "echo: hello");
            }
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clearmemory() {
        let handler = handler();
        let admin = member(true);
        handler.handle(&admin, Command::Agree { display_name: "Max".into() }).await;
        handler.handle(&admin, chat("hello")).await;

        let reply = handler.handle(&admin, Command::ClearMemory).await;
        assert!(text_of(&reply).contains("cleared"));

        let reply = handler.handle(&admin, Command::Export).await;
        assert!(text_of(&reply).contains("no conversation history"));
    }

    #[tokio::test]
    async fn test_listmodels_marks_guild_default() {
        let handler = handler();
        let admin = member(true);
        handler.handle(&admin, Command::SetModel { model: "mistral".into() }).await;

        let reply = handler.handle(&admin, Command::ListModels).await;
        assert_eq!(text_of(&reply), "Available models:\n- llama3\n- mistral (default)\n");
    }

    #[tokio::test]
    async fn test_precheck_rejects_before_model_call() {
        let handler = handler();
        let user = member(false);

        let reply = handler.precheck(&user, &chat("hello")).unwrap();
        assert!(reply.is_ephemeral());
        assert!(text_of(&reply).contains("/eula"));
        assert!(handler.precheck(&user, &Command::Export).unwrap().is_ephemeral());
        assert_eq!(
            handler.precheck(&user, &Command::ClearMemory),
            Some(render_error(&BotError::PermissionDenied))
        );

        handler.handle(&user, Command::Agree { display_name: "Max".into() }).await;
        assert_eq!(handler.precheck(&user, &chat("hello")), None);
        assert_eq!(handler.precheck(&user, &Command::Export), None);
        assert_eq!(
            handler.precheck(&user, &chat("   ")),
            Some(render_error(&BotError::EmptyPrompt))
        );

        let no_default = Command::Chat {
            prompt: "hello".into(),
            model: None,
            attachment: None,
        };
        let reply = handler.precheck(&user, &no_default).unwrap();
        assert!(text_of(&reply).contains("/setmodel"));
    }
}
