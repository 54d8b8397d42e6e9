//! Attachment Ingestor
//!
//! Turns one uploaded file into a user turn the model can read. Text files
//! are inlined; everything else is sent as a base64 image payload, which is
//! only meaningful for vision models but is what unknown types fall back to.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BotError;
use crate::transcript::{Sender, Turn};

/// Largest attachment accepted (1 GiB)
pub const MAX_ATTACHMENT_BYTES: u64 = 1_073_741_824;

/// Reference to an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
}

impl Attachment {
    pub fn is_text(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/"))
    }
}

/// Reject attachments over [`MAX_ATTACHMENT_BYTES`]
pub fn check_size(size: u64) -> Result<(), BotError> {
    if size > MAX_ATTACHMENT_BYTES {
        return Err(BotError::AttachmentTooLarge {
            size,
            limit: MAX_ATTACHMENT_BYTES,
        });
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct AttachmentIngestor {
    client: reqwest::Client,
}

impl AttachmentIngestor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch an attachment and build the user turn that carries it
    pub async fn ingest(
        &self,
        attachment: &Attachment,
        sender: &Sender,
        timeout: Duration,
    ) -> Result<Turn, BotError> {
        check_size(attachment.size)?;

        tokio::time::timeout(timeout, self.fetch(attachment, sender))
            .await
            .map_err(|_| {
                warn!("Attachment fetch timed out: {}", attachment.filename);
                BotError::BackendTimeout(timeout)
            })?
    }

    async fn fetch(&self, attachment: &Attachment, sender: &Sender) -> Result<Turn, BotError> {
        let failed = |e: reqwest::Error| {
            BotError::AttachmentProcessingFailed(format!("{}: {}", attachment.filename, e))
        };

        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(failed)?;

        let header = format!("Attached file: {}", attachment.filename);

        if attachment.is_text() {
            let text = response.text().await.map_err(failed)?;
            debug!("Ingested text attachment {} ({} chars)", attachment.filename, text.len());
            return Ok(Turn::user(
                format!("{}\nFile contents:\n{}", header, text),
                sender.clone(),
            ));
        }

        let bytes = response.bytes().await.map_err(failed)?;
        debug!("Ingested binary attachment {} ({} bytes)", attachment.filename, bytes.len());
        Ok(Turn::user_with_images(header, sender.clone(), vec![STANDARD.encode(&bytes)]))
    }
}
