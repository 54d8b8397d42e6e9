//! Transcript model
//!
//! A transcript is the ordered list of turns for one (guild, channel) pair.
//! It is persisted as a single JSON array, which is also the export format:
//!
//! ```json
//! [
//!   {"role":"user","content":"hello","timestamp":1700000000000,
//!    "sender":{"id":"42","username":"max"}},
//!   {"role":"assistant","content":"hi there","timestamp":1700000000420,
//!    "sender":{"id":"assistant","username":"AI"}}
//! ]
//! ```

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender id used for every assistant turn
pub const ASSISTANT_ID: &str = "assistant";

/// Display name used for every assistant turn
pub const ASSISTANT_NAME: &str = "AI";

/// Guild id used for interactions that happen outside a guild (DMs)
pub const DIRECT_MESSAGE_GUILD: &str = "@me";

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity attached to a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(rename = "username")]
    pub display_name: String,
}

impl Sender {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// The fixed sentinel identity for model replies
    pub fn assistant() -> Self {
        Self::new(ASSISTANT_ID, ASSISTANT_NAME)
    }
}

/// Storage key for a transcript
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub guild_id: String,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(guild_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// Rejected turn payloads
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("turn has neither content nor images")]
    Empty,

    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
}

/// One utterance in a transcript.
///
/// `content` may be empty only when `images` carries at least one payload.
/// `timestamp` is absent only on turns read from older rows, and stays
/// absent when written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTurn")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(
        serialize_with = "chrono::serde::ts_milliseconds_option::serialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    pub sender: Sender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl Turn {
    /// A plain user utterance
    pub fn user(content: impl Into<String>, sender: Sender) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Some(now_millis()),
            sender,
            images: None,
        }
    }

    /// A user turn carrying base64 payloads
    pub fn user_with_images(content: impl Into<String>, sender: Sender, images: Vec<String>) -> Self {
        Self {
            images: Some(images),
            ..Self::user(content, sender)
        }
    }

    /// A model reply, attributed to the assistant sentinel
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(now_millis()),
            sender: Sender::assistant(),
            images: None,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.as_ref().map_or(0, Vec::len)
    }
}

/// Wire shape accepted on deserialize, validated into a [`Turn`]
#[derive(Deserialize)]
struct RawTurn {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<i64>,
    sender: Sender,
    #[serde(default)]
    images: Option<Vec<String>>,
}

impl TryFrom<RawTurn> for Turn {
    type Error = TurnError;

    fn try_from(raw: RawTurn) -> Result<Self, Self::Error> {
        let images = raw.images.filter(|images| !images.is_empty());
        if raw.content.is_empty() && images.is_none() {
            return Err(TurnError::Empty);
        }

        // Older rows wrote attachment turns without a timestamp
        let timestamp = raw
            .timestamp
            .map(|ms| DateTime::from_timestamp_millis(ms).ok_or(TurnError::Timestamp(ms)))
            .transpose()?;

        Ok(Self {
            role: raw.role,
            content: raw.content,
            timestamp,
            sender: raw.sender,
            images,
        })
    }
}

/// Ordered turns for one channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript(Vec<Turn>);

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.0.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl From<Vec<Turn>> for Transcript {
    fn from(turns: Vec<Turn>) -> Self {
        Self(turns)
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Current instant at the precision the wire format keeps
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
