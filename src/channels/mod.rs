//! Messaging channel adapters
//!
//! A channel turns a messaging platform into a stream of [`ChannelEvent`]s
//! and delivers [`ReplyBundle`]s back to chats.

mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use telegram::{PollBatch, TelegramChannel, UpdateDedup, parse_updates};

use crate::Result;
use crate::audio::AudioFormat;
use crate::exchange::ReplyBundle;

/// Reference to audio attached to a message, fetched on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAttachment {
    /// Platform file identifier
    pub file_id: String,
    /// MIME type as reported by the platform
    pub mime_type: String,
    /// Duration reported by the platform, if any
    pub duration_secs: Option<u32>,
}

impl AudioAttachment {
    /// Format descriptor for the attachment's MIME type
    #[must_use]
    pub fn format(&self) -> Option<AudioFormat> {
        AudioFormat::from_mime(&self.mime_type)
    }
}

/// What a message carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Typed text
    Text(String),
    /// Voice note or audio file
    Audio(AudioAttachment),
}

/// A message from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Message identifier (platform-specific)
    pub id: String,

    /// Chat the reply goes to
    pub chat_id: String,

    /// Sender identifier; conversations are keyed by it
    pub sender_id: String,

    /// Sender display name
    pub sender_name: String,

    /// When the platform says the message was sent
    pub sent_at: DateTime<Utc>,

    /// Message content
    pub body: MessageBody,
}

impl IncomingMessage {
    /// Text content, if this is a text message
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            MessageBody::Audio(_) => None,
        }
    }
}

/// Something a channel observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A user sent a message
    Message(IncomingMessage),
    /// The chat can no longer be written to (user blocked the bot, left)
    ChatGone {
        /// Affected chat
        chat_id: String,
    },
}

/// Trait for messaging channel adapters
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &'static str;

    /// Connect to the channel
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the channel
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Fetch the bytes of an audio attachment
    async fn download(&self, attachment: &AudioAttachment) -> Result<Vec<u8>>;

    /// Send a reply bundle: the text, then the audio if any
    async fn deliver(&self, chat_id: &str, bundle: &ReplyBundle) -> Result<()>;

    /// Send a plain text notice
    async fn notify(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Show that a reply is being prepared
    ///
    /// Default implementation is a no-op for channels that don't support it
    async fn send_typing(&self, _chat_id: &str) -> Result<()> {
        Ok(())
    }
}
