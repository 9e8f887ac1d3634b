//! Telegram Bot API request/response types

use serde::{Deserialize, Serialize};

/// Telegram Bot API base URL
pub(super) const API_BASE: &str = "https://api.telegram.org/bot";

/// Telegram file download base URL
pub(super) const FILE_BASE: &str = "https://api.telegram.org/file/bot";

/// Telegram sendMessage request
#[derive(Serialize)]
pub(super) struct SendMessageRequest<'a> {
    pub chat_id: i64,
    pub text: &'a str,
}

/// Telegram sendChatAction request
#[derive(Serialize)]
pub(super) struct SendChatActionRequest {
    pub chat_id: i64,
    pub action: &'static str,
}

/// Telegram getFile request
#[derive(Serialize)]
pub(super) struct GetFileRequest<'a> {
    pub file_id: &'a str,
}

/// File metadata from Telegram getFile response
#[derive(Debug, Deserialize)]
pub(super) struct TelegramFile {
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
}

/// Telegram API response wrapper
#[derive(Debug, Deserialize)]
pub(super) struct TelegramResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
}

/// A single update from getUpdates
#[derive(Debug, Deserialize)]
pub(super) struct PollingUpdate {
    pub update_id: i64,
    pub message: Option<PollingMessage>,
    pub my_chat_member: Option<ChatMemberUpdated>,
}

/// Message from a polling update
#[derive(Debug, Deserialize)]
pub(super) struct PollingMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: PollingChat,
    pub from: Option<PollingUser>,
    pub text: Option<String>,
    pub voice: Option<PollingVoice>,
    pub audio: Option<PollingAudio>,
}

/// Voice note (Ogg/Opus)
#[derive(Debug, Deserialize)]
pub(super) struct PollingVoice {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub duration: Option<u32>,
}

/// Audio file sent as music
#[derive(Debug, Deserialize)]
pub(super) struct PollingAudio {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub duration: Option<u32>,
}

/// Chat info from polling
#[derive(Debug, Deserialize)]
pub(super) struct PollingChat {
    pub id: i64,
}

/// User info from polling
#[derive(Debug, Deserialize)]
pub(super) struct PollingUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
}

/// The bot's membership in a chat changed
#[derive(Debug, Deserialize)]
pub(super) struct ChatMemberUpdated {
    pub chat: PollingChat,
    pub new_chat_member: ChatMember,
}

/// Membership status
#[derive(Debug, Deserialize)]
pub(super) struct ChatMember {
    pub status: String,
}
