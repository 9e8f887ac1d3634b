//! Telegram channel adapter
//!
//! Long-polls `getUpdates` for messages and uses the Bot API for sending

mod dedup;
mod polling;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AudioAttachment, Channel, ChannelEvent};
use crate::audio::AudioFormat;
use crate::exchange::ReplyBundle;
use crate::{Error, Result};

pub use dedup::UpdateDedup;
pub use polling::{PollBatch, parse_updates};
use types::{
    API_BASE, FILE_BASE, GetFileRequest, SendChatActionRequest, SendMessageRequest, TelegramFile,
    TelegramResponse,
};

/// Longest text Telegram accepts in one message
const MAX_MESSAGE_CHARS: usize = 4096;

/// Bot API download limit
const MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// Telegram channel adapter
#[derive(Clone)]
pub struct TelegramChannel {
    token: SecretString,
    client: Client,
    event_tx: Option<mpsc::Sender<ChannelEvent>>,
    connected: bool,
}

impl TelegramChannel {
    /// Create a new Telegram channel adapter
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            client: crate::http::client_with_timeout(Duration::from_secs(
                polling::LONG_POLL_SECS + 15,
            )),
            event_tx: None,
            connected: false,
        }
    }

    /// Create with an event receiver for polling mode
    ///
    /// Returns the channel and a receiver for incoming events
    #[must_use]
    pub fn with_receiver(token: SecretString) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let mut channel = Self::new(token);
        channel.event_tx = Some(tx);
        (channel, rx)
    }

    /// Spawn a background task that long-polls Telegram's getUpdates API
    ///
    /// The task stops when `shutdown` is cancelled or the receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the channel was not created with [`Self::with_receiver`]
    pub fn start_polling(&self, shutdown: CancellationToken) -> Result<tokio::task::JoinHandle<()>> {
        let tx = self.event_tx.clone().ok_or_else(|| {
            Error::Channel("polling requires an event sender (use with_receiver)".to_string())
        })?;

        Ok(tokio::spawn(polling::poll_updates(
            self.client.clone(),
            self.token.clone(),
            tx,
            shutdown,
        )))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}{}/{method}", self.token.expose_secret())
    }

    /// Send a text message, split at Telegram's length limit
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let response = self
                .client
                .post(self.method_url("sendMessage"))
                .json(&SendMessageRequest {
                    chat_id,
                    text: chunk,
                })
                .send()
                .await
                .map_err(|e| Error::Channel(format!("Telegram API error: {}", e.without_url())))?;

            check_response(response, "sendMessage").await?;
        }

        tracing::debug!(chat_id, "Telegram message sent");
        Ok(())
    }

    /// Upload reply audio
    ///
    /// Ogg/Opus and MP3 go out as voice notes; WAV and raw PCM as audio files.
    ///
    /// # Errors
    ///
    /// Returns error if the API request fails
    pub async fn send_audio(&self, chat_id: i64, audio: Vec<u8>, format: AudioFormat) -> Result<()> {
        let (method, field) = match format {
            AudioFormat::OggOpus | AudioFormat::Mp3 => ("sendVoice", "voice"),
            AudioFormat::Wav | AudioFormat::Pcm16 { .. } => ("sendAudio", "audio"),
        };

        let part = Part::bytes(audio)
            .file_name(format.file_name())
            .mime_str(&format.mime_type())
            .map_err(|e| Error::Channel(format!("invalid audio MIME type: {e}")))?;

        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, part);

        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram {method} error: {}", e.without_url())))?;

        check_response(response, method).await?;
        tracing::debug!(chat_id, method, "Telegram audio sent");
        Ok(())
    }

    /// Download a file from Telegram by `file_id`.
    ///
    /// Calls `getFile` to get the file path, then downloads from
    /// `https://api.telegram.org/file/bot{token}/{file_path}`.
    ///
    /// # Errors
    ///
    /// Returns error if the API request or download fails, or the file is
    /// larger than the Bot API allows
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.method_url("getFile"))
            .json(&GetFileRequest { file_id })
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram getFile error: {}", e.without_url())))?;

        let body = response.text().await.map_err(|e| {
            Error::Channel(format!("Telegram getFile response read error: {}", e.without_url()))
        })?;

        let parsed: TelegramResponse<TelegramFile> = serde_json::from_str(&body)?;
        let file = parsed.result.ok_or_else(|| {
            Error::Channel(format!(
                "Telegram getFile error: {}",
                parsed.description.unwrap_or_default()
            ))
        })?;

        if file.file_size.is_some_and(|size| size > MAX_DOWNLOAD_BYTES) {
            return Err(Error::Channel(format!(
                "Telegram file too large: {} bytes",
                file.file_size.unwrap_or_default()
            )));
        }

        let file_path = file
            .file_path
            .ok_or_else(|| Error::Channel("Telegram getFile returned no file_path".to_string()))?;

        let download_url = format!("{FILE_BASE}{}/{file_path}", self.token.expose_secret());
        let data = self
            .client
            .get(&download_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Channel(format!("Telegram file download error: {}", e.without_url())))?
            .bytes()
            .await
            .map_err(|e| {
                Error::Channel(format!("Telegram file download read error: {}", e.without_url()))
            })?;

        tracing::debug!(bytes = data.len(), "Telegram file downloaded");
        Ok(data.to_vec())
    }
}

async fn check_response(response: reqwest::Response, method: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    let description = serde_json::from_str::<TelegramResponse<serde_json::Value>>(&body)
        .ok()
        .and_then(|r| r.description)
        .unwrap_or(body);

    Err(Error::Channel(format!(
        "Telegram {method} error: {status} - {description}"
    )))
}

fn parse_chat_id(chat_id: &str) -> Result<i64> {
    chat_id
        .parse()
        .map_err(|_| Error::Channel(format!("invalid Telegram chat ID: {chat_id}")))
}

/// Split `text` into pieces of at most `max_chars`, preferring line breaks
fn split_message(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        let cut = rest[..limit]
            .rfind('\n')
            .or_else(|| rest[..limit].rfind(' '))
            .filter(|&idx| idx > 0)
            .unwrap_or(limit);

        chunks.push(&rest[..cut]);
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn connect(&mut self) -> Result<()> {
        // Polling needs no session, so "connect" just validates the token
        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram getMe error: {}", e.without_url())))?;

        if !response.status().is_success() {
            return Err(Error::Channel("Invalid Telegram bot token".to_string()));
        }

        self.connected = true;
        tracing::info!("Telegram channel connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        tracing::info!("Telegram channel disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn download(&self, attachment: &AudioAttachment) -> Result<Vec<u8>> {
        self.download_file(&attachment.file_id).await
    }

    async fn deliver(&self, chat_id: &str, bundle: &ReplyBundle) -> Result<()> {
        let chat_id = parse_chat_id(chat_id)?;
        self.send_message(chat_id, &bundle.text).await?;

        if let Some(audio) = &bundle.audio {
            self.send_audio(chat_id, audio.clone(), bundle.format).await?;
        }
        Ok(())
    }

    async fn notify(&self, chat_id: &str, text: &str) -> Result<()> {
        self.send_message(parse_chat_id(chat_id)?, text).await
    }

    async fn send_typing(&self, chat_id: &str) -> Result<()> {
        let request = SendChatActionRequest {
            chat_id: parse_chat_id(chat_id)?,
            action: "typing",
        };

        let response = self
            .client
            .post(self.method_url("sendChatAction"))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("Telegram sendChatAction error: {}", e.without_url())))?;

        check_response(response, "sendChatAction").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_one_chunk() {
        assert_eq!(split_message("hola", 10), vec!["hola"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn test_long_message_splits_on_whitespace() {
        let chunks = split_message("uno dos tres cuatro", 8);
        assert_eq!(chunks, vec!["uno dos", "tres", "cuatro"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 8));
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let text = "ñññññ";
        assert_eq!(split_message(text, 5), vec![text]);
        assert_eq!(split_message(text, 2), vec!["ññ", "ññ", "ñ"]);
    }

    #[test]
    fn test_invalid_chat_id() {
        assert!(parse_chat_id("abc").is_err());
        assert_eq!(parse_chat_id("-100").unwrap(), -100);
    }
}
