//! Telegram polling mode: getUpdates loop and update conversion

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryFutureExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dedup::UpdateDedup;
use super::types::{API_BASE, PollingMessage, PollingUpdate, TelegramResponse};
use crate::channels::{AudioAttachment, ChannelEvent, IncomingMessage, MessageBody};
use crate::{Error, Result};

/// Long-poll timeout passed to getUpdates, in seconds
pub(super) const LONG_POLL_SECS: u64 = 30;

/// Longest pause after repeated polling errors
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Events from one getUpdates response
#[derive(Debug, Default)]
pub struct PollBatch {
    /// New events, duplicates removed, in update order
    pub events: Vec<ChannelEvent>,
    /// Offset acknowledging every update in the response
    pub next_offset: Option<i64>,
}

/// Parse a getUpdates response body
///
/// # Errors
///
/// Returns error if the body is not a Telegram response or reports failure
pub fn parse_updates(body: &str, dedup: &mut UpdateDedup) -> Result<PollBatch> {
    let parsed: TelegramResponse<Vec<PollingUpdate>> = serde_json::from_str(body)?;
    if !parsed.ok {
        return Err(Error::Channel(format!(
            "Telegram getUpdates error: {}",
            parsed.description.unwrap_or_default()
        )));
    }

    let updates = parsed.result.unwrap_or_default();
    let next_offset = updates.iter().map(|u| u.update_id + 1).max();

    let events = updates
        .into_iter()
        .filter(|u| !dedup.is_duplicate(u.update_id))
        .filter_map(update_to_event)
        .collect();

    Ok(PollBatch {
        events,
        next_offset,
    })
}

/// Convert a polling update into a channel event
fn update_to_event(update: PollingUpdate) -> Option<ChannelEvent> {
    if let Some(member) = update.my_chat_member {
        return matches!(member.new_chat_member.status.as_str(), "kicked" | "left").then(|| {
            ChannelEvent::ChatGone {
                chat_id: member.chat.id.to_string(),
            }
        });
    }

    update.message.and_then(message_to_incoming).map(ChannelEvent::Message)
}

fn message_to_incoming(msg: PollingMessage) -> Option<IncomingMessage> {
    // Skip bot messages
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return None;
    }

    let body = if let Some(voice) = msg.voice {
        MessageBody::Audio(AudioAttachment {
            file_id: voice.file_id,
            mime_type: voice.mime_type.unwrap_or_else(|| "audio/ogg".to_string()),
            duration_secs: voice.duration,
        })
    } else if let Some(audio) = msg.audio {
        MessageBody::Audio(AudioAttachment {
            file_id: audio.file_id,
            mime_type: audio.mime_type.unwrap_or_else(|| "audio/mpeg".to_string()),
            duration_secs: audio.duration,
        })
    } else {
        // Photos, stickers and the like carry nothing to practice with
        MessageBody::Text(msg.text.filter(|t| !t.trim().is_empty())?)
    };

    let (sender_id, sender_name) = msg.from.map_or_else(
        || (msg.chat.id.to_string(), "Unknown".to_string()),
        |u| (u.id.to_string(), u.first_name),
    );

    Some(IncomingMessage {
        id: msg.message_id.to_string(),
        chat_id: msg.chat.id.to_string(),
        sender_id,
        sender_name,
        sent_at: DateTime::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
        body,
    })
}

/// Run the getUpdates loop until `shutdown` fires or the receiver is dropped
///
/// Deletes any existing webhook before starting to avoid conflicts.
pub(super) async fn poll_updates(
    client: Client,
    token: SecretString,
    tx: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
) {
    let base = format!("{API_BASE}{}", token.expose_secret());

    if let Err(e) = client.post(format!("{base}/deleteWebhook")).send().await {
        tracing::warn!(error = %e.without_url(), "failed to delete Telegram webhook before polling");
    }

    let mut offset: Option<i64> = None;
    let mut dedup = UpdateDedup::default();
    let mut backoff = Duration::from_secs(1);

    loop {
        let mut params = serde_json::json!({
            "timeout": LONG_POLL_SECS,
            "allowed_updates": ["message", "my_chat_member"],
        });
        if let Some(off) = offset {
            params["offset"] = serde_json::json!(off);
        }

        let request = client
            .post(format!("{base}/getUpdates"))
            .json(&params)
            .send()
            .and_then(reqwest::Response::text);

        let body = tokio::select! {
            () = shutdown.cancelled() => break,
            body = request => body,
        };

        let batch = body
            .map_err(|e| Error::Channel(format!("Telegram getUpdates error: {}", e.without_url())))
            .and_then(|body| parse_updates(&body, &mut dedup));

        match batch {
            Ok(batch) => {
                backoff = Duration::from_secs(1);
                if batch.next_offset.is_some() {
                    offset = batch.next_offset;
                }
                for event in batch.events {
                    if tx.send(event).await.is_err() {
                        tracing::info!("event receiver dropped, stopping Telegram polling");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, ?backoff, "Telegram polling failed");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
            }
        }
    }

    tracing::info!("Telegram polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_response_is_error() {
        let mut dedup = UpdateDedup::default();
        let body = r#"{"ok": false, "description": "Unauthorized"}"#;
        let err = parse_updates(body, &mut dedup).unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[test]
    fn test_empty_batch_keeps_offset() {
        let mut dedup = UpdateDedup::default();
        let batch = parse_updates(r#"{"ok": true, "result": []}"#, &mut dedup).unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.next_offset, None);
    }

    #[test]
    fn test_member_status_change() {
        let mut dedup = UpdateDedup::default();
        let body = r#"{"ok": true, "result": [
            {"update_id": 5, "my_chat_member": {"chat": {"id": 42}, "new_chat_member": {"status": "kicked"}}},
            {"update_id": 6, "my_chat_member": {"chat": {"id": 43}, "new_chat_member": {"status": "member"}}}
        ]}"#;
        let batch = parse_updates(body, &mut dedup).unwrap();
        assert_eq!(
            batch.events,
            vec![ChannelEvent::ChatGone {
                chat_id: "42".to_string()
            }]
        );
        assert_eq!(batch.next_offset, Some(7));
    }
}
