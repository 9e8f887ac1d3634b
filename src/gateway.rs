//! Gateway: channel events in, replies out
//!
//! Every user gets a worker task fed by an unbounded queue, so one user's
//! messages are handled strictly in arrival order while different users run
//! in parallel. Workers retire after a quiet period and are respawned on the
//! next message.
//!
//! Each queued message carries a cancellation token. It is cancelled when the
//! chat is reported gone, when the message becomes older than the staleness
//! limit, or on shutdown; the orchestrator then abandons the exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::channels::{AudioAttachment, Channel, ChannelEvent, IncomingMessage, MessageBody};
use crate::exchange::{ExchangeOrchestrator, ExchangeOutcome, InboundMessage};

/// Gateway timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Messages older than this are dropped or cancelled
    pub stale_after: Duration,
    /// A worker with nothing to do for this long shuts down
    pub worker_idle: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            worker_idle: Duration::from_secs(60),
        }
    }
}

/// Bot commands recognized in text messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Forget the conversation history
    ClearHistory,
}

impl Command {
    /// Recognize a command in a text message
    ///
    /// Accepts `/reset` and `/clear` (optionally addressed `@bot`) and the
    /// phrases "clear history" and "borrar historial", ignoring case and
    /// trailing punctuation.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let normalized = text
            .trim()
            .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?'))
            .to_lowercase();

        let slash = normalized
            .strip_prefix('/')
            .map(|cmd| cmd.split('@').next().unwrap_or_default());

        match (slash, normalized.as_str()) {
            (Some("reset" | "clear"), _) | (None, "clear history" | "borrar historial") => {
                Some(Self::ClearHistory)
            }
            _ => None,
        }
    }
}

struct Job {
    id: u64,
    message: IncomingMessage,
    cancel: CancellationToken,
}

struct Shared {
    channel: Arc<dyn Channel>,
    orchestrator: Arc<ExchangeOrchestrator>,
    settings: GatewaySettings,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    /// Queued and running jobs: id -> (chat, token)
    pending: Mutex<HashMap<u64, (String, CancellationToken)>>,
    next_job: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes channel events to per-user workers
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    /// Create a gateway; cancelling `shutdown` cancels every exchange
    #[must_use]
    pub fn new(
        channel: Arc<dyn Channel>,
        orchestrator: Arc<ExchangeOrchestrator>,
        settings: GatewaySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                orchestrator,
                settings,
                shutdown,
                workers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_job: AtomicU64::new(0),
            }),
        }
    }

    /// Consume events until shutdown or until the channel closes
    ///
    /// # Errors
    ///
    /// Currently infallible; reserved for channel-level failures
    pub async fn run(&self, mut events: mpsc::Receiver<ChannelEvent>) -> Result<()> {
        tracing::info!(channel = self.shared.channel.name(), "gateway running");

        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::info!("event stream closed");
                        break;
                    }
                }
            }
        }

        locked(&self.shared.workers).clear();
        Ok(())
    }

    /// Route one event
    pub fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.dispatch(message),
            ChannelEvent::ChatGone { chat_id } => self.cancel_chat(&chat_id),
        }
    }

    /// Number of live user workers
    #[must_use]
    pub fn active_workers(&self) -> usize {
        locked(&self.shared.workers).len()
    }

    fn dispatch(&self, message: IncomingMessage) {
        let id = self.shared.next_job.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shared.shutdown.child_token();
        locked(&self.shared.pending).insert(id, (message.chat_id.clone(), cancel.clone()));

        let user_id = message.sender_id.clone();
        let job = Job {
            id,
            message,
            cancel,
        };

        // Sends happen under the map lock so a retiring worker cannot miss one
        let mut workers = locked(&self.shared.workers);
        let job = match workers.get(&user_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            tracing::error!(user_id, "fresh worker queue rejected a job");
            return;
        }
        workers.insert(user_id.clone(), tx);
        drop(workers);

        tracing::debug!(user_id, "worker started");
        tokio::spawn(worker(Arc::clone(&self.shared), user_id, rx));
    }

    fn cancel_chat(&self, chat_id: &str) {
        let pending = locked(&self.shared.pending);
        let mut cancelled = 0_usize;
        for (chat, token) in pending.values() {
            if chat == chat_id {
                token.cancel();
                cancelled += 1;
            }
        }
        tracing::info!(chat_id, cancelled, "chat gone, cancelling its exchanges");
    }
}

async fn worker(shared: Arc<Shared>, user_id: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    loop {
        let job = match tokio::time::timeout(shared.settings.worker_idle, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                let mut workers = locked(&shared.workers);
                if let Ok(job) = rx.try_recv() {
                    drop(workers);
                    job
                } else {
                    workers.remove(&user_id);
                    tracing::debug!(user_id, "worker idle, retiring");
                    break;
                }
            }
        };

        let id = job.id;
        shared.process(job).await;
        locked(&shared.pending).remove(&id);
    }
}

impl Shared {
    async fn process(&self, job: Job) {
        let Job {
            message, cancel, ..
        } = job;
        let replies = &self.orchestrator.dialogue().persona().replies;

        if cancel.is_cancelled() {
            return;
        }

        if message.text().and_then(Command::parse) == Some(Command::ClearHistory) {
            self.orchestrator.dialogue().clear(&message.sender_id).await;
            self.notify(&message.chat_id, &replies.history_cleared).await;
            return;
        }

        let age = (Utc::now() - message.sent_at).to_std().unwrap_or_default();
        let Some(remaining) = self.settings.stale_after.checked_sub(age) else {
            tracing::info!(
                user_id = %message.sender_id,
                age_secs = age.as_secs(),
                "dropping stale message"
            );
            return;
        };

        let input = match &message.body {
            MessageBody::Text(text) => InboundMessage::Text(text.clone()),
            MessageBody::Audio(attachment) => {
                match self.fetch_voice(&message.chat_id, attachment, &cancel).await {
                    Some(input) => input,
                    None => return,
                }
            }
        };

        if let Err(e) = self.channel.send_typing(&message.chat_id).await {
            tracing::debug!(error = %e, "typing indicator failed");
        }

        let run = self.orchestrator.run(&message.sender_id, input, &cancel);
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            () = tokio::time::sleep(remaining) => {
                tracing::info!(user_id = %message.sender_id, "message went stale, cancelling");
                cancel.cancel();
                run.await
            }
        };

        match outcome {
            ExchangeOutcome::Reply(bundle) => {
                if let Err(e) = self.channel.deliver(&message.chat_id, &bundle).await {
                    tracing::error!(chat_id = %message.chat_id, error = %e, "reply delivery failed");
                }
            }
            ExchangeOutcome::DecodeFailed { notice, .. } => {
                self.notify(&message.chat_id, &notice).await;
            }
            ExchangeOutcome::Abandoned => {}
        }
    }

    async fn fetch_voice(
        &self,
        chat_id: &str,
        attachment: &AudioAttachment,
        cancel: &CancellationToken,
    ) -> Option<InboundMessage> {
        let replies = &self.orchestrator.dialogue().persona().replies;

        let Some(format) = attachment.format() else {
            tracing::info!(mime = %attachment.mime_type, "unsupported audio type");
            self.notify(chat_id, &replies.decode_error).await;
            return None;
        };

        let max = self.orchestrator.max_input_duration();
        if attachment
            .duration_secs
            .is_some_and(|secs| Duration::from_secs(u64::from(secs)) > max)
        {
            self.notify(chat_id, &replies.too_long).await;
            return None;
        }

        let downloaded = tokio::select! {
            () = cancel.cancelled() => return None,
            result = self.channel.download(attachment) => result,
        };

        match downloaded {
            Ok(bytes) => Some(InboundMessage::Voice { bytes, format }),
            Err(e) => {
                tracing::warn!(error = %e, "voice download failed");
                self.notify(chat_id, &replies.decode_error).await;
                None
            }
        }
    }

    async fn notify(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.channel.notify(chat_id, text).await {
            tracing::error!(chat_id, error = %e, "notice delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_commands() {
        for text in [
            "clear history",
            "Clear History!",
            "  borrar historial. ",
            "/reset",
            "/reset@charla_bot",
            "/clear",
        ] {
            assert_eq!(Command::parse(text), Some(Command::ClearHistory), "{text}");
        }
    }

    #[test]
    fn test_ordinary_text_is_not_a_command() {
        for text in ["hola", "please clear history now", "/start", "reset"] {
            assert_eq!(Command::parse(text), None, "{text}");
        }
    }
}
