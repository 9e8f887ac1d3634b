//! Exchange orchestrator
//!
//! Runs one inbound message through decode, transcription, dialogue and
//! synthesis, and turns every component failure into a reply the learner can
//! read. Only an inbound decode failure ends an exchange without a
//! [`ReplyBundle`], and even then an explicit notice is produced.
//!
//! ```text
//! Voice ─▶ decode ─▶ transcribe ─┐
//!                                ├─▶ respond ─▶ synthesize ─▶ encode ─▶ ReplyBundle
//! Text ──────────────────────────┘
//! ```

use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audio::{AudioCodec, AudioFormat, CodecError};
use crate::dialogue::{DialogueEngine, DialogueError};
use crate::voice::{SynthesisClient, TranscriptionClient, TranscriptionError, VoiceProfile};

/// A message as received from the messaging client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Typed text
    Text(String),
    /// Recorded audio in the client's native container
    Voice {
        /// Encoded audio
        bytes: Vec<u8>,
        /// Encoding of `bytes`
        format: AudioFormat,
    },
}

impl InboundMessage {
    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Voice { .. } => "voice",
        }
    }
}

/// How an exchange that produced a reply went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Text and audio
    Complete,
    /// Text only; synthesis or encoding failed
    Degraded,
    /// Speech was not understood; the learner is asked to repeat
    Clarification,
    /// A service failed before a reply could be produced
    Apology,
    /// The model refused the content; an in-persona deflection is sent
    Deflected,
}

impl ExchangeStatus {
    /// Lowercase name as used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Degraded => "degraded",
            Self::Clarification => "clarification",
            Self::Apology => "apology",
            Self::Deflected => "deflected",
        }
    }
}

/// What is handed back to the messaging client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBundle {
    /// Reply text, always present
    pub text: String,
    /// Encoded reply audio
    pub audio: Option<Vec<u8>>,
    /// Encoding of `audio`
    pub format: AudioFormat,
    /// How the exchange went
    pub status: ExchangeStatus,
}

impl ReplyBundle {
    fn text_only(text: impl Into<String>, format: AudioFormat, status: ExchangeStatus) -> Self {
        Self {
            text: text.into(),
            audio: None,
            format,
            status,
        }
    }

    /// Whether audio is attached
    #[must_use]
    pub const fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Result of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// A reply was produced
    Reply(ReplyBundle),
    /// The inbound audio could not be decoded
    DecodeFailed {
        /// User-facing explanation
        notice: String,
        /// What went wrong
        error: CodecError,
    },
    /// The exchange was cancelled; nothing should be delivered
    Abandoned,
}

/// Sequences the pipeline for one message
pub struct ExchangeOrchestrator {
    codec: AudioCodec,
    transcription: TranscriptionClient,
    dialogue: DialogueEngine,
    synthesis: SynthesisClient,
    voice: VoiceProfile,
    delivery_format: AudioFormat,
    language_hint: String,
}

/// Await `fut` unless `cancel` fires first
async fn unless_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

impl ExchangeOrchestrator {
    /// Assemble an orchestrator
    #[must_use]
    pub fn new(
        codec: AudioCodec,
        transcription: TranscriptionClient,
        dialogue: DialogueEngine,
        synthesis: SynthesisClient,
        voice: VoiceProfile,
    ) -> Self {
        Self {
            codec,
            transcription,
            dialogue,
            synthesis,
            voice,
            delivery_format: AudioFormat::Wav,
            language_hint: "es".to_string(),
        }
    }

    /// Set the encoding of reply audio
    #[must_use]
    pub const fn with_delivery_format(mut self, format: AudioFormat) -> Self {
        self.delivery_format = format;
        self
    }

    /// Set the language hint passed to transcription
    #[must_use]
    pub fn with_language_hint(mut self, language: impl Into<String>) -> Self {
        self.language_hint = language.into();
        self
    }

    /// Dialogue engine (history commands)
    #[must_use]
    pub const fn dialogue(&self) -> &DialogueEngine {
        &self.dialogue
    }

    /// Encoding of reply audio
    #[must_use]
    pub const fn delivery_format(&self) -> AudioFormat {
        self.delivery_format
    }

    /// Longest inbound audio accepted
    #[must_use]
    pub const fn max_input_duration(&self) -> std::time::Duration {
        self.codec.max_duration()
    }

    /// Run one exchange for `user_id`
    ///
    /// Exchanges for the same user are serialized in call order; the user's
    /// conversation stays locked until this returns. Cancelling `cancel` makes
    /// the exchange return [`ExchangeOutcome::Abandoned`] at the next network
    /// step, discarding partial results.
    pub async fn run(
        &self,
        user_id: &str,
        message: InboundMessage,
        cancel: &CancellationToken,
    ) -> ExchangeOutcome {
        let span = tracing::info_span!(
            "exchange",
            exchange_id = %uuid::Uuid::new_v4(),
            user_id,
            input = message.kind(),
        );

        async move {
            let started = Instant::now();
            let outcome = self.run_inner(user_id, message, cancel).await;

            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match &outcome {
                ExchangeOutcome::Reply(bundle) => tracing::info!(
                    status = bundle.status.as_str(),
                    audio = bundle.has_audio(),
                    elapsed_ms,
                    "exchange finished"
                ),
                ExchangeOutcome::DecodeFailed { error, .. } => tracing::warn!(
                    kind = %error.kind(),
                    error = %error,
                    elapsed_ms,
                    "inbound audio rejected"
                ),
                ExchangeOutcome::Abandoned => tracing::info!(elapsed_ms, "exchange abandoned"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        user_id: &str,
        message: InboundMessage,
        cancel: &CancellationToken,
    ) -> ExchangeOutcome {
        let replies = &self.dialogue.persona().replies;
        let format = self.delivery_format;

        let Some(mut session) = unless_cancelled(cancel, self.dialogue.session(user_id)).await
        else {
            return ExchangeOutcome::Abandoned;
        };

        let text = match message {
            InboundMessage::Text(text) => text,
            InboundMessage::Voice { bytes, format: source } => {
                let waveform = match self.codec.decode(&bytes, source) {
                    Ok(waveform) => waveform,
                    Err(error) => {
                        let notice = match error {
                            CodecError::InputTooLarge { .. } => replies.too_long.clone(),
                            _ => replies.decode_error.clone(),
                        };
                        return ExchangeOutcome::DecodeFailed { notice, error };
                    }
                };
                tracing::debug!(
                    source = %source,
                    duration_ms = u64::try_from(waveform.duration().as_millis()).unwrap_or(u64::MAX),
                    "inbound audio decoded"
                );

                let transcribed = unless_cancelled(
                    cancel,
                    self.transcription.transcribe(&waveform, &self.language_hint),
                )
                .await;

                match transcribed {
                    None => return ExchangeOutcome::Abandoned,
                    Some(Ok(result)) => result.text,
                    Some(Err(TranscriptionError::UnrecognizedSpeech)) => {
                        return ExchangeOutcome::Reply(ReplyBundle::text_only(
                            &replies.clarification,
                            format,
                            ExchangeStatus::Clarification,
                        ));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(kind = %e.kind(), error = %e, "transcription failed");
                        return ExchangeOutcome::Reply(ReplyBundle::text_only(
                            &replies.apology,
                            format,
                            ExchangeStatus::Apology,
                        ));
                    }
                }
            }
        };

        if text.trim().is_empty() {
            return ExchangeOutcome::Reply(ReplyBundle::text_only(
                &replies.clarification,
                format,
                ExchangeStatus::Clarification,
            ));
        }

        let reply = match unless_cancelled(cancel, session.respond(&text)).await {
            None => return ExchangeOutcome::Abandoned,
            Some(Ok(reply)) => reply,
            Some(Err(DialogueError::ContentPolicyRejection(reason))) => {
                tracing::info!(reason = %reason, "content rejected, deflecting");
                return ExchangeOutcome::Reply(ReplyBundle::text_only(
                    &replies.deflection,
                    format,
                    ExchangeStatus::Deflected,
                ));
            }
            Some(Err(_)) => {
                return ExchangeOutcome::Reply(ReplyBundle::text_only(
                    &replies.apology,
                    format,
                    ExchangeStatus::Apology,
                ));
            }
        };

        let synthesized = match unless_cancelled(
            cancel,
            self.synthesis.synthesize(&reply.text, &self.voice),
        )
        .await
        {
            None => {
                // The learner never hears this reply
                session.retract_reply();
                return ExchangeOutcome::Abandoned;
            }
            Some(result) => result,
        };

        let audio = synthesized
            .inspect_err(|e| {
                tracing::warn!(kind = %e.kind(), error = %e, "synthesis failed, replying text-only");
            })
            .ok()
            .and_then(|waveform| {
                self.codec
                    .encode(&waveform, format)
                    .inspect_err(|e| tracing::warn!(error = %e, "reply encoding failed"))
                    .ok()
            });

        let status = if audio.is_some() {
            ExchangeStatus::Complete
        } else {
            ExchangeStatus::Degraded
        };

        ExchangeOutcome::Reply(ReplyBundle {
            text: reply.text,
            audio,
            format,
            status,
        })
    }
}
