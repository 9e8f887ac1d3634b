//! Speech-to-text (STT) processing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::audio::{AudioCodec, AudioFormat, CodecError, SPEECH_SAMPLE_RATE, Waveform};
use crate::http::{self, HttpFailure};
use crate::retry::{RetryPolicy, RetryableError};
use crate::{Error, FailureKind, Result};

/// Failures of the transcription step
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranscriptionError {
    /// Service unreachable or overloaded
    #[error("transcription service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No answer within the attempt timeout
    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),

    /// Nothing intelligible was heard
    #[error("speech not recognized")]
    UnrecognizedSpeech,

    /// The service refused the request (credentials, payload)
    #[error("transcription request rejected: {0}")]
    Rejected(String),

    /// The waveform could not be prepared for upload
    #[error("transcription input: {0}")]
    Audio(#[from] CodecError),
}

impl TranscriptionError {
    /// Failure classification used by the orchestrator
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::ServiceUnavailable(_) | Self::Timeout(_) => FailureKind::TransientServiceFailure,
            Self::Rejected(_) => FailureKind::ServiceRejection,
            Self::UnrecognizedSpeech => FailureKind::UnsupportedInput,
            Self::Audio(e) => e.kind(),
        }
    }
}

impl RetryableError for TranscriptionError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<HttpFailure> for TranscriptionError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Unavailable(msg) => Self::ServiceUnavailable(msg),
            HttpFailure::TimedOut(after) => Self::Timeout(after),
            HttpFailure::Rejected { status, body } => Self::Rejected(format!("{status}: {body}")),
        }
    }
}

/// Recognized text with a confidence in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    /// Recognized text, trimmed
    pub text: String,
    /// Service confidence, clamped to `[0, 1]`
    pub confidence: f32,
}

/// A speech-to-text service
///
/// Implementations receive 16 kHz mono WAV bytes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Recognize speech in `wav`
    async fn transcribe(
        &self,
        wav: &[u8],
        language: &str,
    ) -> std::result::Result<TranscriptionResult, TranscriptionError>;
}

/// Response from `OpenAI` Whisper with `response_format=verbose_json`
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(serde::Deserialize)]
struct WhisperSegment {
    avg_logprob: f32,
    no_speech_prob: f32,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Parse a Whisper `verbose_json` body
///
/// Confidence is the mean over segments of `exp(avg_logprob)` weighted by the
/// probability that the segment holds speech. Without segments, any text counts
/// as fully confident.
///
/// # Errors
///
/// Returns `ServiceUnavailable` if the body is not a Whisper response
pub fn parse_whisper_response(
    body: &str,
) -> std::result::Result<TranscriptionResult, TranscriptionError> {
    let response: WhisperResponse = serde_json::from_str(body).map_err(|e| {
        TranscriptionError::ServiceUnavailable(format!("invalid Whisper response: {e}"))
    })?;

    let text = response.text.trim().to_string();
    let confidence = if response.segments.is_empty() {
        if text.is_empty() { 0.0 } else { 1.0 }
    } else {
        let total: f32 = response
            .segments
            .iter()
            .map(|s| s.avg_logprob.exp() * (1.0 - s.no_speech_prob))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let count = response.segments.len() as f32;
        total / count
    };

    Ok(TranscriptionResult {
        text,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// Parse a Deepgram `listen` body, using the first channel's best alternative
///
/// # Errors
///
/// Returns `ServiceUnavailable` if the body is not a Deepgram response
pub fn parse_deepgram_response(
    body: &str,
) -> std::result::Result<TranscriptionResult, TranscriptionError> {
    let response: DeepgramResponse = serde_json::from_str(body).map_err(|e| {
        TranscriptionError::ServiceUnavailable(format!("invalid Deepgram response: {e}"))
    })?;

    let result = response
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|c| c.alternatives.into_iter().next())
        .map_or(
            TranscriptionResult {
                text: String::new(),
                confidence: 0.0,
            },
            |a| TranscriptionResult {
                text: a.transcript.trim().to_string(),
                confidence: a.confidence.clamp(0.0, 1.0),
            },
        );

    Ok(result)
}

/// `OpenAI` Whisper backend
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl WhisperTranscriber {
    /// Create a Whisper backend
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for Whisper".to_string()));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            timeout,
        })
    }

    /// Point at a different OpenAI-compatible API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(
        &self,
        wav: &[u8],
        language: &str,
    ) -> std::result::Result<TranscriptionResult, TranscriptionError> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let file = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Rejected(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", language.to_string())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                http::classify_error(&e, self.timeout)
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        if !status.is_success() {
            tracing::error!(status = %status, "Whisper API error");
            return Err(http::classify_status(status, &body).into());
        }

        parse_whisper_response(&body)
    }
}

/// Deepgram backend
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl DeepgramTranscriber {
    /// Create a Deepgram backend
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
            model,
            base_url: "https://api.deepgram.com/v1".to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn transcribe(
        &self,
        wav: &[u8],
        language: &str,
    ) -> std::result::Result<TranscriptionResult, TranscriptionError> {
        tracing::debug!(audio_bytes = wav.len(), "starting Deepgram transcription");

        let response = self
            .client
            .post(format!("{}/listen", self.base_url))
            .query(&[
                ("model", self.model.as_str()),
                ("language", language),
                ("punctuate", "true"),
            ])
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", "audio/wav")
            .body(wav.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                http::classify_error(&e, self.timeout)
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        if !status.is_success() {
            tracing::error!(status = %status, "Deepgram API error");
            return Err(http::classify_status(status, &body).into());
        }

        parse_deepgram_response(&body)
    }
}

/// Transcription with retry and a confidence floor
pub struct TranscriptionClient {
    backend: Arc<dyn Transcriber>,
    policy: RetryPolicy,
    min_confidence: f32,
}

impl TranscriptionClient {
    /// Default confidence below which speech counts as unrecognized
    pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

    /// Wrap a backend with the default policy and confidence floor
    #[must_use]
    pub fn new(backend: Arc<dyn Transcriber>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            min_confidence: Self::DEFAULT_MIN_CONFIDENCE,
        }
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the confidence floor
    #[must_use]
    pub const fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Backend name
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Recognize speech in `waveform`
    ///
    /// The waveform is conformed to 16 kHz mono and uploaded as WAV once;
    /// retries reuse the same payload.
    ///
    /// # Errors
    ///
    /// - `ServiceUnavailable` / `Timeout` after the retry policy is exhausted
    /// - `UnrecognizedSpeech` for empty text or confidence below the floor
    ///   (never retried)
    /// - `Rejected` when the service refuses the request
    pub async fn transcribe(
        &self,
        waveform: &Waveform,
        language_hint: &str,
    ) -> std::result::Result<TranscriptionResult, TranscriptionError> {
        if waveform.is_empty() {
            return Err(TranscriptionError::UnrecognizedSpeech);
        }

        let speech = waveform.conform(SPEECH_SAMPLE_RATE, 1)?;
        let wav = AudioCodec::default().encode(&speech, AudioFormat::Wav)?;

        let result = self
            .policy
            .run("transcription", || self.backend.transcribe(&wav, language_hint))
            .await?;

        if result.text.is_empty() || result.confidence < self.min_confidence {
            tracing::info!(
                backend = self.backend.name(),
                confidence = result.confidence,
                chars = result.text.len(),
                "speech not recognized"
            );
            return Err(TranscriptionError::UnrecognizedSpeech);
        }

        tracing::info!(
            backend = self.backend.name(),
            confidence = result.confidence,
            "transcription complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_whisper_confidence_from_segments() {
        let body = r#"{
            "text": " Hola, ¿qué tal? ",
            "segments": [
                {"avg_logprob": 0.0, "no_speech_prob": 0.0},
                {"avg_logprob": 0.0, "no_speech_prob": 0.5}
            ]
        }"#;
        let result = parse_whisper_response(body).unwrap();
        assert_eq!(result.text, "Hola, ¿qué tal?");
        assert!((result.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_whisper_without_segments() {
        let result = parse_whisper_response(r#"{"text": "hola"}"#).unwrap();
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);

        let result = parse_whisper_response(r#"{"text": "  "}"#).unwrap();
        assert!(result.text.is_empty());
        assert!(result.confidence.abs() < f32::EPSILON);
    }

    #[test]
    fn test_deepgram_first_alternative() {
        let body = r#"{"results": {"channels": [{"alternatives": [
            {"transcript": "buenos días", "confidence": 0.93},
            {"transcript": "buenas días", "confidence": 0.41}
        ]}]}}"#;
        let result = parse_deepgram_response(body).unwrap();
        assert_eq!(result.text, "buenos días");
        assert!((result.confidence - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_deepgram_no_channels_is_empty() {
        let result = parse_deepgram_response(r#"{"results": {"channels": []}}"#).unwrap();
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_rejected_request_kind() {
        let err: TranscriptionError = HttpFailure::Rejected {
            status: 403,
            body: String::new(),
        }
        .into();
        assert_eq!(err.kind(), FailureKind::ServiceRejection);
        assert!(!err.is_transient());
    }

    struct Fixed {
        result: std::result::Result<TranscriptionResult, TranscriptionError>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transcriber for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn transcribe(
            &self,
            wav: &[u8],
            language: &str,
        ) -> std::result::Result<TranscriptionResult, TranscriptionError> {
            assert_eq!(&wav[..4], b"RIFF");
            assert_eq!(language, "es");
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn client(result: std::result::Result<TranscriptionResult, TranscriptionError>) -> (TranscriptionClient, Arc<Fixed>) {
        let backend = Arc::new(Fixed {
            result,
            calls: AtomicU32::new(0),
        });
        let client = TranscriptionClient::new(Arc::clone(&backend) as Arc<dyn Transcriber>)
            .with_retry_policy(RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                jitter: 0.0,
                ..RetryPolicy::default()
            });
        (client, backend)
    }

    fn tone() -> Waveform {
        Waveform::new(vec![0.1; 8_000], 8_000, 1)
    }

    #[tokio::test]
    async fn test_low_confidence_is_unrecognized_and_not_retried() {
        let (client, backend) = client(Ok(TranscriptionResult {
            text: "mmm".to_string(),
            confidence: 0.1,
        }));

        let err = client.transcribe(&tone(), "es").await.unwrap_err();
        assert_eq!(err, TranscriptionError::UnrecognizedSpeech);
        assert_eq!(err.kind(), FailureKind::UnsupportedInput);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_retried_once() {
        let (client, backend) = client(Err(TranscriptionError::ServiceUnavailable(
            "503".to_string(),
        )));

        let err = client.transcribe(&tone(), "es").await.unwrap_err();
        assert!(matches!(err, TranscriptionError::ServiceUnavailable(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_confident_text_passes() {
        let (client, _) = client(Ok(TranscriptionResult {
            text: "quiero practicar".to_string(),
            confidence: 0.9,
        }));

        let result = client.transcribe(&tone(), "es").await.unwrap();
        assert_eq!(result.text, "quiero practicar");
    }

    #[tokio::test]
    async fn test_empty_waveform_skips_service() {
        let (client, backend) = client(Ok(TranscriptionResult {
            text: "x".to_string(),
            confidence: 1.0,
        }));

        let err = client
            .transcribe(&Waveform::new(Vec::new(), 16_000, 1), "es")
            .await
            .unwrap_err();
        assert_eq!(err, TranscriptionError::UnrecognizedSpeech);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
