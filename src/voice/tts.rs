//! Text-to-speech (TTS) processing

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use crate::audio::{AudioCodec, AudioFormat, CodecError, Waveform};
use crate::http::{self, HttpFailure};
use crate::retry::{RetryPolicy, RetryableError};
use crate::{Error, FailureKind, Result};

/// Failures of the synthesis step
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SynthesisError {
    /// Service unreachable or overloaded
    #[error("synthesis service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No answer within the attempt timeout
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    /// The service cannot speak this text
    #[error("text not supported by synthesis: {0}")]
    UnsupportedText(String),

    /// The service refused the request (credentials, voice id)
    #[error("synthesis request rejected: {0}")]
    Rejected(String),

    /// The returned audio could not be decoded
    #[error("synthesized audio: {0}")]
    Audio(#[from] CodecError),
}

impl SynthesisError {
    /// Failure classification used by the orchestrator
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::ServiceUnavailable(_) | Self::Timeout(_) => FailureKind::TransientServiceFailure,
            Self::Rejected(_) => FailureKind::ServiceRejection,
            Self::UnsupportedText(_) => FailureKind::UnsupportedInput,
            Self::Audio(e) => e.kind(),
        }
    }
}

impl RetryableError for SynthesisError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<HttpFailure> for SynthesisError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Unavailable(msg) => Self::ServiceUnavailable(msg),
            HttpFailure::TimedOut(after) => Self::Timeout(after),
            // Both services answer unspeakable input with a validation error
            HttpFailure::Rejected { status: 400 | 422, body } => Self::UnsupportedText(body),
            HttpFailure::Rejected { status, body } => Self::Rejected(format!("{status}: {body}")),
        }
    }
}

/// Voice used for replies
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VoiceProfile {
    /// Backend voice name or id
    pub voice_id: String,
    /// Backend model
    pub model: String,
    /// Speaking rate (`OpenAI` only)
    pub speed: f32,
    /// BCP-47 language code, sent to backends that take one
    pub language: String,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice_id: "nova".to_string(),
            model: "tts-1".to_string(),
            speed: 0.95,
            language: "es-MX".to_string(),
        }
    }
}

/// Encoded audio as returned by a synthesis backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// Encoding of `bytes`
    pub format: AudioFormat,
}

/// A text-to-speech service
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Render `text` with `voice`
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<SynthesizedAudio, SynthesisError>;
}

async fn read_audio(
    response: reqwest::Response,
    timeout: Duration,
    provider: &str,
) -> std::result::Result<Vec<u8>, SynthesisError> {
    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, provider, "TTS API error");
        return Err(http::classify_status(status, &body).into());
    }

    let audio = response
        .bytes()
        .await
        .map_err(|e| http::classify_error(&e, timeout))?;
    Ok(audio.to_vec())
}

/// `OpenAI` speech backend, requesting raw 24 kHz PCM
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    timeout: Duration,
}

impl OpenAiSynthesizer {
    /// Sample rate of `OpenAI`'s `pcm` response format
    pub const PCM_SAMPLE_RATE: u32 = 24_000;

    /// Create an `OpenAI` TTS backend
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
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
impl Synthesizer for OpenAiSynthesizer {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<SynthesizedAudio, SynthesisError> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &voice.model,
            input: text,
            voice: &voice.voice_id,
            speed: voice.speed,
            response_format: "pcm",
        };

        tracing::debug!(chars = text.chars().count(), voice = %voice.voice_id, "OpenAI TTS request");

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        let bytes = read_audio(response, self.timeout, "openai").await?;
        Ok(SynthesizedAudio {
            bytes,
            format: AudioFormat::Pcm16 {
                sample_rate: Self::PCM_SAMPLE_RATE,
                channels: 1,
            },
        })
    }
}

/// `ElevenLabs` backend (MP3 responses)
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    timeout: Duration,
}

impl ElevenLabsSynthesizer {
    /// Multilingual model, needed for Spanish
    pub const DEFAULT_MODEL: &'static str = "eleven_multilingual_v2";

    /// Create an `ElevenLabs` backend
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<SynthesizedAudio, SynthesisError> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            language_code: Option<&'a str>,
        }

        let request = ElevenLabsRequest {
            text,
            model_id: &voice.model,
            language_code: elevenlabs_language_code(&voice.model, &voice.language),
        };

        let response = self
            .client
            .post(format!("{}/text-to-speech/{}", self.base_url, voice.voice_id))
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        let bytes = read_audio(response, self.timeout, "elevenlabs").await?;
        Ok(SynthesizedAudio {
            bytes,
            format: AudioFormat::Mp3,
        })
    }
}

/// ISO 639-1 code for models that accept `language_code`; older models
/// reject the field outright
fn elevenlabs_language_code<'a>(model: &str, language: &'a str) -> Option<&'a str> {
    let enforces_language = model.contains("turbo_v2_5") || model.contains("flash_v2_5");
    let primary = language.split(['-', '_']).next().unwrap_or_default().trim();
    (enforces_language && primary.len() == 2).then_some(primary)
}

static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid regex"));
static MD_CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```[a-zA-Z0-9_-]*\s*$").expect("valid regex"));
static MD_LINE_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s{0,3}(?:#{1,6}\s+|>\s?|[-*+]\s+)").expect("valid regex"));
static MD_EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*|__|[*`~]").expect("valid regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

/// Remove markdown markup so it is not read aloud
#[must_use]
pub fn strip_markdown(text: &str) -> String {
    let text = MD_LINK.replace_all(text, "$1");
    let text = MD_CODE_FENCE.replace_all(&text, "");
    let text = MD_LINE_MARKERS.replace_all(&text, "");
    let text = MD_EMPHASIS.replace_all(&text, "");
    SPACES.replace_all(&text, " ").trim().to_string()
}

fn is_emoji(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF | 0xFE00..=0xFE0F | 0x200D | 0xE0020..=0xE007F
    )
}

/// Make text speakable: drop emoji, markup, links and control characters and
/// transliterate typographic punctuation to ASCII
///
/// Spanish letters and `¿` `¡` are kept.
#[must_use]
pub fn sanitize_for_speech(text: &str) -> String {
    let text = strip_markdown(text);
    let text = URL.replace_all(&text, "");

    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2009}' | '\u{202F}' => out.push(' '),
            '\n' => out.push('\n'),
            c if c.is_control() || is_emoji(c) => {}
            c => out.push(c),
        }
    }

    SPACES.replace_all(&out, " ").trim().to_string()
}

/// Longest synthesized reply the codec accepts
const MAX_SYNTHESIS_DURATION: Duration = Duration::from_secs(10 * 60);

/// Synthesis with retry and an unsupported-text fallback
pub struct SynthesisClient {
    backend: Arc<dyn Synthesizer>,
    policy: RetryPolicy,
    codec: AudioCodec,
}

impl SynthesisClient {
    /// Wrap a backend with the default retry policy
    #[must_use]
    pub fn new(backend: Arc<dyn Synthesizer>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
            codec: AudioCodec::new(MAX_SYNTHESIS_DURATION),
        }
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Backend name
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Render `text` as a waveform
    ///
    /// Markdown is stripped first. If the service still reports the text as
    /// unsupported, it is sanitized and sent once more.
    ///
    /// # Errors
    ///
    /// - `ServiceUnavailable` / `Timeout` after the retry policy is exhausted
    /// - `UnsupportedText` if the sanitized text is still refused
    /// - `Audio` if the returned audio does not decode
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<Waveform, SynthesisError> {
        let cleaned = strip_markdown(text);

        match self.attempt(&cleaned, voice).await {
            Err(SynthesisError::UnsupportedText(reason)) => {
                let sanitized = sanitize_for_speech(&cleaned);
                if sanitized.is_empty() || sanitized == cleaned {
                    return Err(SynthesisError::UnsupportedText(reason));
                }

                tracing::warn!(
                    backend = self.backend.name(),
                    reason = %reason,
                    "text refused, retrying sanitized"
                );
                self.attempt(&sanitized, voice).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        text: &str,
        voice: &VoiceProfile,
    ) -> std::result::Result<Waveform, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::UnsupportedText("nothing to speak".to_string()));
        }

        let audio = self
            .policy
            .run("synthesis", || self.backend.synthesize(text, voice))
            .await?;

        let waveform = self.codec.decode(&audio.bytes, audio.format)?;
        tracing::debug!(
            backend = self.backend.name(),
            duration_ms = u64::try_from(waveform.duration().as_millis()).unwrap_or(u64::MAX),
            "synthesis complete"
        );
        Ok(waveform)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_strip_markdown() {
        let text = "## Título\n**Muy** bien, mira [esto](https://ejemplo.com).\n- uno\n> cita";
        assert_eq!(strip_markdown(text), "Título\nMuy bien, mira esto.\nuno\ncita");
    }

    #[test]
    fn test_sanitize_keeps_spanish() {
        let text = "¡Qué día! 😀 “Mañana” — dijo… ¿sí?";
        assert_eq!(sanitize_for_speech(text), "¡Qué día! \"Mañana\" - dijo... ¿sí?");
    }

    #[test]
    fn test_sanitize_drops_controls_and_links() {
        let text = "hola\u{7}mundo https://x.y/z 👍🏽";
        assert_eq!(sanitize_for_speech(text), "holamundo");
    }

    #[test]
    fn test_validation_errors_are_unsupported_text() {
        let err: SynthesisError = HttpFailure::Rejected {
            status: 400,
            body: "bad input".to_string(),
        }
        .into();
        assert!(matches!(err, SynthesisError::UnsupportedText(_)));

        let err: SynthesisError = HttpFailure::Rejected {
            status: 401,
            body: String::new(),
        }
        .into();
        assert!(matches!(err, SynthesisError::Rejected(_)));
        assert_eq!(err.kind(), FailureKind::ServiceRejection);
    }

    #[test]
    fn test_elevenlabs_language_code_follows_voice() {
        assert_eq!(elevenlabs_language_code("eleven_turbo_v2_5", "es-MX"), Some("es"));
        assert_eq!(elevenlabs_language_code("eleven_flash_v2_5", "es"), Some("es"));
        assert_eq!(elevenlabs_language_code(ElevenLabsSynthesizer::DEFAULT_MODEL, "es-MX"), None);
        assert_eq!(elevenlabs_language_code("eleven_turbo_v2_5", ""), None);
    }

    /// Refuses any text containing a non-ASCII symbol outside Spanish letters
    struct Picky {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Synthesizer for Picky {
        fn name(&self) -> &'static str {
            "picky"
        }

        async fn synthesize(
            &self,
            text: &str,
            _voice: &VoiceProfile,
        ) -> std::result::Result<SynthesizedAudio, SynthesisError> {
            self.seen.lock().unwrap().push(text.to_string());
            if text.chars().any(is_emoji) {
                return Err(SynthesisError::UnsupportedText("emoji".to_string()));
            }
            Ok(SynthesizedAudio {
                bytes: vec![0; 3200],
                format: AudioFormat::PCM16_SPEECH,
            })
        }
    }

    #[tokio::test]
    async fn test_unsupported_text_is_sanitized_once() {
        let backend = Arc::new(Picky {
            seen: Mutex::new(Vec::new()),
        });
        let client = SynthesisClient::new(Arc::clone(&backend) as Arc<dyn Synthesizer>);

        let waveform = client
            .synthesize("¡Muy bien! 🎉", &VoiceProfile::default())
            .await
            .unwrap();
        assert_eq!(waveform.frames(), 1600);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["¡Muy bien! 🎉", "¡Muy bien!"]);
    }

    #[tokio::test]
    async fn test_only_emoji_gives_up() {
        let backend = Arc::new(Picky {
            seen: Mutex::new(Vec::new()),
        });
        let client = SynthesisClient::new(Arc::clone(&backend) as Arc<dyn Synthesizer>);

        let err = client
            .synthesize("🎉🎉", &VoiceProfile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::UnsupportedText(_)));
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
    }
}
