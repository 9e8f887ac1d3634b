//! Configuration management for Charla gateway
//!
//! Values are layered: environment variables override the TOML file, which
//! overrides built-in defaults. Credentials are held as [`SecretString`]s and
//! only checked when the backend that needs them is built, so a missing key
//! fails at startup rather than mid-conversation.

pub mod file;

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::audio::{AudioCodec, AudioFormat, DEFAULT_MAX_DURATION};
use crate::dialogue::{
    DEFAULT_CONTEXT_WINDOW, DialogueEngine, GeminiModel, LanguageModel, OpenAiChatModel,
    RetentionLimits,
};
use crate::exchange::ExchangeOrchestrator;
use crate::gateway::GatewaySettings;
use crate::persona::TutorPersona;
use crate::retry::RetryPolicy;
use crate::voice::{
    DeepgramTranscriber, ElevenLabsSynthesizer, OpenAiSynthesizer, SynthesisClient, Synthesizer,
    Transcriber, TranscriptionClient, VoiceProfile, WhisperTranscriber,
};
use crate::{Error, Result};

use file::CharlaConfigFile;

/// Speech-to-text backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProvider {
    /// `OpenAI` Whisper
    Whisper,
    /// Deepgram
    Deepgram,
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Text-to-speech backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    /// `OpenAI` speech
    OpenAi,
    /// `ElevenLabs`
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Dialogue model backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Google Gemini
    Gemini,
    /// OpenAI-compatible chat completions
    OpenAi,
}

impl FromStr for LlmProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!("unknown LLM provider: {other}"))),
        }
    }
}

/// API keys
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` (Whisper, TTS, chat)
    pub openai: Option<SecretString>,
    /// Google AI (Gemini)
    pub google: Option<SecretString>,
    /// `ElevenLabs`
    pub elevenlabs: Option<SecretString>,
    /// Deepgram
    pub deepgram: Option<SecretString>,
    /// Telegram bot token
    pub telegram: Option<SecretString>,
}

/// Speech configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Recognition backend
    pub stt_provider: SttProvider,
    /// Recognition model
    pub stt_model: String,
    /// Confidence floor
    pub min_confidence: f32,
    /// Language hint for recognition
    pub language: String,
    /// Synthesis backend
    pub tts_provider: TtsProvider,
    /// Voice for replies
    pub voice: VoiceProfile,
    /// Encoding of reply audio
    pub delivery_format: AudioFormat,
}

/// Dialogue model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Backend
    pub provider: LlmProvider,
    /// Model identifier
    pub model: String,
    /// Alternative API root
    pub base_url: Option<String>,
    /// Recent turns sent with each request
    pub context_window: usize,
}

/// Timeouts, retention and size limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Longest inbound audio
    pub max_audio: Duration,
    /// Per-attempt timeout for every service call
    pub request_timeout: Duration,
    /// Attempts per service call, including the first
    pub max_attempts: u32,
    /// Conversation retention
    pub retention: RetentionLimits,
    /// Messages older than this are dropped
    pub stale_after: Duration,
    /// Idle user workers shut down after this
    pub worker_idle: Duration,
}

/// Charla gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Tutor persona
    pub persona: TutorPersona,
    /// Speech services
    pub speech: SpeechConfig,
    /// Dialogue model
    pub llm: LlmConfig,
    /// Limits
    pub limits: Limits,
    /// API keys
    pub api_keys: ApiKeys,
    /// File the configuration was read from, if any
    pub config_path: Option<PathBuf>,
}

/// Parse an optional value, naming the source in the error
fn parse_value<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name} '{value}': {e}")))
    })
    .transpose()
}

fn parse_delivery_format(value: &str) -> Result<AudioFormat> {
    match value.trim().to_lowercase().as_str() {
        "wav" => Ok(AudioFormat::Wav),
        "pcm" | "pcm16" => Ok(AudioFormat::PCM16_SPEECH),
        other => Err(Error::Config(format!(
            "unsupported delivery format: {other} (expected wav or pcm)"
        ))),
    }
}

fn secret(env: Option<String>, file: Option<String>) -> Option<SecretString> {
    env.or(file)
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn require(key: Option<&SecretString>, what: &str, var: &str) -> Result<SecretString> {
    key.cloned().ok_or_else(|| {
        Error::Config(format!("{what} requires an API key (set {var} or [api_keys])"))
    })
}

impl Config {
    /// Load configuration from the environment and a TOML file
    ///
    /// Uses `path` if given, otherwise `~/.config/charla/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns error if the file is malformed or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(file::config_file_path);
        let fc = match &path {
            Some(path) => file::load_config_file(path)?,
            None => CharlaConfigFile::default(),
        };

        let mut config = Self::from_sources(fc, |key| std::env::var(key).ok())?;
        config.config_path = path.filter(|p| p.exists());
        Ok(config)
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid
    pub fn from_sources(fc: CharlaConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let persona = fc.persona.unwrap_or_default();

        let api_keys = ApiKeys {
            openai: secret(env("OPENAI_API_KEY"), fc.api_keys.openai),
            google: secret(
                env("GOOGLE_API_KEY").or_else(|| env("GEMINI_API_KEY")),
                fc.api_keys.google,
            ),
            elevenlabs: secret(env("ELEVENLABS_API_KEY"), fc.api_keys.elevenlabs),
            deepgram: secret(env("DEEPGRAM_API_KEY"), fc.api_keys.deepgram),
            telegram: secret(env("TELEGRAM_BOT_TOKEN"), fc.api_keys.telegram),
        };

        let stt_provider: SttProvider =
            parse_value("CHARLA_STT_PROVIDER", env("CHARLA_STT_PROVIDER").or(fc.voice.stt_provider))?
                .unwrap_or(SttProvider::Whisper);
        let tts_provider: TtsProvider =
            parse_value("CHARLA_TTS_PROVIDER", env("CHARLA_TTS_PROVIDER").or(fc.voice.tts_provider))?
                .unwrap_or(TtsProvider::OpenAi);

        let default_voice = VoiceProfile::default();
        let tts_voice = env("CHARLA_TTS_VOICE").or(fc.voice.tts_voice);
        let voice = VoiceProfile {
            voice_id: match (tts_provider, tts_voice) {
                (_, Some(voice)) => voice,
                (TtsProvider::OpenAi, None) => default_voice.voice_id,
                (TtsProvider::ElevenLabs, None) => {
                    return Err(Error::Config(
                        "ElevenLabs needs a voice id (set CHARLA_TTS_VOICE or voice.tts_voice)"
                            .to_string(),
                    ));
                }
            },
            model: env("CHARLA_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| match tts_provider {
                    TtsProvider::OpenAi => default_voice.model,
                    TtsProvider::ElevenLabs => ElevenLabsSynthesizer::DEFAULT_MODEL.to_string(),
                }),
            speed: parse_value("CHARLA_TTS_SPEED", env("CHARLA_TTS_SPEED"))?
                .or(fc.voice.tts_speed)
                .unwrap_or(default_voice.speed),
            language: default_voice.language,
        };

        let speech = SpeechConfig {
            stt_provider,
            stt_model: env("CHARLA_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| match stt_provider {
                    SttProvider::Whisper => "whisper-1".to_string(),
                    SttProvider::Deepgram => "nova-2".to_string(),
                }),
            min_confidence: parse_value("CHARLA_MIN_CONFIDENCE", env("CHARLA_MIN_CONFIDENCE"))?
                .or(fc.voice.min_confidence)
                .unwrap_or(TranscriptionClient::DEFAULT_MIN_CONFIDENCE),
            language: env("CHARLA_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or_else(|| "es".to_string()),
            tts_provider,
            voice,
            delivery_format: env("CHARLA_DELIVERY_FORMAT")
                .or(fc.voice.delivery_format)
                .as_deref()
                .map_or(Ok(AudioFormat::Wav), parse_delivery_format)?,
        };

        let llm_provider: LlmProvider =
            parse_value("CHARLA_LLM_PROVIDER", env("CHARLA_LLM_PROVIDER").or(fc.llm.provider))?
                .unwrap_or(LlmProvider::Gemini);
        let llm = LlmConfig {
            provider: llm_provider,
            model: env("CHARLA_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| match llm_provider {
                    LlmProvider::Gemini => GeminiModel::DEFAULT_MODEL.to_string(),
                    LlmProvider::OpenAi => OpenAiChatModel::DEFAULT_MODEL.to_string(),
                }),
            base_url: env("CHARLA_LLM_BASE_URL").or(fc.llm.base_url),
            context_window: parse_value("CHARLA_CONTEXT_WINDOW", env("CHARLA_CONTEXT_WINDOW"))?
                .or(fc.llm.context_window)
                .unwrap_or(DEFAULT_CONTEXT_WINDOW),
        };

        let fl = fc.limits;
        let retention_defaults = RetentionLimits::default();
        let limits = Limits {
            max_audio: parse_value("CHARLA_MAX_AUDIO_SECS", env("CHARLA_MAX_AUDIO_SECS"))?
                .or(fl.max_audio_secs)
                .map_or(DEFAULT_MAX_DURATION, Duration::from_secs),
            request_timeout: parse_value(
                "CHARLA_REQUEST_TIMEOUT_SECS",
                env("CHARLA_REQUEST_TIMEOUT_SECS"),
            )?
            .or(fl.request_timeout_secs)
            .map_or(RetryPolicy::default().attempt_timeout, Duration::from_secs),
            max_attempts: fl.max_attempts.unwrap_or(RetryPolicy::default().max_attempts).max(1),
            retention: RetentionLimits {
                max_turns: parse_value("CHARLA_MAX_HISTORY_TURNS", env("CHARLA_MAX_HISTORY_TURNS"))?
                    .or(fl.max_history_turns)
                    .unwrap_or(retention_defaults.max_turns),
                idle_expiry: parse_value("CHARLA_IDLE_EXPIRY_MINS", env("CHARLA_IDLE_EXPIRY_MINS"))?
                    .or(fl.idle_expiry_mins)
                    .map_or(retention_defaults.idle_expiry, |mins: u64| {
                        Duration::from_secs(mins * 60)
                    }),
                max_conversations: fl
                    .max_conversations
                    .and_then(NonZeroUsize::new)
                    .unwrap_or(retention_defaults.max_conversations),
            },
            stale_after: parse_value("CHARLA_STALE_AFTER_SECS", env("CHARLA_STALE_AFTER_SECS"))?
                .or(fl.stale_after_secs)
                .map_or(GatewaySettings::default().stale_after, Duration::from_secs),
            worker_idle: fc
                .telegram
                .worker_idle_secs
                .map_or(GatewaySettings::default().worker_idle, Duration::from_secs),
        };

        Ok(Self {
            persona,
            speech,
            llm,
            limits,
            api_keys,
            config_path: None,
        })
    }

    /// Retry policy shared by every service client
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.limits.max_attempts,
            ..RetryPolicy::default()
        }
        .with_attempt_timeout(self.limits.request_timeout)
    }

    /// Gateway timing
    #[must_use]
    pub const fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            stale_after: self.limits.stale_after,
            worker_idle: self.limits.worker_idle,
        }
    }

    /// Telegram bot token
    ///
    /// # Errors
    ///
    /// Returns error if no token is configured
    pub fn telegram_token(&self) -> Result<SecretString> {
        self.api_keys.telegram.clone().ok_or_else(|| {
            Error::Config("Telegram requires a bot token (set TELEGRAM_BOT_TOKEN)".to_string())
        })
    }

    /// Build the configured speech-to-text backend
    ///
    /// # Errors
    ///
    /// Returns error if its API key is missing
    pub fn build_transcriber(&self) -> Result<Arc<dyn Transcriber>> {
        let timeout = self.limits.request_timeout;
        let model = self.speech.stt_model.clone();

        Ok(match self.speech.stt_provider {
            SttProvider::Whisper => Arc::new(WhisperTranscriber::new(
                require(self.api_keys.openai.as_ref(), "Whisper", "OPENAI_API_KEY")?,
                model,
                timeout,
            )?),
            SttProvider::Deepgram => Arc::new(DeepgramTranscriber::new(
                require(self.api_keys.deepgram.as_ref(), "Deepgram", "DEEPGRAM_API_KEY")?,
                model,
                timeout,
            )?),
        })
    }

    /// Build the configured dialogue backend
    ///
    /// # Errors
    ///
    /// Returns error if its API key is missing
    pub fn build_language_model(&self) -> Result<Arc<dyn LanguageModel>> {
        let timeout = self.limits.request_timeout;
        let model = self.llm.model.clone();

        Ok(match self.llm.provider {
            LlmProvider::Gemini => {
                let key = require(self.api_keys.google.as_ref(), "Gemini", "GOOGLE_API_KEY")?;
                let backend = GeminiModel::new(key, model, timeout)?;
                match &self.llm.base_url {
                    Some(url) => Arc::new(backend.with_base_url(url.clone())),
                    None => Arc::new(backend),
                }
            }
            LlmProvider::OpenAi => {
                let key = require(self.api_keys.openai.as_ref(), "OpenAI chat", "OPENAI_API_KEY")?;
                let backend = OpenAiChatModel::new(key, model, timeout)?;
                match &self.llm.base_url {
                    Some(url) => Arc::new(backend.with_base_url(url.clone())),
                    None => Arc::new(backend),
                }
            }
        })
    }

    /// Build the configured text-to-speech backend
    ///
    /// # Errors
    ///
    /// Returns error if its API key is missing
    pub fn build_synthesizer(&self) -> Result<Arc<dyn Synthesizer>> {
        let timeout = self.limits.request_timeout;

        Ok(match self.speech.tts_provider {
            TtsProvider::OpenAi => Arc::new(OpenAiSynthesizer::new(
                require(self.api_keys.openai.as_ref(), "OpenAI TTS", "OPENAI_API_KEY")?,
                timeout,
            )?),
            TtsProvider::ElevenLabs => Arc::new(ElevenLabsSynthesizer::new(
                require(self.api_keys.elevenlabs.as_ref(), "ElevenLabs", "ELEVENLABS_API_KEY")?,
                timeout,
            )?),
        })
    }

    /// Transcription client with the configured policy and confidence floor
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn transcription_client(&self) -> Result<TranscriptionClient> {
        Ok(TranscriptionClient::new(self.build_transcriber()?)
            .with_retry_policy(self.retry_policy())
            .with_min_confidence(self.speech.min_confidence))
    }

    /// Synthesis client with the configured policy
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn synthesis_client(&self) -> Result<SynthesisClient> {
        Ok(SynthesisClient::new(self.build_synthesizer()?).with_retry_policy(self.retry_policy()))
    }

    /// Dialogue engine with the configured model, persona and retention
    ///
    /// # Errors
    ///
    /// Returns error if the model's API key is missing
    pub fn dialogue_engine(&self) -> Result<DialogueEngine> {
        Ok(
            DialogueEngine::new(self.build_language_model()?, Arc::new(self.persona.clone()))
                .with_retry_policy(self.retry_policy())
                .with_context_window(self.llm.context_window)
                .with_retention(self.limits.retention),
        )
    }

    /// Assemble the whole pipeline
    ///
    /// Every credential the configured backends need is checked here.
    ///
    /// # Errors
    ///
    /// Returns error if any backend's API key is missing
    pub fn build_orchestrator(&self) -> Result<ExchangeOrchestrator> {
        Ok(ExchangeOrchestrator::new(
            AudioCodec::new(self.limits.max_audio),
            self.transcription_client()?,
            self.dialogue_engine()?,
            self.synthesis_client()?,
            self.speech.voice.clone(),
        )
        .with_delivery_format(self.speech.delivery_format)
        .with_language_hint(self.speech.language.clone()))
    }
}
