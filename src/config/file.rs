//! TOML configuration file loading
//!
//! Supports `~/.config/charla/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::persona::TutorPersona;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CharlaConfigFile {
    /// Tutor persona (preamble, toggles, canned replies)
    #[serde(default)]
    pub persona: Option<TutorPersona>,

    /// Speech services
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Dialogue model
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Timeouts, retention and size limits
    #[serde(default)]
    pub limits: LimitsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Telegram channel
    #[serde(default)]
    pub telegram: TelegramFileConfig,
}

/// Speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: Option<String>,

    /// Confidence below which speech counts as not understood
    pub min_confidence: Option<f32>,

    /// "openai" or "elevenlabs"
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice name or id
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,

    /// Language hint for recognition (e.g. "es")
    pub language: Option<String>,

    /// Encoding of reply audio ("wav" or "pcm")
    pub delivery_format: Option<String>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// "gemini" or "openai"
    pub provider: Option<String>,

    /// Model identifier (e.g. "gemini-2.0-flash")
    pub model: Option<String>,

    /// Alternative API root for OpenAI-compatible servers
    pub base_url: Option<String>,

    /// Recent turns sent with each request
    pub context_window: Option<usize>,
}

/// Limits
#[derive(Debug, Default, Deserialize)]
pub struct LimitsFileConfig {
    pub max_audio_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub max_history_turns: Option<usize>,
    pub idle_expiry_mins: Option<u64>,
    pub max_conversations: Option<usize>,
    pub stale_after_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub google: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
    pub telegram: Option<String>,
}

/// Telegram channel configuration (token lives in api_keys)
#[derive(Debug, Default, Deserialize)]
pub struct TelegramFileConfig {
    /// Seconds a user worker may sit idle before shutting down
    pub worker_idle_secs: Option<u64>,
}

/// Load a TOML config file
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<CharlaConfigFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(CharlaConfigFile::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/charla/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("charla").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_file(&dir.path().join("nope.toml")).unwrap();
        assert!(config.persona.is_none());
        assert!(config.llm.model.is_none());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[llm]
provider = "openai"

[persona]
name = "Lucía"
cultural_notes = false

[limits]
idle_expiry_mins = 10
"#
        )
        .unwrap();

        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.llm.provider.as_deref(), Some("openai"));
        assert_eq!(config.limits.idle_expiry_mins, Some(10));

        let persona = config.persona.unwrap();
        assert_eq!(persona.name, "Lucía");
        assert!(!persona.cultural_notes);
        assert!(persona.corrections);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[llm\nprovider = ").unwrap();
        assert!(load_config_file(file.path()).is_err());
    }
}
