//! Audio format descriptors
//!
//! Formats are identified by MIME type as reported by the messaging client,
//! never by file extension.

use std::fmt;

/// Container/codec descriptor for encoded audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    /// RIFF/WAVE container with PCM samples
    Wav,
    /// MPEG-1/2 layer III
    Mp3,
    /// Raw signed 16-bit little-endian PCM without a header
    Pcm16 {
        /// Samples per second
        sample_rate: u32,
        /// Interleaved channel count
        channels: u16,
    },
    /// Opus packets in an Ogg container (Telegram voice notes)
    OggOpus,
}

impl AudioFormat {
    /// Mono 16 kHz raw PCM, the common speech-service format
    pub const PCM16_SPEECH: Self = Self::Pcm16 {
        sample_rate: 16_000,
        channels: 1,
    };

    /// Resolve a MIME type such as `audio/ogg; codecs=opus`
    ///
    /// Returns `None` for types no decoder is known for.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let lower = mime_type.trim().to_ascii_lowercase();
        let mut parts = lower.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default();

        match essence {
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => Some(Self::Wav),
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" => Some(Self::Mp3),
            "audio/ogg" | "audio/opus" | "audio/x-opus+ogg" => Some(Self::OggOpus),
            "audio/l16" | "audio/pcm" => {
                let mut sample_rate = 16_000;
                let mut channels = 1;
                for param in parts {
                    if let Some((key, value)) = param.split_once('=') {
                        match key.trim() {
                            "rate" => sample_rate = value.trim().parse().ok()?,
                            "channels" => channels = value.trim().parse().ok()?,
                            _ => {}
                        }
                    }
                }
                if sample_rate == 0 || channels == 0 {
                    return None;
                }
                Some(Self::Pcm16 {
                    sample_rate,
                    channels,
                })
            }
            _ => None,
        }
    }

    /// MIME type used when delivering audio in this format
    #[must_use]
    pub fn mime_type(&self) -> String {
        match self {
            Self::Wav => "audio/wav".to_string(),
            Self::Mp3 => "audio/mpeg".to_string(),
            Self::Pcm16 {
                sample_rate,
                channels,
            } => format!("audio/L16; rate={sample_rate}; channels={channels}"),
            Self::OggOpus => "audio/ogg".to_string(),
        }
    }

    /// Whether a decode/encode cycle preserves samples exactly
    #[must_use]
    pub const fn is_lossless(&self) -> bool {
        matches!(self, Self::Wav | Self::Pcm16 { .. })
    }

    /// Suggested file name for uploads that require one
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Wav => "audio.wav",
            Self::Mp3 => "audio.mp3",
            Self::Pcm16 { .. } => "audio.pcm",
            Self::OggOpus => "audio.ogg",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wav => f.write_str("wav"),
            Self::Mp3 => f.write_str("mp3"),
            Self::Pcm16 {
                sample_rate,
                channels,
            } => write!(f, "pcm16/{sample_rate}Hz/{channels}ch"),
            Self::OggOpus => f.write_str("ogg/opus"),
        }
    }
}
