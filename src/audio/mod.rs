//! Audio codec adapter
//!
//! Converts between the messaging client's voice containers and the
//! [`Waveform`] representation the speech services work with. Every
//! operation here is a pure transformation of bytes.

mod format;
#[cfg(feature = "opus")]
mod ogg_opus;
mod waveform;

use std::io::Cursor;
use std::time::Duration;

use thiserror::Error;

pub use format::AudioFormat;
pub use waveform::Waveform;

use crate::FailureKind;

/// Default bound on inbound audio length
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(120);

/// Sample rate the speech services are fed with
pub const SPEECH_SAMPLE_RATE: u32 = 16_000;

/// Full scale of a signed 16-bit sample
const I16_SCALE: f32 = 32_768.0;

/// Failures of the audio codec adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// No decoder/encoder exists for the descriptor
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Bytes do not form valid audio in the declared format
    #[error("corrupt audio: {0}")]
    CorruptAudio(String),

    /// Audio is longer than the configured maximum
    #[error("audio too long: {actual:?} exceeds limit of {limit:?}")]
    InputTooLarge {
        /// Length detected so far (may be a lower bound)
        actual: Duration,
        /// Configured maximum
        limit: Duration,
    },

    /// Waveform could not be rendered into the target format
    #[error("audio encoding failed: {0}")]
    Encoding(String),
}

impl CodecError {
    /// Failure classification used by the orchestrator
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::InputTooLarge { .. } | Self::UnsupportedFormat(_) => FailureKind::UnsupportedInput,
            Self::CorruptAudio(_) | Self::Encoding(_) => FailureKind::DecodingFailure,
        }
    }
}

/// Stateless decoder/encoder bounded by a maximum input duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodec {
    max_duration: Duration,
}

impl Default for AudioCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DURATION)
    }
}

impl AudioCodec {
    /// Create a codec that rejects audio longer than `max_duration`
    #[must_use]
    pub const fn new(max_duration: Duration) -> Self {
        Self { max_duration }
    }

    /// Configured maximum input duration
    #[must_use]
    pub const fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Decode `bytes` in `format` into a waveform at its native rate and layout
    ///
    /// # Errors
    ///
    /// - `UnsupportedFormat` when no decoder exists for `format`
    /// - `CorruptAudio` when the bytes are not valid `format` audio
    /// - `InputTooLarge` when the audio exceeds the configured duration; this is
    ///   detected before decoding for WAV and PCM and during decoding otherwise
    pub fn decode(&self, bytes: &[u8], format: AudioFormat) -> Result<Waveform, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::CorruptAudio("empty audio payload".to_string()));
        }

        let waveform = match format {
            AudioFormat::Wav => self.decode_wav(bytes)?,
            AudioFormat::Mp3 => self.decode_mp3(bytes)?,
            AudioFormat::Pcm16 {
                sample_rate,
                channels,
            } => self.decode_pcm16(bytes, sample_rate, channels)?,
            AudioFormat::OggOpus => self.decode_ogg_opus(bytes)?,
        };

        tracing::debug!(
            %format,
            bytes = bytes.len(),
            sample_rate = waveform.sample_rate(),
            channels = waveform.channels(),
            duration_ms = u64::try_from(waveform.duration().as_millis()).unwrap_or(u64::MAX),
            "audio decoded"
        );

        Ok(waveform)
    }

    /// Encode `waveform` into `format`
    ///
    /// WAV keeps the waveform's rate and channel layout; raw PCM is converted
    /// to the rate and layout the descriptor names.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encoding` if no encoder exists or writing fails
    pub fn encode(&self, waveform: &Waveform, format: AudioFormat) -> Result<Vec<u8>, CodecError> {
        match format {
            AudioFormat::Wav => encode_wav(waveform),
            AudioFormat::Pcm16 {
                sample_rate,
                channels,
            } => {
                let conformed = waveform.conform(sample_rate, channels)?;
                Ok(conformed
                    .samples()
                    .iter()
                    .flat_map(|&s| to_i16(s).to_le_bytes())
                    .collect())
            }
            AudioFormat::Mp3 | AudioFormat::OggOpus => Err(CodecError::Encoding(format!(
                "no encoder available for {format}"
            ))),
        }
    }

    fn check_duration(&self, actual: Duration) -> Result<(), CodecError> {
        if actual > self.max_duration {
            return Err(CodecError::InputTooLarge {
                actual,
                limit: self.max_duration,
            });
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn frames_duration(frames: usize, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(frames as f64 / f64::from(sample_rate.max(1)))
    }

    #[allow(clippy::cast_precision_loss)]
    fn decode_wav(&self, bytes: &[u8]) -> Result<Waveform, CodecError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes)).map_err(map_hound)?;
        let spec = reader.spec();

        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(CodecError::CorruptAudio("WAV header has zero rate or channels".to_string()));
        }

        // Header-declared length, checked before touching any sample
        self.check_duration(Self::frames_duration(reader.duration() as usize, spec.sample_rate))?;

        let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / I16_SCALE))
                .collect::<Result<_, _>>()
                .map_err(map_hound)?,
            (hound::SampleFormat::Int, bits @ (8 | 24 | 32)) => {
                let scale = (1_i64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(map_hound)?
            }
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(map_hound)?,
            (sample_format, bits) => {
                return Err(CodecError::UnsupportedFormat(format!(
                    "WAV {bits}-bit {sample_format:?} samples"
                )));
            }
        };

        Ok(Waveform::new(samples, spec.sample_rate, spec.channels))
    }

    fn decode_pcm16(
        &self,
        bytes: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Waveform, CodecError> {
        if sample_rate == 0 || channels == 0 {
            return Err(CodecError::UnsupportedFormat(
                "raw PCM needs a non-zero rate and channel count".to_string(),
            ));
        }

        let frame_bytes = 2 * usize::from(channels);
        if bytes.len() % frame_bytes != 0 {
            return Err(CodecError::CorruptAudio(format!(
                "{} bytes is not a whole number of {channels}-channel 16-bit frames",
                bytes.len()
            )));
        }

        self.check_duration(Self::frames_duration(bytes.len() / frame_bytes, sample_rate))?;

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / I16_SCALE)
            .collect();

        Ok(Waveform::new(samples, sample_rate, channels))
    }

    #[allow(clippy::cast_sign_loss)]
    fn decode_mp3(&self, bytes: &[u8]) -> Result<Waveform, CodecError> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
        let mut samples: Vec<f32> = Vec::new();
        let mut layout: Option<(u32, u16)> = None;

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    let rate = frame.sample_rate as u32;
                    let channels = u16::try_from(frame.channels).unwrap_or(1).max(1);
                    let (rate, channels) = *layout.get_or_insert((rate, channels));

                    if usize::from(channels) == frame.channels {
                        samples.extend(frame.data.iter().map(|&s| f32::from(s) / I16_SCALE));
                    } else {
                        // Layout changed mid-stream; fold into the first frame's layout
                        let frame_wave = Waveform::new(
                            frame.data.iter().map(|&s| f32::from(s) / I16_SCALE).collect(),
                            rate,
                            u16::try_from(frame.channels).unwrap_or(1),
                        );
                        samples.extend(frame_wave.with_channels(channels).into_samples());
                    }

                    self.check_duration(Self::frames_duration(
                        samples.len() / usize::from(channels),
                        rate,
                    ))?;
                }
                Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => break,
                Err(minimp3::Error::SkippedData) => {}
                Err(e) => {
                    return Err(CodecError::CorruptAudio(format!("MP3 decode error: {e}")));
                }
            }
        }

        let (rate, channels) = layout
            .ok_or_else(|| CodecError::CorruptAudio("no MP3 frames found".to_string()))?;

        Ok(Waveform::new(samples, rate, channels))
    }

    #[cfg(feature = "opus")]
    fn decode_ogg_opus(&self, bytes: &[u8]) -> Result<Waveform, CodecError> {
        ogg_opus::decode(bytes, self.max_duration)
    }

    #[cfg(not(feature = "opus"))]
    #[allow(clippy::unused_self)]
    fn decode_ogg_opus(&self, _bytes: &[u8]) -> Result<Waveform, CodecError> {
        Err(CodecError::UnsupportedFormat(
            "ogg/opus (built without the `opus` feature)".to_string(),
        ))
    }
}

/// Convert a `[-1.0, 1.0]` sample to `i16`, exact for values decoded from `i16`
#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * I16_SCALE).round().clamp(-I16_SCALE, I16_SCALE - 1.0) as i16
}

fn encode_wav(waveform: &Waveform) -> Result<Vec<u8>, CodecError> {
    let spec = hound::WavSpec {
        channels: waveform.channels(),
        sample_rate: waveform.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CodecError::Encoding(e.to_string()))?;

        for &sample in waveform.samples() {
            writer
                .write_sample(to_i16(sample))
                .map_err(|e| CodecError::Encoding(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| CodecError::Encoding(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

fn map_hound(error: hound::Error) -> CodecError {
    match error {
        hound::Error::Unsupported => CodecError::UnsupportedFormat("WAV variant".to_string()),
        other => CodecError::CorruptAudio(format!("WAV: {other}")),
    }
}
