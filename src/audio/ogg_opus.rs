//! Ogg/Opus decoding (Telegram voice notes)

use std::io::Cursor;
use std::time::Duration;

use ogg::PacketReader;

use super::{CodecError, Waveform};

/// Opus always decodes at 48 kHz
const OPUS_RATE: u32 = 48_000;

/// Largest Opus frame: 120 ms at 48 kHz
const MAX_FRAME_SAMPLES: usize = 5_760;

fn corrupt(e: impl std::fmt::Display) -> CodecError {
    CodecError::CorruptAudio(format!("ogg/opus: {e}"))
}

/// Decode an Ogg/Opus stream, honoring the header's pre-skip
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub(super) fn decode(bytes: &[u8], max_duration: Duration) -> Result<Waveform, CodecError> {
    let mut reader = PacketReader::new(Cursor::new(bytes));

    let head = reader
        .read_packet()
        .map_err(corrupt)?
        .ok_or_else(|| corrupt("stream has no packets"))?;

    if head.data.len() < 19 || !head.data.starts_with(b"OpusHead") {
        return Err(CodecError::UnsupportedFormat(
            "ogg stream does not carry opus".to_string(),
        ));
    }

    let channels = head.data[9];
    let pre_skip = usize::from(u16::from_le_bytes([head.data[10], head.data[11]]));
    let opus_channels = match channels {
        1 => opus::Channels::Mono,
        2 => opus::Channels::Stereo,
        n => {
            return Err(CodecError::UnsupportedFormat(format!(
                "opus with {n} channels"
            )));
        }
    };
    let layout = u16::from(channels);
    let channels = usize::from(channels);

    let mut decoder = opus::Decoder::new(OPUS_RATE, opus_channels).map_err(corrupt)?;
    let max_frames = (max_duration.as_secs_f64() * f64::from(OPUS_RATE)) as usize + pre_skip;

    let mut samples = Vec::new();
    let mut buffer = vec![0.0_f32; MAX_FRAME_SAMPLES * channels];
    let mut first = true;

    while let Some(packet) = reader.read_packet().map_err(corrupt)? {
        // Comment header follows the identification header
        if std::mem::take(&mut first) && packet.data.starts_with(b"OpusTags") {
            continue;
        }

        let decoded = decoder
            .decode_float(&packet.data, &mut buffer, false)
            .map_err(corrupt)?;
        samples.extend_from_slice(&buffer[..decoded * channels]);

        let frames = samples.len() / channels;
        if frames > max_frames {
            return Err(CodecError::InputTooLarge {
                actual: Duration::from_secs_f64((frames - pre_skip) as f64 / f64::from(OPUS_RATE)),
                limit: max_duration,
            });
        }
    }

    samples.drain(..(pre_skip * channels).min(samples.len()));

    Ok(Waveform::new(samples, OPUS_RATE, layout))
}
