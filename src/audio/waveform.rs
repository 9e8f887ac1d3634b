//! Decoded audio samples

use std::time::Duration;

use rubato::{FftFixedIn, Resampler};

use super::CodecError;

/// Frames fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Interleaved `f32` samples in `[-1.0, 1.0]`
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl Waveform {
    /// Wrap interleaved samples
    ///
    /// A channel count of zero is treated as mono.
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consume into interleaved samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Samples per second
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel)
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Whether there is no audio at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Average all channels into one
    #[must_use]
    pub fn to_mono(&self) -> Self {
        if self.channels == 1 {
            return self.clone();
        }

        let channels = usize::from(self.channels);
        let scale = 1.0 / f32::from(self.channels);
        let samples = self
            .samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect();

        Self::new(samples, self.sample_rate, 1)
    }

    /// Duplicate or mix channels so the waveform has `channels` channels
    #[must_use]
    pub fn with_channels(&self, channels: u16) -> Self {
        let channels = channels.max(1);
        if channels == self.channels {
            return self.clone();
        }
        if channels == 1 {
            return self.to_mono();
        }

        let mono = self.to_mono();
        let samples = mono
            .samples
            .iter()
            .flat_map(|&s| std::iter::repeat_n(s, usize::from(channels)))
            .collect();

        Self::new(samples, self.sample_rate, channels)
    }

    /// Convert to another sample rate
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encoding` if the resampler cannot be built or fails
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn resample(&self, target_rate: u32) -> Result<Self, CodecError> {
        if target_rate == self.sample_rate || self.is_empty() {
            return Ok(Self::new(self.samples.clone(), target_rate, self.channels));
        }
        if self.sample_rate == 0 || target_rate == 0 {
            return Err(CodecError::Encoding("sample rate must be non-zero".to_string()));
        }

        let channels = usize::from(self.channels);
        let frames = self.frames();
        let expected = (frames as u64 * u64::from(target_rate))
            .div_ceil(u64::from(self.sample_rate)) as usize;

        let mut resampler = FftFixedIn::<f32>::new(
            self.sample_rate as usize,
            target_rate as usize,
            RESAMPLE_CHUNK,
            2,
            channels,
        )
        .map_err(|e| CodecError::Encoding(format!("resampler init failed: {e}")))?;
        let delay = resampler.output_delay();

        // De-interleave into one buffer per channel
        let planar: Vec<Vec<f32>> = (0..channels)
            .map(|c| self.samples.iter().skip(c).step_by(channels).copied().collect())
            .collect();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

        let mut position = 0;
        while position + RESAMPLE_CHUNK <= frames {
            let input: Vec<&[f32]> = planar
                .iter()
                .map(|c| &c[position..position + RESAMPLE_CHUNK])
                .collect();
            let chunk = resampler
                .process(&input, None)
                .map_err(|e| CodecError::Encoding(format!("resample failed: {e}")))?;
            append_planar(&mut output, chunk);
            position += RESAMPLE_CHUNK;
        }

        if position < frames {
            let input: Vec<&[f32]> = planar.iter().map(|c| &c[position..]).collect();
            let chunk = resampler
                .process_partial(Some(input.as_slice()), None)
                .map_err(|e| CodecError::Encoding(format!("resample failed: {e}")))?;
            append_planar(&mut output, chunk);
        }

        // Flush the resampler's internal delay
        while output[0].len() < expected + delay {
            let chunk = resampler
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(|e| CodecError::Encoding(format!("resample failed: {e}")))?;
            if chunk.first().is_none_or(Vec::is_empty) {
                break;
            }
            append_planar(&mut output, chunk);
        }

        for channel in &mut output {
            channel.drain(..delay.min(channel.len()));
            channel.truncate(expected);
        }

        let out_frames = output[0].len();
        let mut samples = Vec::with_capacity(out_frames * channels);
        for frame in 0..out_frames {
            for channel in &output {
                samples.push(channel.get(frame).copied().unwrap_or(0.0));
            }
        }

        Ok(Self::new(samples, target_rate, self.channels))
    }

    /// Mix down to mono and resample, the shape speech services expect
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encoding` if resampling fails
    pub fn conform(&self, sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        self.with_channels(channels).resample(sample_rate)
    }
}

fn append_planar(output: &mut [Vec<f32>], chunk: Vec<Vec<f32>>) {
    for (out, resampled) in output.iter_mut().zip(chunk) {
        out.extend(resampled);
    }
}
