//! Speech services
//!
//! Transcription turns learner audio into text; synthesis renders the
//! tutor's reply as audio. Both wrap a pluggable backend with a
//! [`RetryPolicy`](crate::retry::RetryPolicy).

mod stt;
mod tts;

pub use stt::{
    DeepgramTranscriber, Transcriber, TranscriptionClient, TranscriptionError,
    TranscriptionResult, WhisperTranscriber, parse_deepgram_response, parse_whisper_response,
};
pub use tts::{
    ElevenLabsSynthesizer, OpenAiSynthesizer, SynthesisClient, SynthesisError, SynthesizedAudio,
    Synthesizer, VoiceProfile, sanitize_for_speech, strip_markdown,
};
