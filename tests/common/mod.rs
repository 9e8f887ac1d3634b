//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use charla_gateway::audio::{AudioCodec, AudioFormat, Waveform};
use charla_gateway::channels::{AudioAttachment, Channel};
use charla_gateway::dialogue::{DialogueEngine, DialogueError, LanguageModel, Prompt, RetentionLimits};
use charla_gateway::retry::RetryPolicy;
use charla_gateway::voice::{
    SynthesisClient, SynthesisError, SynthesizedAudio, Synthesizer, Transcriber,
    TranscriptionClient, TranscriptionError, TranscriptionResult, VoiceProfile,
};
use charla_gateway::{ExchangeOrchestrator, ReplyBundle, TutorPersona};
use tokio::sync::Mutex;

/// One second of a quiet 440 Hz tone as WAV bytes
#[must_use]
pub fn tone_wav(seconds: f32) -> Vec<u8> {
    let rate = 16_000_u32;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..(rate as f32 * seconds) as usize)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.3)
        .collect();
    AudioCodec::default()
        .encode(&Waveform::new(samples, rate, 1), AudioFormat::Wav)
        .expect("encode tone")
}

/// Fast policy so failure scenarios do not wait on real backoff
#[must_use]
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        jitter: 0.0,
        attempt_timeout: Duration::from_millis(500),
        ..RetryPolicy::default()
    }
}

/// Transcriber returning queued results, then repeating the last one
pub struct MockTranscriber {
    results: std::sync::Mutex<VecDeque<Result<TranscriptionResult, TranscriptionError>>>,
    last: Result<TranscriptionResult, TranscriptionError>,
    pub calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn hearing(text: &str) -> Self {
        Self::scripted(vec![Ok(TranscriptionResult {
            text: text.to_string(),
            confidence: 0.9,
        })])
    }

    pub fn scripted(results: Vec<Result<TranscriptionResult, TranscriptionError>>) -> Self {
        let last = results
            .last()
            .cloned()
            .unwrap_or(Err(TranscriptionError::UnrecognizedSpeech));
        Self {
            results: std::sync::Mutex::new(results.into()),
            last,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    fn name(&self) -> &'static str {
        "mock-stt"
    }

    async fn transcribe(
        &self,
        _wav: &[u8],
        _language: &str,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.last.clone())
    }
}

/// Language model answering from a script, echoing once it runs out
pub struct MockModel {
    script: std::sync::Mutex<VecDeque<Result<String, DialogueError>>>,
    delay: Duration,
    pub prompts: std::sync::Mutex<Vec<Prompt>>,
}

impl MockModel {
    pub fn echo() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Result<String, DialogueError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into()),
            delay: Duration::ZERO,
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &'static str {
        "mock-llm"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, DialogueError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Ok(format!(
                "Dijiste: {}",
                prompt.latest_user_text().unwrap_or_default()
            ))
        })
    }
}

/// Synthesizer returning a short WAV tone, or always failing
pub struct MockSynthesizer {
    failure: Option<SynthesisError>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl MockSynthesizer {
    pub fn working() -> Self {
        Self {
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: SynthesisError) -> Self {
        Self {
            failure: Some(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    fn name(&self) -> &'static str {
        "mock-tts"
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceProfile,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(SynthesizedAudio {
                bytes: tone_wav(0.25),
                format: AudioFormat::Wav,
            }),
        }
    }
}

/// Pipeline wired to mocks
pub struct Harness {
    pub transcriber: Arc<MockTranscriber>,
    pub model: Arc<MockModel>,
    pub synthesizer: Arc<MockSynthesizer>,
    pub orchestrator: Arc<ExchangeOrchestrator>,
}

impl Harness {
    pub fn new(transcriber: MockTranscriber, model: MockModel, synthesizer: MockSynthesizer) -> Self {
        Self::with_retention(transcriber, model, synthesizer, RetentionLimits::default())
    }

    pub fn with_retention(
        transcriber: MockTranscriber,
        model: MockModel,
        synthesizer: MockSynthesizer,
        retention: RetentionLimits,
    ) -> Self {
        let transcriber = Arc::new(transcriber);
        let model = Arc::new(model);
        let synthesizer = Arc::new(synthesizer);

        let dialogue = DialogueEngine::new(model.clone(), Arc::new(TutorPersona::default()))
            .with_retry_policy(fast_policy())
            .with_retention(retention);
        let orchestrator = ExchangeOrchestrator::new(
            AudioCodec::default(),
            TranscriptionClient::new(transcriber.clone()).with_retry_policy(fast_policy()),
            dialogue,
            SynthesisClient::new(synthesizer.clone()).with_retry_policy(fast_policy()),
            VoiceProfile::default(),
        );

        Self {
            transcriber,
            model,
            synthesizer,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn persona(&self) -> &TutorPersona {
        self.orchestrator.dialogue().persona()
    }
}

/// What a [`MockChannel`] was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Reply { chat_id: String, bundle: ReplyBundle },
    Notice { chat_id: String, text: String },
}

impl Sent {
    pub fn text(&self) -> &str {
        match self {
            Self::Reply { bundle, .. } => &bundle.text,
            Self::Notice { text, .. } => text,
        }
    }
}

/// Channel that records deliveries and serves attachments from memory
pub struct MockChannel {
    pub sent: Arc<Mutex<Vec<Sent>>>,
    pub audio: Vec<u8>,
    pub downloads: AtomicUsize,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            audio: tone_wav(1.0),
            downloads: AtomicUsize::new(0),
        }
    }

    pub async fn sent(&self) -> Vec<Sent> {
        self.sent.lock().await.clone()
    }

    /// Wait until at least `count` items were sent
    pub async fn wait_for(&self, count: usize) -> Vec<Sent> {
        for _ in 0..200 {
            let sent = self.sent().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent().await
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&mut self) -> charla_gateway::Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> charla_gateway::Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn download(&self, _attachment: &AudioAttachment) -> charla_gateway::Result<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(self.audio.clone())
    }

    async fn deliver(&self, chat_id: &str, bundle: &ReplyBundle) -> charla_gateway::Result<()> {
        self.sent.lock().await.push(Sent::Reply {
            chat_id: chat_id.to_string(),
            bundle: bundle.clone(),
        });
        Ok(())
    }

    async fn notify(&self, chat_id: &str, text: &str) -> charla_gateway::Result<()> {
        self.sent.lock().await.push(Sent::Notice {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}
