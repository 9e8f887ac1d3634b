//! Exchange pipeline integration tests
//!
//! Runs the orchestrator against mock speech and dialogue backends

use std::sync::atomic::Ordering;
use std::time::Duration;

use charla_gateway::audio::{AudioFormat, CodecError};
use charla_gateway::dialogue::{DialogueError, Role};
use charla_gateway::voice::{SynthesisError, TranscriptionError, TranscriptionResult};
use charla_gateway::{ExchangeOutcome, ExchangeStatus, InboundMessage, ReplyBundle};
use tokio_util::sync::CancellationToken;

mod common;
use common::{Harness, MockModel, MockSynthesizer, MockTranscriber, tone_wav};

fn voice_note() -> InboundMessage {
    InboundMessage::Voice {
        bytes: tone_wav(1.0),
        format: AudioFormat::Wav,
    }
}

fn expect_reply(outcome: ExchangeOutcome) -> ReplyBundle {
    match outcome {
        ExchangeOutcome::Reply(bundle) => bundle,
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_voice_exchange_returns_text_and_audio() {
    let harness = Harness::new(
        MockTranscriber::hearing("Hola, quiero practicar"),
        MockModel::scripted(vec![Ok("¡Claro! ¿De qué quieres hablar?".to_string())]),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run("ana", voice_note(), &CancellationToken::new())
            .await,
    );

    assert_eq!(bundle.status, ExchangeStatus::Complete);
    assert_eq!(bundle.text, "¡Claro! ¿De qué quieres hablar?");
    assert_eq!(bundle.format, AudioFormat::Wav);
    let audio = bundle.audio.expect("reply audio");
    assert_eq!(&audio[..4], b"RIFF");

    let history = harness
        .orchestrator
        .dialogue()
        .store()
        .history("ana")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "Hola, quiero practicar");
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn test_unrecognized_speech_asks_for_clarification() {
    let harness = Harness::new(
        MockTranscriber::scripted(vec![Err(TranscriptionError::UnrecognizedSpeech)]),
        MockModel::echo(),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run("ana", voice_note(), &CancellationToken::new())
            .await,
    );

    assert_eq!(bundle.status, ExchangeStatus::Clarification);
    assert_eq!(bundle.text, harness.persona().replies.clarification);
    assert!(!bundle.has_audio());
    assert_eq!(harness.model.calls(), 0);
    assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 1);

    let history = harness.orchestrator.dialogue().store().history("ana").await;
    assert!(history.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_low_confidence_counts_as_unrecognized() {
    let harness = Harness::new(
        MockTranscriber::scripted(vec![Ok(TranscriptionResult {
            text: "mmm".to_string(),
            confidence: 0.05,
        })]),
        MockModel::echo(),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run("ana", voice_note(), &CancellationToken::new())
            .await,
    );
    assert_eq!(bundle.status, ExchangeStatus::Clarification);
    assert_eq!(harness.model.calls(), 0);
}

#[tokio::test]
async fn test_synthesis_failure_degrades_to_text() {
    let harness = Harness::new(
        MockTranscriber::hearing("¿Qué tiempo hace?"),
        MockModel::scripted(vec![Ok("Hace sol y calor.".to_string())]),
        MockSynthesizer::failing(SynthesisError::ServiceUnavailable("503".to_string())),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run("ana", voice_note(), &CancellationToken::new())
            .await,
    );

    assert_eq!(bundle.status, ExchangeStatus::Degraded);
    assert_eq!(bundle.text, "Hace sol y calor.");
    assert!(bundle.audio.is_none());
    // One retry, then give up
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 2);

    // The reply still counts as a completed turn
    let history = harness
        .orchestrator
        .dialogue()
        .store()
        .history("ana")
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_same_user_exchanges_are_serialized() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo().with_delay(Duration::from_millis(50)),
        MockSynthesizer::working(),
    );
    let cancel = CancellationToken::new();

    let first = harness
        .orchestrator
        .run("ana", InboundMessage::Text("uno".to_string()), &cancel);
    let second = harness
        .orchestrator
        .run("ana", InboundMessage::Text("dos".to_string()), &cancel);
    let (first, second) = tokio::join!(first, second);

    assert_eq!(expect_reply(first).text, "Dijiste: uno");
    assert_eq!(expect_reply(second).text, "Dijiste: dos");

    let prompts = harness.model.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0].turns.len(), 1);
    // The second exchange saw the first one's completed turns
    assert_eq!(prompts[1].turns.len(), 3);
    assert_eq!(prompts[1].turns[1].text, "Dijiste: uno");

    let history = harness
        .orchestrator
        .dialogue()
        .store()
        .history("ana")
        .await
        .unwrap();
    let roles: Vec<Role> = history.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn test_different_users_do_not_share_history() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo(),
        MockSynthesizer::working(),
    );
    let cancel = CancellationToken::new();

    for user in ["ana", "luis"] {
        harness
            .orchestrator
            .run(user, InboundMessage::Text(format!("soy {user}")), &cancel)
            .await;
    }

    let prompts = harness.model.prompts.lock().unwrap().clone();
    assert_eq!(prompts[1].turns.len(), 1);
    assert_eq!(prompts[1].latest_user_text(), Some("soy luis"));
}

#[tokio::test]
async fn test_content_rejection_deflects_without_assistant_turn() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::scripted(vec![Err(DialogueError::ContentPolicyRejection(
            "SAFETY".to_string(),
        ))]),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run(
                "ana",
                InboundMessage::Text("algo prohibido".to_string()),
                &CancellationToken::new(),
            )
            .await,
    );

    assert_eq!(bundle.status, ExchangeStatus::Deflected);
    assert_eq!(bundle.text, harness.persona().replies.deflection);
    assert!(!bundle.has_audio());
    // Rejections are not retried
    assert_eq!(harness.model.calls(), 1);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 0);

    let history = harness
        .orchestrator
        .dialogue()
        .store()
        .history("ana")
        .await
        .unwrap();
    assert!(history.iter().all(|t| t.role == Role::User));
}

#[tokio::test]
async fn test_model_outage_apologizes_after_one_retry() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::scripted(vec![
            Err(DialogueError::ServiceUnavailable("overloaded".to_string())),
            Err(DialogueError::ServiceUnavailable("overloaded".to_string())),
        ]),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run(
                "ana",
                InboundMessage::Text("hola".to_string()),
                &CancellationToken::new(),
            )
            .await,
    );

    assert_eq!(bundle.status, ExchangeStatus::Apology);
    assert_eq!(bundle.text, harness.persona().replies.apology);
    assert_eq!(harness.model.calls(), 2);
}

#[tokio::test]
async fn test_undecodable_audio_yields_notice() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo(),
        MockSynthesizer::working(),
    );

    let outcome = harness
        .orchestrator
        .run(
            "ana",
            InboundMessage::Voice {
                bytes: b"definitely not a wav file".to_vec(),
                format: AudioFormat::Wav,
            },
            &CancellationToken::new(),
        )
        .await;

    let ExchangeOutcome::DecodeFailed { notice, error } = outcome else {
        panic!("expected a decode failure, got {outcome:?}");
    };
    assert_eq!(notice, harness.persona().replies.decode_error);
    assert!(!matches!(error, CodecError::InputTooLarge { .. }));
    assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.model.calls(), 0);
}

#[tokio::test]
async fn test_blank_text_is_not_sent_to_the_model() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo(),
        MockSynthesizer::working(),
    );

    let bundle = expect_reply(
        harness
            .orchestrator
            .run(
                "ana",
                InboundMessage::Text("   ".to_string()),
                &CancellationToken::new(),
            )
            .await,
    );
    assert_eq!(bundle.status, ExchangeStatus::Clarification);
    assert_eq!(harness.model.calls(), 0);
}

#[tokio::test]
async fn test_cancelled_exchange_is_abandoned() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo().with_delay(Duration::from_secs(5)),
        MockSynthesizer::working(),
    );
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let outcome = harness
        .orchestrator
        .run("ana", InboundMessage::Text("hola".to_string()), &cancel)
        .await;

    assert_eq!(outcome, ExchangeOutcome::Abandoned);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 0);

    // The lock is released once the exchange is abandoned
    let next = harness
        .orchestrator
        .run(
            "ana",
            InboundMessage::Text("otra vez".to_string()),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(next, ExchangeOutcome::Reply(_)));
}

#[tokio::test]
async fn test_cancelled_synthesis_retracts_reply() {
    let harness = Harness::new(
        MockTranscriber::hearing("unused"),
        MockModel::echo(),
        MockSynthesizer::working().with_delay(Duration::from_secs(5)),
    );
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = harness
        .orchestrator
        .run("ana", InboundMessage::Text("hola".to_string()), &cancel)
        .await;

    assert_eq!(outcome, ExchangeOutcome::Abandoned);
    assert_eq!(harness.model.calls(), 1);
    assert_eq!(harness.synthesizer.calls.load(Ordering::SeqCst), 1);

    // Only the learner turn survives, ready to absorb the next message
    let history = harness
        .orchestrator
        .dialogue()
        .store()
        .history("ana")
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "hola");
}
