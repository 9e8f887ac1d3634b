//! Dialogue engine
//!
//! Owns every user's [`Conversation`] and produces the tutor's next turn by
//! calling a [`LanguageModel`] with a prompt composed from the persona and a
//! bounded window of recent turns.
//!
//! A call to [`DialogueSession::respond`] records the learner's turn first.
//! The assistant turn is recorded only when the model answers; on failure the
//! learner's turn stays unanswered and is merged with the next message.

mod conversation;
mod model;
mod prompt;
mod store;

use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

pub use conversation::{Conversation, ConversationState, Role, Turn};
pub use model::{
    DialogueError, GeminiModel, LanguageModel, OpenAiChatModel, parse_chat_response,
    parse_gemini_response,
};
pub use prompt::Prompt;
pub use store::{ConversationStore, RetentionLimits};

use crate::persona::TutorPersona;
use crate::retry::RetryPolicy;

/// Turns sent to the model when no window is configured
pub const DEFAULT_CONTEXT_WINDOW: usize = 12;

/// The tutor's answer to one learner message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueReply {
    /// Reply text, already clamped to the persona's length cap
    pub text: String,
    /// Model calls made, including retries
    pub attempts: u32,
    /// Whether the model's text was cut to fit the cap
    pub truncated: bool,
}

/// Produces tutor replies and keeps per-user history
pub struct DialogueEngine {
    model: Arc<dyn LanguageModel>,
    persona: Arc<TutorPersona>,
    policy: RetryPolicy,
    context_window: usize,
    store: ConversationStore,
}

impl DialogueEngine {
    /// Create an engine with default retention and context window
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, persona: Arc<TutorPersona>) -> Self {
        Self {
            model,
            persona,
            policy: RetryPolicy::default(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            store: ConversationStore::default(),
        }
    }

    /// Set the retry policy for model calls
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set how many recent turns are sent to the model
    #[must_use]
    pub const fn with_context_window(mut self, turns: usize) -> Self {
        self.context_window = turns;
        self
    }

    /// Set retention limits (replaces the store; call before use)
    #[must_use]
    pub fn with_retention(mut self, limits: RetentionLimits) -> Self {
        self.store = ConversationStore::new(limits);
        self
    }

    /// Persona in use
    #[must_use]
    pub fn persona(&self) -> &TutorPersona {
        &self.persona
    }

    /// Backend name
    #[must_use]
    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Conversation store
    #[must_use]
    pub const fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Take exclusive access to a user's conversation
    ///
    /// Sessions for the same user are granted in request order. Hold the
    /// session for the whole exchange so concurrent messages cannot interleave.
    pub async fn session(&self, user_id: &str) -> DialogueSession<'_> {
        DialogueSession {
            engine: self,
            conversation: self.store.lock(user_id).await,
        }
    }

    /// One-shot respond for callers that do not need to hold the session
    ///
    /// # Errors
    ///
    /// Returns the model failure after the retry policy is exhausted
    pub async fn respond(
        &self,
        user_id: &str,
        input: &str,
    ) -> std::result::Result<DialogueReply, DialogueError> {
        self.session(user_id).await.respond(input).await
    }

    /// Drop a user's history
    pub async fn clear(&self, user_id: &str) -> bool {
        let cleared = self.store.clear(user_id).await;
        tracing::info!(user_id, cleared, "conversation history cleared");
        cleared
    }
}

/// Exclusive handle on one user's conversation
pub struct DialogueSession<'a> {
    engine: &'a DialogueEngine,
    conversation: OwnedMutexGuard<Conversation>,
}

impl DialogueSession<'_> {
    /// Read-only view of the conversation
    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Forget this user's history
    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    /// Take back the reply just recorded because it never reached the learner
    pub fn retract_reply(&mut self) -> bool {
        let retracted = self.conversation.retract_reply();
        if retracted {
            tracing::debug!(user_id = self.conversation.id(), "undelivered reply retracted");
        }
        retracted
    }

    /// Record `input` and ask the model for the next turn
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` or `Timeout` once retries are exhausted,
    /// and `ContentPolicyRejection` immediately. In every error case the
    /// learner's turn is kept and no assistant turn is added.
    pub async fn respond(
        &mut self,
        input: &str,
    ) -> std::result::Result<DialogueReply, DialogueError> {
        let engine = self.engine;

        self.conversation.push_user(input.trim());
        self.conversation
            .set_state(ConversationState::AwaitingModelResponse);

        let prompt = Prompt::compose(&engine.persona, &self.conversation, engine.context_window);
        let mut attempts = 0_u32;

        let outcome = engine
            .policy
            .run("dialogue", || {
                attempts += 1;
                engine.model.complete(&prompt)
            })
            .await;

        match outcome {
            Ok(text) => {
                let clamped = engine.persona.clamp_reply(&text);
                let truncated = clamped != text.trim();
                if truncated {
                    tracing::debug!(
                        user_id = self.conversation.id(),
                        chars = text.chars().count(),
                        "reply clamped to persona cap"
                    );
                }

                self.conversation.push_assistant(&clamped);
                self.conversation.set_state(ConversationState::Ready);

                Ok(DialogueReply {
                    text: clamped,
                    attempts,
                    truncated,
                })
            }
            Err(e) => {
                self.conversation.set_state(ConversationState::Idle);
                tracing::warn!(
                    user_id = self.conversation.id(),
                    model = engine.model.name(),
                    attempts,
                    kind = %e.kind(),
                    error = %e,
                    "dialogue failed"
                );
                Err(e)
            }
        }
    }
}

impl Drop for DialogueSession<'_> {
    // An abandoned model call must not leave the conversation waiting
    fn drop(&mut self) {
        if self.conversation.state() == ConversationState::AwaitingModelResponse {
            self.conversation.set_state(ConversationState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    struct Scripted {
        answers: Mutex<VecDeque<std::result::Result<String, DialogueError>>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(answers: Vec<std::result::Result<String, DialogueError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, DialogueError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("¿Algo más?".to_string()))
        }
    }

    fn engine(model: Arc<Scripted>) -> DialogueEngine {
        DialogueEngine::new(model, Arc::new(TutorPersona::default())).with_retry_policy(
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn test_success_appends_both_turns() {
        let model = Scripted::new(vec![Ok("¡Hola! ¿Cómo estás?".to_string())]);
        let engine = engine(Arc::clone(&model));

        let reply = engine.respond("ana", "hola").await.unwrap();
        assert_eq!(reply.text, "¡Hola! ¿Cómo estás?");
        assert_eq!(reply.attempts, 1);

        let session = engine.session("ana").await;
        assert_eq!(session.conversation().len(), 2);
        assert_eq!(session.conversation().state(), ConversationState::Ready);
        assert!(session.conversation().is_well_formed());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let model = Scripted::new(vec![
            Err(DialogueError::ServiceUnavailable("busy".to_string())),
            Ok("Bien.".to_string()),
        ]);
        let engine = engine(Arc::clone(&model));

        let reply = engine.respond("ana", "hola").await.unwrap();
        assert_eq!(reply.attempts, 2);
        // The learner turn is recorded once regardless of attempts
        let history = engine.store().history("ana").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_leaves_unanswered_user_turn() {
        let model = Scripted::new(vec![
            Err(DialogueError::ContentPolicyRejection("blocked".to_string())),
            Ok("Vale.".to_string()),
        ]);
        let engine = engine(Arc::clone(&model));

        let err = engine.respond("ana", "primero").await.unwrap_err();
        assert!(matches!(err, DialogueError::ContentPolicyRejection(_)));
        assert_eq!(model.prompts.lock().unwrap().len(), 1);

        {
            let session = engine.session("ana").await;
            assert_eq!(session.conversation().len(), 1);
            assert_eq!(session.conversation().state(), ConversationState::Idle);
        }

        engine.respond("ana", "segundo").await.unwrap();
        let history = engine.store().history("ana").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "primero\nsegundo");
        assert_eq!(history[0].role, Role::User);
    }

    struct Stalled;

    #[async_trait]
    impl LanguageModel for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn complete(&self, _prompt: &Prompt) -> std::result::Result<String, DialogueError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("Tarde.".to_string())
        }
    }

    #[tokio::test]
    async fn test_abandoned_call_returns_conversation_to_idle() {
        let engine = DialogueEngine::new(Arc::new(Stalled), Arc::new(TutorPersona::default()));

        {
            let mut session = engine.session("ana").await;
            let abandoned =
                tokio::time::timeout(Duration::from_millis(50), session.respond("hola")).await;
            assert!(abandoned.is_err());
        }

        let session = engine.session("ana").await;
        assert_eq!(session.conversation().state(), ConversationState::Idle);
        assert_eq!(session.conversation().len(), 1);
    }

    #[tokio::test]
    async fn test_retracted_reply_is_forgotten() {
        let model = Scripted::new(vec![Ok("¡Hola!".to_string())]);
        let engine = engine(model);

        {
            let mut session = engine.session("ana").await;
            session.respond("hola").await.unwrap();
            assert!(session.retract_reply());
        }

        let history = engine.store().history("ana").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_long_reply_is_clamped() {
        let long = "Palabra ".repeat(400);
        let model = Scripted::new(vec![Ok(long)]);
        let engine = engine(model);

        let reply = engine.respond("ana", "cuéntame algo").await.unwrap();
        assert!(reply.truncated);
        assert!(reply.text.chars().count() <= engine.persona().max_reply_chars);
    }

    #[tokio::test]
    async fn test_prompt_carries_preamble_and_window() {
        let model = Scripted::new(Vec::new());
        let engine = engine(Arc::clone(&model)).with_context_window(3);

        for i in 0..4 {
            engine.respond("ana", &format!("mensaje {i}")).await.unwrap();
        }

        let prompts = model.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert_eq!(last.system, engine.persona().system_prompt());
        assert_eq!(last.turns.len(), 3);
        assert_eq!(last.latest_user_text(), Some("mensaje 3"));
    }

    #[tokio::test]
    async fn test_clear_forgets_history() {
        let engine = engine(Scripted::new(Vec::new()));
        engine.respond("ana", "hola").await.unwrap();

        assert!(engine.clear("ana").await);
        assert!(engine.store().history("ana").await.unwrap().is_empty());
    }
}
