//! Generative-language backends

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Prompt, Role};
use crate::http::{self, HttpFailure};
use crate::retry::RetryableError;
use crate::{Error, FailureKind, Result};

/// Failures of the dialogue step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogueError {
    /// Service unreachable, overloaded or returned an empty answer
    #[error("dialogue service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No answer within the attempt timeout
    #[error("dialogue service timed out after {0:?}")]
    Timeout(Duration),

    /// The service refused the content on policy grounds
    #[error("dialogue content rejected: {0}")]
    ContentPolicyRejection(String),

    /// The request itself was refused (bad credentials, malformed request)
    #[error("dialogue request rejected: {0}")]
    Rejected(String),
}

impl DialogueError {
    /// Failure classification used by the orchestrator
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::ServiceUnavailable(_) | Self::Timeout(_) => FailureKind::TransientServiceFailure,
            Self::Rejected(_) => FailureKind::ServiceRejection,
            Self::ContentPolicyRejection(_) => FailureKind::ContentRejection,
        }
    }
}

impl RetryableError for DialogueError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<HttpFailure> for DialogueError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Unavailable(msg) => Self::ServiceUnavailable(msg),
            HttpFailure::TimedOut(after) => Self::Timeout(after),
            HttpFailure::Rejected { status, body } => Self::Rejected(format!("{status}: {body}")),
        }
    }
}

/// A generative-language service producing the tutor's next turn
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Produce a reply for `prompt`
    async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, DialogueError>;
}

/// Google Gemini `generateContent` backend
pub struct GeminiModel {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    timeout: Duration,
    max_output_tokens: u32,
}

impl GeminiModel {
    /// Default Gemini model
    pub const DEFAULT_MODEL: &'static str = "gemini-2.0-flash";

    /// Create a Gemini backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Google AI API key required for Gemini".to_string()));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout,
            max_output_tokens: 1024,
        })
    }

    /// Point at a different API root (proxies, tests)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    system_instruction: GeminiContentOut<'a>,
    contents: Vec<GeminiContentOut<'a>>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContentOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPartOut<'a>>,
}

#[derive(Serialize)]
struct GeminiPartOut<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContentIn>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentIn {
    #[serde(default)]
    parts: Vec<GeminiPartIn>,
}

#[derive(Deserialize)]
struct GeminiPartIn {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

/// Finish reasons Gemini uses when it withholds an answer
const GEMINI_BLOCK_REASONS: &[&str] = &[
    "SAFETY",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "RECITATION",
];

/// Extract the reply text from a Gemini `generateContent` response body
///
/// # Errors
///
/// Returns `ContentPolicyRejection` for blocked prompts or candidates and
/// `ServiceUnavailable` for unparseable or empty responses
pub fn parse_gemini_response(body: &str) -> std::result::Result<String, DialogueError> {
    let response: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| DialogueError::ServiceUnavailable(format!("invalid Gemini response: {e}")))?;

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(DialogueError::ContentPolicyRejection(format!("prompt blocked: {reason}")));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| DialogueError::ServiceUnavailable("Gemini returned no candidates".to_string()))?;

    if let Some(reason) = candidate
        .finish_reason
        .as_deref()
        .filter(|r| GEMINI_BLOCK_REASONS.contains(r))
    {
        return Err(DialogueError::ContentPolicyRejection(format!("reply blocked: {reason}")));
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(DialogueError::ServiceUnavailable("Gemini returned empty text".to_string()));
    }

    Ok(text.trim().to_string())
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, DialogueError> {
        let request = GeminiRequest {
            system_instruction: GeminiContentOut {
                role: None,
                parts: vec![GeminiPartOut {
                    text: &prompt.system,
                }],
            },
            contents: prompt
                .turns
                .iter()
                .map(|turn| GeminiContentOut {
                    role: Some(match turn.role {
                        Role::User => "user",
                        Role::Assistant => "model",
                    }),
                    parts: vec![GeminiPartOut { text: &turn.text }],
                })
                .collect(),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        tracing::debug!(model = %self.model, turns = prompt.turns.len(), "calling Gemini");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        if !status.is_success() {
            tracing::warn!(status = %status, "Gemini API error");
            return Err(http::classify_status(status, &body).into());
        }

        parse_gemini_response(&body)
    }
}

/// OpenAI-compatible chat-completions backend
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiChatModel {
    /// Default chat model
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Create a chat-completions backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String, timeout: Duration) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for chat".to_string()));
        }

        Ok(Self {
            client: http::client_with_timeout(timeout),
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            timeout,
        })
    }

    /// Point at a different OpenAI-compatible API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageOut<'a>>,
}

#[derive(Serialize)]
struct ChatMessageOut<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageIn>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageIn {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatErrorBody {
    error: ChatErrorDetail,
}

#[derive(Deserialize)]
struct ChatErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

/// Extract the reply text from a chat-completions response body
///
/// # Errors
///
/// Returns `ContentPolicyRejection` when the reply was filtered and
/// `ServiceUnavailable` for unparseable or empty responses
pub fn parse_chat_response(body: &str) -> std::result::Result<String, DialogueError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| DialogueError::ServiceUnavailable(format!("invalid chat response: {e}")))?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| DialogueError::ServiceUnavailable("chat returned no choices".to_string()))?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(DialogueError::ContentPolicyRejection(
            "reply filtered by provider".to_string(),
        ));
    }

    let text = choice.message.and_then(|m| m.content).unwrap_or_default();
    if text.trim().is_empty() {
        return Err(DialogueError::ServiceUnavailable("chat returned empty text".to_string()));
    }

    Ok(text.trim().to_string())
}

/// Whether an error body from a chat-completions API is a policy refusal
fn is_policy_error(body: &str) -> Option<String> {
    let parsed: ChatErrorBody = serde_json::from_str(body).ok()?;
    let code = parsed.error.code?;
    matches!(code.as_str(), "content_policy_violation" | "content_filter")
        .then(|| parsed.error.message.unwrap_or(code))
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, prompt: &Prompt) -> std::result::Result<String, DialogueError> {
        let mut messages = Vec::with_capacity(prompt.turns.len() + 1);
        messages.push(ChatMessageOut {
            role: "system",
            content: &prompt.system,
        });
        messages.extend(prompt.turns.iter().map(|turn| ChatMessageOut {
            role: turn.role.as_str(),
            content: &turn.text,
        }));

        let request = ChatRequest {
            model: &self.model,
            messages,
        };

        tracing::debug!(model = %self.model, turns = prompt.turns.len(), "calling chat completions");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| http::classify_error(&e, self.timeout))?;

        if !status.is_success() {
            if let Some(message) = is_policy_error(&body) {
                return Err(DialogueError::ContentPolicyRejection(message));
            }
            tracing::warn!(status = %status, "chat completions API error");
            return Err(http::classify_status(status, &body).into());
        }

        parse_chat_response(&body)
    }
}
