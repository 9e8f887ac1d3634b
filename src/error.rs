//! Error types for Charla gateway

use thiserror::Error;

/// Result type alias for Charla operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the plumbing around the exchange pipeline
///
/// Failures of the pipeline components themselves are typed per component
/// (see [`crate::audio::CodecError`], [`crate::voice::TranscriptionError`],
/// [`crate::dialogue::DialogueError`], [`crate::voice::SynthesisError`]) and
/// are converted into replies by the exchange orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (including missing credentials at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Audio error outside of an exchange (CLI tools)
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification of every failure the pipeline can observe
///
/// Drives how the orchestrator answers the user: a decode failure is the only
/// kind that ends an exchange without a reply bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Inbound audio could not be decoded; fatal for the exchange, never retried
    DecodingFailure,
    /// Timeout or unavailable service; retried once, then degraded
    TransientServiceFailure,
    /// Service refused the content; mapped to a safe fallback reply
    ContentRejection,
    /// Input the services cannot handle; answered with a clarification
    UnsupportedInput,
    /// Service refused the request itself (credentials, malformed request);
    /// never retried, answered with an apology
    ServiceRejection,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DecodingFailure => "decoding_failure",
            Self::TransientServiceFailure => "transient_service_failure",
            Self::ContentRejection => "content_rejection",
            Self::UnsupportedInput => "unsupported_input",
            Self::ServiceRejection => "service_rejection",
        };
        f.write_str(s)
    }
}
