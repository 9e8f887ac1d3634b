//! Charla Gateway - Spanish conversation tutor for messaging clients
//!
//! This library provides the core functionality for the Charla gateway:
//! - Audio decoding, resampling and encoding
//! - Speech recognition and synthesis clients
//! - A tutor dialogue engine with bounded per-user history
//! - The exchange orchestrator that ties them into one reply per message
//! - A Telegram adapter and the gateway that serializes work per user
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Messaging client                     │
//! │              Telegram (long polling)                 │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ChannelEvent
//! ┌────────────────────▼────────────────────────────────┐
//! │                     Gateway                          │
//! │   per-user workers  │  staleness  │  cancellation   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ InboundMessage
//! ┌────────────────────▼────────────────────────────────┐
//! │               Exchange orchestrator                  │
//! │   Codec  │  STT  │  Dialogue (LLM)  │  TTS          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod channels;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod http;
pub mod persona;
pub mod retry;
pub mod voice;

pub use config::Config;
pub use error::{Error, FailureKind, Result};
pub use exchange::{ExchangeOrchestrator, ExchangeOutcome, ExchangeStatus, InboundMessage, ReplyBundle};
pub use gateway::{Gateway, GatewaySettings};
pub use persona::TutorPersona;
