//! Per-user conversation history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The learner
    User,
    /// The tutor
    Assistant,
}

impl Role {
    /// Lowercase name as used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message within a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker
    pub role: Role,
    /// Message text
    pub text: String,
    /// When the turn was recorded
    pub timestamp: DateTime<Utc>,
}

/// Upper bound on a merged user turn; the newest text is kept
pub const MAX_MERGED_CHARS: usize = 4_000;

/// Where a conversation is in the request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Nothing in flight; the last attempt failed or nothing was asked yet
    Idle,
    /// A user turn was recorded and the model has been called
    AwaitingModelResponse,
    /// The last user turn has an assistant reply
    Ready,
}

/// Ordered, bounded turn history for one user
///
/// Turns strictly alternate between user and assistant. A user turn that
/// never got a reply (the model failed) absorbs the next user message instead
/// of being followed by a second user turn.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    turns: VecDeque<Turn>,
    max_turns: usize,
    state: ConversationState,
}

impl Conversation {
    /// Create an empty conversation keeping at most `max_turns` turns (minimum 2)
    #[must_use]
    pub fn new(id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            id: id.into(),
            turns: VecDeque::new(),
            max_turns: max_turns.max(2),
            state: ConversationState::Idle,
        }
    }

    /// Stable user identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Turns, oldest first
    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &Turn> + ExactSizeIterator {
        self.turns.iter()
    }

    /// Number of recorded turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turn has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Most recent turn
    #[must_use]
    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Retention bound
    #[must_use]
    pub const fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Current cycle state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConversationState) {
        self.state = state;
    }

    /// Record a learner message
    pub fn push_user(&mut self, text: &str) {
        self.push(Role::User, text);
    }

    /// Record a tutor reply
    pub fn push_assistant(&mut self, text: &str) {
        self.push(Role::Assistant, text);
    }

    /// Drop the latest tutor reply so the learner turn stays unanswered
    pub(crate) fn retract_reply(&mut self) -> bool {
        let retracted = self
            .turns
            .back()
            .is_some_and(|last| last.role == Role::Assistant);
        if retracted {
            self.turns.pop_back();
        }
        self.state = ConversationState::Idle;
        retracted
    }

    /// Forget every turn
    pub fn clear(&mut self) {
        self.turns.clear();
        self.state = ConversationState::Idle;
    }

    fn push(&mut self, role: Role, text: &str) {
        let now = Utc::now();

        if let Some(last) = self.turns.back_mut()
            && last.role == role
        {
            last.text.push('\n');
            last.text.push_str(text);
            let excess = last.text.chars().count().saturating_sub(MAX_MERGED_CHARS);
            if excess > 0 {
                let cut = last
                    .text
                    .char_indices()
                    .nth(excess)
                    .map_or(last.text.len(), |(idx, _)| idx);
                last.text.drain(..cut);
            }
            last.timestamp = last.timestamp.max(now);
            return;
        }

        let timestamp = self.turns.back().map_or(now, |last| last.timestamp.max(now));
        self.turns.push_back(Turn {
            role,
            text: text.to_string(),
            timestamp,
        });

        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Check the alternation and ordering invariants
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.turns
            .iter()
            .zip(self.turns.iter().skip(1))
            .all(|(a, b)| a.role != b.role && a.timestamp <= b.timestamp)
    }
}
