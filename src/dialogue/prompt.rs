//! Prompt composition

use super::{Conversation, Role, Turn};
use crate::persona::TutorPersona;

/// What is sent to the language model for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Persona preamble with enabled behaviors; always present
    pub system: String,
    /// Most recent turns, oldest first, ending with the learner's message
    pub turns: Vec<Turn>,
}

impl Prompt {
    /// Build a prompt from the persona and the last `window` turns
    ///
    /// Older turns are dropped first; the preamble is never dropped. A window
    /// of zero is treated as one so the current message is always included.
    #[must_use]
    pub fn compose(persona: &TutorPersona, conversation: &Conversation, window: usize) -> Self {
        let window = window.max(1);
        let skip = conversation.len().saturating_sub(window);

        Self {
            system: persona.system_prompt(),
            turns: conversation.turns().skip(skip).cloned().collect(),
        }
    }

    /// The learner message this prompt asks about
    #[must_use]
    pub fn latest_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }

    /// Plain-text rendering with the preamble and a labeled history
    #[must_use]
    pub fn to_transcript(&self) -> String {
        let mut out = self.system.clone();
        out.push_str("\n\nConversation history:\n");
        for turn in &self.turns {
            let label = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}
