//! Tutor persona configuration
//!
//! A persona is a static text preamble plus a few behavioral toggles. The
//! dialogue engine consumes it verbatim when composing prompts; the canned
//! replies the orchestrator falls back to live here too so they share the
//! persona's voice.

use serde::{Deserialize, Serialize};

/// Default instructional preamble for the Spanish tutor
const DEFAULT_PREAMBLE: &str = "You are a friendly Spanish tutor chatting with a learner \
through voice and text messages. Your role is to help them practice and learn Spanish. \
Respond naturally to what they say and ALWAYS respond in Spanish. Keep in mind that they \
will make mistakes. Avoid starting with generic greetings or filler phrases such as \
\"¡Hola!\", \"¡Qué interesante!\" or \"¡Excelente pregunta!\". Provide detailed, \
informative responses of at least three or four complete sentences, explain concepts \
thoroughly and give examples when relevant.";

/// Spanish-tutor persona consumed by the dialogue engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TutorPersona {
    /// Display name used in logs
    pub name: String,

    /// Fixed instructions prepended to every prompt
    pub preamble: String,

    /// Point out and fix the learner's mistakes
    pub corrections: bool,

    /// End every reply with a follow-up question
    pub follow_up_questions: bool,

    /// Weave in cultural notes when relevant
    pub cultural_notes: bool,

    /// Hard cap on reply length in characters
    pub max_reply_chars: usize,

    /// Canned replies for the paths that do not reach the model
    pub replies: CannedReplies,
}

/// In-persona replies used when the pipeline cannot produce a model answer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CannedReplies {
    /// Speech was not recognized
    pub clarification: String,
    /// A service failed and the exchange degraded to text
    pub apology: String,
    /// The model refused the content
    pub deflection: String,
    /// Inbound audio could not be decoded
    pub decode_error: String,
    /// Inbound audio was too long
    pub too_long: String,
    /// Conversation history was cleared on request
    pub history_cleared: String,
}

impl Default for CannedReplies {
    fn default() -> Self {
        Self {
            clarification: "No pude entender tu mensaje de voz. ¿Puedes repetirlo, por favor?"
                .to_string(),
            apology: "Lo siento, ahora mismo no puedo responder. Inténtalo de nuevo en un momento."
                .to_string(),
            deflection: "Prefiero no hablar de ese tema. ¿Qué tal si practicamos con otra cosa? \
                Cuéntame, ¿qué hiciste hoy?"
                .to_string(),
            decode_error: "No pude procesar el audio que enviaste. ¿Puedes enviarlo de nuevo o \
                escribir tu mensaje?"
                .to_string(),
            too_long: "Tu mensaje de voz es demasiado largo. ¿Puedes enviarlo en partes más cortas?"
                .to_string(),
            history_cleared: "¡Historial de conversación borrado! Empecemos de nuevo.".to_string(),
        }
    }
}

impl Default for TutorPersona {
    fn default() -> Self {
        Self {
            name: "Profe".to_string(),
            preamble: DEFAULT_PREAMBLE.to_string(),
            corrections: true,
            follow_up_questions: true,
            cultural_notes: true,
            max_reply_chars: 2000,
            replies: CannedReplies::default(),
        }
    }
}

impl TutorPersona {
    /// Full system instructions: preamble followed by the enabled behaviors
    #[must_use]
    pub fn system_prompt(&self) -> String {
        let mut prompt = self.preamble.trim().to_string();
        let mut rules = Vec::new();

        if self.corrections {
            rules.push(
                "When the learner makes grammar, vocabulary or spelling mistakes, point them out \
                 briefly and show the corrected sentence before continuing.",
            );
        }
        if self.cultural_notes {
            rules.push(
                "Include cultural context from Spanish-speaking countries when it is relevant.",
            );
        }
        if self.follow_up_questions {
            rules.push("Always end with an engaging follow-up question.");
        }

        for rule in rules {
            prompt.push_str("\n- ");
            prompt.push_str(rule);
        }

        if self.max_reply_chars > 0 {
            prompt.push_str(&format!(
                "\n- Never exceed {} characters.",
                self.max_reply_chars
            ));
        }

        prompt
    }

    /// Cut `reply` to the persona's character cap on a sentence or word boundary
    #[must_use]
    pub fn clamp_reply(&self, reply: &str) -> String {
        let reply = reply.trim();
        if self.max_reply_chars == 0 || reply.chars().count() <= self.max_reply_chars {
            return reply.to_string();
        }

        let prefix = |chars: usize| {
            let cut = reply
                .char_indices()
                .nth(chars)
                .map_or(reply.len(), |(idx, _)| idx);
            &reply[..cut]
        };

        // Prefer the last sentence end in the second half
        let head = prefix(self.max_reply_chars);
        if let Some(idx) = head
            .rfind(|c: char| matches!(c, '.' | '!' | '?'))
            .filter(|&idx| idx >= head.len() / 2)
        {
            return head[..=idx].trim_end().to_string();
        }

        // Otherwise the last space, leaving room for the ellipsis
        let head = prefix(self.max_reply_chars - 1);
        let kept = head
            .rfind(char::is_whitespace)
            .map(|idx| head[..idx].trim_end())
            .filter(|kept| !kept.is_empty())
            .unwrap_or(head);
        format!("{kept}…")
    }
}
