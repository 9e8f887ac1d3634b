//! Keyed conversation store with per-user exclusive access
//!
//! Each user's [`Conversation`] sits behind its own FIFO `tokio` mutex so
//! exchanges for one user run strictly one after another while different
//! users never contend. The map itself is a plain `std` mutex held only for
//! lookups.
//!
//! Retention is bounded three ways: the per-conversation turn cap, an idle
//! expiry, and an LRU cap on live conversations. Conversations currently
//! locked by an exchange are never evicted.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::OwnedMutexGuard;

use super::{Conversation, Turn};

/// Retention limits for the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionLimits {
    /// Turns kept per conversation
    pub max_turns: usize,
    /// Conversations unused this long are dropped
    pub idle_expiry: Duration,
    /// Upper bound on live conversations
    pub max_conversations: NonZeroUsize,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            max_turns: 40,
            idle_expiry: Duration::from_secs(30 * 60),
            max_conversations: NonZeroUsize::new(10_000).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

struct Entry {
    conversation: Arc<tokio::sync::Mutex<Conversation>>,
    last_used: Instant,
}

impl Entry {
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.conversation) > 1
    }
}

/// Per-user conversations
pub struct ConversationStore {
    entries: Mutex<LruCache<String, Entry>>,
    limits: RetentionLimits,
}

impl ConversationStore {
    /// Create an empty store
    #[must_use]
    pub fn new(limits: RetentionLimits) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            limits,
        }
    }

    /// Retention limits in effect
    #[must_use]
    pub const fn limits(&self) -> &RetentionLimits {
        &self.limits
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock a user's conversation, creating it on first use
    ///
    /// Waiters are served in arrival order. The guard keeps the conversation
    /// alive and exempt from eviction until dropped.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<Conversation> {
        self.handle(user_id).lock_owned().await
    }

    fn handle(&self, user_id: &str) -> Arc<tokio::sync::Mutex<Conversation>> {
        let now = Instant::now();
        let mut entries = self.entries();
        self.evict_idle(&mut entries, now);

        if let Some(entry) = entries.get_mut(user_id) {
            entry.last_used = now;
            return Arc::clone(&entry.conversation);
        }

        let conversation = Arc::new(tokio::sync::Mutex::new(Conversation::new(
            user_id,
            self.limits.max_turns,
        )));
        entries.put(
            user_id.to_string(),
            Entry {
                conversation: Arc::clone(&conversation),
                last_used: now,
            },
        );
        tracing::debug!(user_id, live = entries.len(), "conversation created");

        self.enforce_cap(&mut entries);
        conversation
    }

    fn evict_idle(&self, entries: &mut LruCache<String, Entry>, now: Instant) {
        // Least recently used first; stop at the first fresh entry
        let expired: Vec<String> = entries
            .iter()
            .rev()
            .take_while(|(_, e)| now.duration_since(e.last_used) >= self.limits.idle_expiry)
            .filter(|(_, e)| !e.in_use())
            .map(|(k, _)| k.clone())
            .collect();

        for user_id in expired {
            entries.pop(&user_id);
            tracing::debug!(user_id, "conversation expired");
        }
    }

    fn enforce_cap(&self, entries: &mut LruCache<String, Entry>) {
        let excess = entries
            .len()
            .saturating_sub(self.limits.max_conversations.get());
        if excess == 0 {
            return;
        }

        let victims: Vec<String> = entries
            .iter()
            .rev()
            .filter(|(_, e)| !e.in_use())
            .take(excess)
            .map(|(k, _)| k.clone())
            .collect();

        for user_id in victims {
            entries.pop(&user_id);
            tracing::debug!(user_id, "conversation evicted (capacity)");
        }
    }

    /// Forget a user's history
    ///
    /// Waits for any exchange in flight for that user. Returns whether a
    /// conversation existed.
    pub async fn clear(&self, user_id: &str) -> bool {
        let handle = self
            .entries()
            .peek(user_id)
            .map(|e| Arc::clone(&e.conversation));

        match handle {
            Some(conversation) => {
                conversation.lock().await.clear();
                true
            }
            None => false,
        }
    }

    /// Snapshot of a user's turns, if the conversation is live
    pub async fn history(&self, user_id: &str) -> Option<Vec<Turn>> {
        let handle = self
            .entries()
            .peek(user_id)
            .map(|e| Arc::clone(&e.conversation))?;

        let conversation = handle.lock().await;
        Some(conversation.turns().cloned().collect())
    }

    /// Whether a conversation is live for this user
    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        self.entries().contains(user_id)
    }

    /// Number of live conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no conversation is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(RetentionLimits::default())
    }
}
