use std::collections::HashSet;

use shared::domain::{ConversationKey, Message, UserId};

/// Single-flight bookkeeping for mark-read requests. A trigger that arrives
/// while a request is in flight is remembered and replayed once it finishes.
#[derive(Debug, Clone, Default)]
pub struct ReadReceiptSync {
    in_flight: HashSet<ConversationKey>,
    rerun: HashSet<ConversationKey>,
}

impl ReadReceiptSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live message warrants a receipt only when it is incoming and its
    /// conversation is the one on screen.
    pub fn should_sync_on_push(
        active: Option<&ConversationKey>,
        message: &Message,
        local_user: &UserId,
    ) -> bool {
        active == Some(&message.conversation_key) && !message.is_from(local_user)
    }

    pub fn begin(&mut self, key: &ConversationKey) -> bool {
        if self.in_flight.contains(key) {
            self.rerun.insert(key.clone());
            return false;
        }
        self.in_flight.insert(key.clone());
        true
    }

    /// Returns whether another request should be issued for `key`.
    pub fn complete(&mut self, key: &ConversationKey) -> bool {
        self.in_flight.remove(key);
        self.rerun.remove(key)
    }

    pub fn is_in_flight(&self, key: &ConversationKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.rerun.clear();
    }
}
