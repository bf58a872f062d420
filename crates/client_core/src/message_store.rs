use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use shared::domain::{
    ConversationKey, DeliveryState, Message, MessageId, UserId, TEMP_ID_PREFIX,
};
use tracing::{debug, warn};

static TEMP_ID_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_temp_id(now: DateTime<Utc>) -> MessageId {
    let seq = TEMP_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    MessageId(format!("{TEMP_ID_PREFIX}{}-{seq}", now.timestamp_millis()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingDraft {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The optimistic entry was swapped for the confirmed one at `index`.
    Replaced { index: usize },
    /// A push echo already carried the confirmed id; the optimistic entry was dropped.
    AlreadyPresent,
    /// No optimistic entry existed; the confirmed message went through `merge`.
    Merged,
}

/// Messages of one conversation, unique by id and ordered by `created_at`
/// ascending. Equal timestamps keep insertion order.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_key: ConversationKey,
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new(conversation_key: ConversationKey) -> Self {
        Self {
            conversation_key,
            messages: Vec::new(),
        }
    }

    pub fn conversation_key(&self) -> &ConversationKey {
        &self.conversation_key
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Adds every message whose id is not already present and returns how many
    /// were added. Merging the same batch twice changes nothing.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) -> usize {
        let mut seen: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();
        let mut added = 0;

        for message in incoming {
            if message.conversation_key != self.conversation_key {
                warn!(
                    store = %self.conversation_key,
                    message_conversation = %message.conversation_key,
                    message_id = %message.id,
                    "store: dropping message for another conversation"
                );
                continue;
            }

            if !seen.insert(message.id.clone()) {
                if message.read {
                    if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                        if !existing.read {
                            existing.read = true;
                            existing.updated_at = message.updated_at.or(existing.updated_at);
                        }
                    }
                }
                continue;
            }

            self.messages.push(message);
            added += 1;
        }

        if added > 0 {
            self.messages.sort_by_key(|m| m.created_at);
        }
        added
    }

    /// Inserts a local draft at the tail and returns its temporary id.
    pub fn append_optimistic(&mut self, draft: OutgoingDraft) -> MessageId {
        let id = next_temp_id(draft.created_at);
        self.messages.push(Message {
            id: id.clone(),
            conversation_key: self.conversation_key.clone(),
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            body: draft.body,
            created_at: draft.created_at,
            updated_at: None,
            read: false,
            delivery_state: DeliveryState::Optimistic,
        });
        id
    }

    pub fn reconcile(&mut self, temp_id: &MessageId, mut confirmed: Message) -> ReconcileOutcome {
        confirmed.delivery_state = DeliveryState::Confirmed;

        let Some(index) = self.position(temp_id) else {
            debug!(
                temp_id = %temp_id,
                id = %confirmed.id,
                "store: reconcile target missing, merging"
            );
            self.merge([confirmed]);
            return ReconcileOutcome::Merged;
        };

        if self.position(&confirmed.id).is_some() {
            self.messages.remove(index);
            return ReconcileOutcome::AlreadyPresent;
        }

        self.messages[index] = confirmed;

        let before_ok = index == 0
            || self.messages[index - 1].created_at <= self.messages[index].created_at;
        let after_ok = index + 1 >= self.messages.len()
            || self.messages[index].created_at <= self.messages[index + 1].created_at;
        if before_ok && after_ok {
            return ReconcileOutcome::Replaced { index };
        }

        // Server clock disagreed with ours enough to cross a neighbour.
        let id = self.messages[index].id.clone();
        self.messages.sort_by_key(|m| m.created_at);
        let index = self.position(&id).unwrap_or(index);
        debug!(id = %id, index, "store: reconciled message moved to server timestamp order");
        ReconcileOutcome::Replaced { index }
    }

    /// Keeps the entry so the failure stays visible and can be retried.
    pub fn mark_failed(&mut self, temp_id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == temp_id) {
            Some(message) if message.delivery_state == DeliveryState::Optimistic => {
                message.delivery_state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Puts a failed entry back into the optimistic state for a manual resend.
    pub fn mark_retrying(&mut self, temp_id: &MessageId) -> Option<&Message> {
        let message = self.messages.iter_mut().find(|m| &m.id == temp_id)?;
        if message.delivery_state != DeliveryState::Failed {
            return None;
        }
        message.delivery_state = DeliveryState::Optimistic;
        Some(message)
    }

    /// Flags every message received from `counterpart` as read.
    pub fn mark_incoming_read(&mut self, counterpart: &UserId, at: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.is_from(counterpart) && !m.read)
        {
            message.read = true;
            message.updated_at = Some(at);
            changed += 1;
        }
        changed
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
