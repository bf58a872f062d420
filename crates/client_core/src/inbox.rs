use std::collections::HashMap;

use shared::{
    domain::{ConversationKey, ConversationSummary, Message, UserId, UserProfile},
    protocol::InboxItem,
};
use tracing::debug;

use crate::presence::PresenceTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRow {
    pub summary: ConversationSummary,
    pub unread_for_me: bool,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxChange {
    Inserted,
    Updated,
    /// The message is older than the summary's last message.
    Unchanged,
}

/// Conversation summaries sorted by last message, newest first.
#[derive(Debug, Clone)]
pub struct InboxAggregator {
    local_user: UserId,
    summaries: Vec<ConversationSummary>,
    friends: Vec<UserProfile>,
}

impl InboxAggregator {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            summaries: Vec::new(),
            friends: Vec::new(),
        }
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn friends(&self) -> &[UserProfile] {
        &self.friends
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|s| &s.conversation_key == key)
    }

    pub fn unread_count(&self) -> usize {
        self.summaries
            .iter()
            .filter(|s| s.unread_for_me(&self.local_user))
            .count()
    }

    pub fn set_friends(&mut self, friends: Vec<UserProfile>) {
        self.friends = friends;
    }

    /// Folds a REST snapshot in. Summaries created by pushes that raced ahead
    /// of the snapshot keep whichever last message is newer.
    pub fn load_snapshot(&mut self, items: Vec<InboxItem>) {
        let mut by_key: HashMap<ConversationKey, ConversationSummary> = self
            .summaries
            .drain(..)
            .map(|s| (s.conversation_key.clone(), s))
            .collect();

        for item in items {
            let key = item.participant.id.clone();
            let last_message = item.last_message.into_message(&self.local_user);
            match by_key.get_mut(&key) {
                Some(existing) => {
                    existing.participant = item.participant;
                    if last_message.created_at >= existing.last_message.created_at {
                        existing.last_message = merge_read(last_message, &existing.last_message);
                    }
                }
                None => {
                    by_key.insert(
                        key.clone(),
                        ConversationSummary {
                            conversation_key: key,
                            participant: item.participant,
                            last_message,
                        },
                    );
                }
            }
        }

        self.summaries = by_key.into_values().collect();
        self.sort();
    }

    pub fn apply_message(&mut self, message: &Message) -> InboxChange {
        let key = &message.conversation_key;
        let change = match self.summaries.iter_mut().find(|s| &s.conversation_key == key) {
            Some(existing) => {
                if message.created_at < existing.last_message.created_at {
                    return InboxChange::Unchanged;
                }
                existing.last_message = merge_read(message.clone(), &existing.last_message);
                InboxChange::Updated
            }
            None => {
                let participant = self
                    .friends
                    .iter()
                    .find(|f| &f.id == key)
                    .cloned()
                    .unwrap_or_else(|| UserProfile::unresolved(key.clone()));
                debug!(conversation = %key, "inbox: new conversation from live message");
                self.summaries.insert(
                    0,
                    ConversationSummary {
                        conversation_key: key.clone(),
                        participant,
                        last_message: message.clone(),
                    },
                );
                InboxChange::Inserted
            }
        };
        self.sort();
        change
    }

    pub fn set_participant(&mut self, profile: UserProfile) -> bool {
        match self
            .summaries
            .iter_mut()
            .find(|s| s.conversation_key == profile.id)
        {
            Some(summary) if summary.participant != profile => {
                summary.participant = profile;
                true
            }
            _ => false,
        }
    }

    /// Applies a successful mark-read for `key`.
    pub fn mark_read(&mut self, key: &ConversationKey) -> bool {
        let Some(summary) = self.summaries.iter_mut().find(|s| &s.conversation_key == key) else {
            return false;
        };
        if summary.last_message.is_from(&self.local_user) || summary.last_message.read {
            return false;
        }
        summary.last_message.read = true;
        true
    }

    pub fn rows(&self, presence: &PresenceTracker) -> Vec<InboxRow> {
        self.summaries
            .iter()
            .map(|summary| {
                let id = &summary.participant.id;
                let online = if presence.has_snapshot() {
                    presence.is_online(id)
                } else {
                    summary.participant.is_online
                };
                InboxRow {
                    unread_for_me: summary.unread_for_me(&self.local_user),
                    online,
                    summary: summary.clone(),
                }
            })
            .collect()
    }

    fn sort(&mut self) {
        self.summaries
            .sort_by(|a, b| b.last_message.created_at.cmp(&a.last_message.created_at));
    }
}

/// Re-delivery of the same message must not undo a local mark-read.
fn merge_read(mut incoming: Message, existing: &Message) -> Message {
    if incoming.id == existing.id && existing.read {
        incoming.read = true;
    }
    incoming
}

#[cfg(test)]
#[path = "tests/inbox_tests.rs"]
mod tests;
