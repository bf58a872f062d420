use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{Message, MessageId, UserId};
use tracing::{debug, info};

use crate::{
    error::{SyncError, SyncResult},
    message_store::{MessageStore, OutgoingDraft, ReconcileOutcome},
};

/// Lifecycle of one locally initiated send once it leaves the input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: MessageId,
    pub receiver_id: UserId,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SendPipeline {
    local_user: UserId,
    states: HashMap<MessageId, SendState>,
}

impl SendPipeline {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, temp_id: &MessageId) -> Option<SendState> {
        self.states.get(temp_id).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == SendState::Pending)
            .count()
    }

    /// Appends the optimistic entry and hands back what the durable write needs.
    pub fn submit(
        &mut self,
        raw_body: &str,
        store: &mut MessageStore,
        now: DateTime<Utc>,
    ) -> SyncResult<PendingSend> {
        let body = raw_body.trim();
        if body.is_empty() {
            return Err(SyncError::InvalidInput("message body is empty".into()));
        }

        let receiver_id = store.conversation_key().clone();
        let temp_id = store.append_optimistic(OutgoingDraft {
            sender_id: self.local_user.clone(),
            receiver_id: receiver_id.clone(),
            body: body.to_string(),
            created_at: now,
        });
        self.states.insert(temp_id.clone(), SendState::Pending);
        debug!(temp_id = %temp_id, to = %receiver_id, "send: optimistic message appended");

        Ok(PendingSend {
            temp_id,
            receiver_id,
            body: body.to_string(),
        })
    }

    pub fn confirm(
        &mut self,
        temp_id: &MessageId,
        confirmed: Message,
        store: &mut MessageStore,
    ) -> ReconcileOutcome {
        let id = confirmed.id.clone();
        self.states.insert(temp_id.clone(), SendState::Confirmed);
        let outcome = store.reconcile(temp_id, confirmed);
        info!(temp_id = %temp_id, id = %id, ?outcome, "send: delivery confirmed");
        outcome
    }

    pub fn fail(&mut self, temp_id: &MessageId, store: &mut MessageStore) -> bool {
        if self.state(temp_id) != Some(SendState::Pending) {
            return false;
        }
        self.states.insert(temp_id.clone(), SendState::Failed);
        store.mark_failed(temp_id)
    }

    /// Manual resend of a failed message under the same temporary id.
    pub fn retry(&mut self, temp_id: &MessageId, store: &mut MessageStore) -> Option<PendingSend> {
        if self.state(temp_id) != Some(SendState::Failed) {
            return None;
        }
        let message = store.mark_retrying(temp_id)?;
        let pending = PendingSend {
            temp_id: temp_id.clone(),
            receiver_id: message.receiver_id.clone(),
            body: message.body.clone(),
        };
        self.states.insert(temp_id.clone(), SendState::Pending);
        Some(pending)
    }
}
