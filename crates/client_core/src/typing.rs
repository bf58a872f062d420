use std::time::Duration;

use shared::domain::UserId;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingTimer {
    pub generation: u64,
    pub deadline: Instant,
}

/// Typing indicator for the active conversation's counterpart. Every remote
/// typing event restarts the quiet period; only the newest timer may clear it.
#[derive(Debug, Clone)]
pub struct TypingSignal {
    counterpart: Option<UserId>,
    quiet_period: Duration,
    typing_until: Option<Instant>,
    generation: u64,
}

impl TypingSignal {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            counterpart: None,
            quiet_period,
            typing_until: None,
            generation: 0,
        }
    }

    pub fn counterpart(&self) -> Option<&UserId> {
        self.counterpart.as_ref()
    }

    pub fn set_counterpart(&mut self, counterpart: Option<UserId>) {
        if self.counterpart != counterpart {
            self.counterpart = counterpart;
            self.reset();
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing_until.is_some()
    }

    /// Peer to notify for a local keystroke, if any. The send action never
    /// counts as typing.
    pub fn on_keystroke(&self, is_send_action: bool) -> Option<&UserId> {
        if is_send_action {
            return None;
        }
        self.counterpart.as_ref()
    }

    pub fn on_remote_typing(&mut self, sender_id: &UserId, now: Instant) -> Option<TypingTimer> {
        if self.counterpart.as_ref() != Some(sender_id) {
            return None;
        }
        self.generation += 1;
        let deadline = now + self.quiet_period;
        self.typing_until = Some(deadline);
        Some(TypingTimer {
            generation: self.generation,
            deadline,
        })
    }

    /// Clears the indicator if `generation` is still the newest timer.
    pub fn expire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.typing_until.is_none() {
            return false;
        }
        self.typing_until = None;
        true
    }

    /// The counterpart sent a message, so it stopped typing.
    pub fn on_peer_sent(&mut self, sender_id: &UserId) -> bool {
        if self.counterpart.as_ref() != Some(sender_id) || !self.is_typing() {
            return false;
        }
        self.reset();
        true
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.typing_until = None;
    }
}
