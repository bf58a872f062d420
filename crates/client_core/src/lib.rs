pub mod backend;
pub mod config;
pub mod error;
pub mod inbox;
pub mod message_store;
pub mod pagination;
pub mod presence;
pub mod pusher;
pub mod read_receipts;
pub mod send_pipeline;
pub mod session;
pub mod session_store;
pub mod subscriptions;
pub mod typing;

use shared::domain::{ConversationKey, MessageId, PresenceEntry};

pub use backend::{BackendApi, HttpBackend};
pub use config::{load_settings, ClientSettings};
pub use error::{SyncError, SyncResult};
pub use inbox::InboxRow;
pub use pusher::PusherTransport;
pub use session::{ChatSession, CounterpartView};
pub use session_store::{
    AccessToken, FileSessionStore, MemorySessionStore, SessionSnapshot, SessionStore,
};
pub use subscriptions::{PushTransport, SubscriptionState, TransportFrame};

/// Everything a front-end re-renders on. Conversation-scoped variants carry
/// the key so views for other conversations can ignore them.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    InboxUpdated(Vec<InboxRow>),
    PresenceChanged(Vec<PresenceEntry>),
    MessagesUpdated {
        conversation: ConversationKey,
    },
    ScrollToLatest {
        conversation: ConversationKey,
    },
    HistoryExhausted {
        conversation: ConversationKey,
    },
    CounterpartResolved(CounterpartView),
    TypingChanged {
        conversation: ConversationKey,
        typing: bool,
    },
    MessageDelivered {
        temp_id: MessageId,
        id: MessageId,
    },
    SendFailed {
        temp_id: MessageId,
        reason: String,
    },
    SubscriptionStateChanged(SubscriptionState),
    Error(String),
    LoggedOut,
}

#[cfg(test)]
#[path = "tests/fakes.rs"]
mod fakes;
