use shared::{domain::MessageId, error::EventDecodeError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{operation} failed: {reason}")]
    Network {
        operation: &'static str,
        reason: String,
    },
    #[error("subscription to {channel} failed: {reason}")]
    Subscription { channel: String, reason: String },
    #[error("message {temp_id} was not delivered: {reason}")]
    Delivery { temp_id: MessageId, reason: String },
    #[error("response arrived after its context was replaced")]
    StaleContext,
    #[error("no session credential available")]
    NotAuthenticated,
    #[error(transparent)]
    MalformedEvent(#[from] EventDecodeError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    pub fn network(operation: &'static str, reason: impl ToString) -> Self {
        Self::Network {
            operation,
            reason: reason.to_string(),
        }
    }

    pub fn subscription(channel: impl Into<String>, reason: impl ToString) -> Self {
        Self::Subscription {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    /// Failures that only degrade functionality and leave merged state valid.
    pub fn is_degraded_mode(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Subscription { .. } | Self::Delivery { .. }
        )
    }

    /// The backend rejected the bearer credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Network { reason, .. } if reason.starts_with("HTTP 401"))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
