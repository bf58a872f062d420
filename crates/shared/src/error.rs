use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the backend alongside non-2xx statuses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("event {event} on {channel} has an invalid payload: {reason}")]
    InvalidPayload {
        channel: String,
        event: String,
        reason: String,
    },
}

impl EventDecodeError {
    pub fn invalid(channel: &str, event: &str, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            channel: channel.to_string(),
            event: event.to_string(),
            reason: reason.to_string(),
        }
    }
}
