use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{conversation_key_for, DeliveryState, Message, MessageId, UserId, UserProfile},
    error::EventDecodeError,
};

pub const NEW_MESSAGE_EVENT: &str = "new-message";
pub const TYPING_EVENT_PREFIX: &str = "client-typing-";
pub const SENT_EVENT_PREFIX: &str = "client-sent-";
pub const SUBSCRIPTION_SUCCEEDED_EVENTS: [&str; 2] = [
    "pusher_internal:subscription_succeeded",
    "pusher:subscription_succeeded",
];
pub const MEMBER_ADDED_EVENTS: [&str; 2] = ["pusher_internal:member_added", "pusher:member_added"];
pub const MEMBER_REMOVED_EVENTS: [&str; 2] =
    ["pusher_internal:member_removed", "pusher:member_removed"];

/// Response envelope used by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "message")]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
}

impl WireMessage {
    pub fn into_message(self, local_user: &UserId) -> Message {
        Message {
            conversation_key: conversation_key_for(local_user, &self.sender_id, &self.receiver_id),
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body,
            created_at: self.created_at,
            updated_at: self.updated_at,
            read: self.is_read,
            delivery_state: DeliveryState::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageBody {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    #[serde(rename = "_id")]
    pub id: String,
    pub participant: UserProfile,
    pub last_message: WireMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MemberInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

impl MemberInfo {
    fn into_member(self, id: UserId) -> PresenceMember {
        PresenceMember {
            name: self.name.unwrap_or_else(|| id.0.clone()),
            id,
            avatar: self.avatar,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MemberAddedPayload {
    #[serde(deserialize_with = "user_id_from_any")]
    user_id: UserId,
    #[serde(default)]
    user_info: MemberInfo,
}

#[derive(Debug, Deserialize)]
struct MemberRemovedPayload {
    #[serde(deserialize_with = "user_id_from_any")]
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct SubscriptionSucceededPayload {
    #[serde(default)]
    presence: PresenceData,
}

#[derive(Debug, Default, Deserialize)]
struct PresenceData {
    #[serde(default)]
    ids: Vec<Value>,
    #[serde(default)]
    hash: HashMap<String, MemberInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerSignalPayload {
    sender_id: UserId,
}

fn user_id_from_any<'de, D>(deserializer: D) -> Result<UserId, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(UserId(s)),
        Value::Number(n) => Ok(UserId(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number user id, got {other}"
        ))),
    }
}

/// The closed set of live events the core reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage(WireMessage),
    Typing { sender_id: UserId },
    PeerSent { sender_id: UserId },
    PresenceSnapshot(Vec<PresenceMember>),
    MemberAdded(PresenceMember),
    MemberRemoved { id: UserId },
}

/// One event as delivered by the broker, with `data` already parsed when the
/// broker sent it as an encoded string.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPushFrame {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

impl RawPushFrame {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::String(encoded) => {
                serde_json::from_str(&encoded).unwrap_or(Value::String(encoded))
            }
            other => other,
        };
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, EventDecodeError> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| EventDecodeError::invalid(&self.channel, &self.event, err))
    }
}

/// Channel names for one identity, used to route raw frames to [`PushEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub local_user: UserId,
    pub user_channel: String,
    pub presence_channel: String,
    pub signal_channel: String,
}

impl ChannelNames {
    pub fn new(
        local_user: UserId,
        user_channel_prefix: &str,
        presence_channel: impl Into<String>,
        signal_channel: impl Into<String>,
    ) -> Self {
        Self {
            user_channel: format!("{user_channel_prefix}{local_user}"),
            local_user,
            presence_channel: presence_channel.into(),
            signal_channel: signal_channel.into(),
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [
            self.user_channel.as_str(),
            self.presence_channel.as_str(),
            self.signal_channel.as_str(),
        ]
    }

    pub fn typing_event_for(peer: &UserId) -> String {
        format!("{TYPING_EVENT_PREFIX}{peer}")
    }

    pub fn sent_event_for(peer: &UserId) -> String {
        format!("{SENT_EVENT_PREFIX}{peer}")
    }

    /// `Ok(None)` means the frame is not addressed to this identity or is not
    /// one of the events the core understands.
    pub fn decode(&self, frame: &RawPushFrame) -> Result<Option<PushEvent>, EventDecodeError> {
        let event = frame.event.as_str();

        if frame.channel == self.user_channel {
            if event == NEW_MESSAGE_EVENT {
                return frame
                    .payload::<WireMessage>()
                    .map(|message| Some(PushEvent::NewMessage(message)));
            }
            return Ok(None);
        }

        if frame.channel == self.presence_channel {
            if SUBSCRIPTION_SUCCEEDED_EVENTS.contains(&event) {
                let payload: SubscriptionSucceededPayload = frame.payload()?;
                return Ok(Some(PushEvent::PresenceSnapshot(snapshot_members(
                    payload.presence,
                ))));
            }
            if MEMBER_ADDED_EVENTS.contains(&event) {
                let payload: MemberAddedPayload = frame.payload()?;
                return Ok(Some(PushEvent::MemberAdded(
                    payload.user_info.into_member(payload.user_id),
                )));
            }
            if MEMBER_REMOVED_EVENTS.contains(&event) {
                let payload: MemberRemovedPayload = frame.payload()?;
                return Ok(Some(PushEvent::MemberRemoved {
                    id: payload.user_id,
                }));
            }
            return Ok(None);
        }

        if frame.channel == self.signal_channel {
            if let Some(target) = event.strip_prefix(TYPING_EVENT_PREFIX) {
                if target != self.local_user.as_str() {
                    return Ok(None);
                }
                let payload: PeerSignalPayload = frame.payload()?;
                return Ok(Some(PushEvent::Typing {
                    sender_id: payload.sender_id,
                }));
            }
            if let Some(target) = event.strip_prefix(SENT_EVENT_PREFIX) {
                if target != self.local_user.as_str() {
                    return Ok(None);
                }
                let payload: PeerSignalPayload = frame.payload()?;
                return Ok(Some(PushEvent::PeerSent {
                    sender_id: payload.sender_id,
                }));
            }
        }

        Ok(None)
    }
}

fn snapshot_members(presence: PresenceData) -> Vec<PresenceMember> {
    let PresenceData { ids, mut hash } = presence;
    let mut members = Vec::with_capacity(ids.len().max(hash.len()));
    for raw in ids {
        let id = match raw {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let info = hash.remove(&id).unwrap_or_default();
        members.push(info.into_member(UserId(id)));
    }
    let mut rest: Vec<_> = hash.into_iter().collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));
    members.extend(rest.into_iter().map(|(id, info)| info.into_member(UserId(id))));
    members
}
