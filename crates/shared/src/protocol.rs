use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::{Attachment, CallType, ConversationId, DeliveryState, UserId},
    error::ChannelErrorCode,
};

/// A participant or sender as it appears on the wire: a bare id, an object
/// carrying `_id`/`id`, or something unrecognised.
///
/// Only JSON objects become [`ParticipantRef::Object`]; arrays, booleans and
/// other shapes land in [`ParticipantRef::Other`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParticipantRef {
    Id(String),
    Number(i64),
    Object(ParticipantObject),
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantObject {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Box<ParticipantRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<ParticipantRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl From<Value> for ParticipantRef {
    fn from(value: Value) -> Self {
        match value {
            Value::String(id) => Self::Id(id),
            Value::Number(number) => match number.as_i64() {
                Some(id) => Self::Number(id),
                None => Self::Other(Value::Number(number)),
            },
            Value::Object(mut map) => {
                let mut nested = |key: &str| match map.remove(key) {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(Box::new(Self::from(value))),
                };
                let object_id = nested("_id");
                let id = nested("id");
                let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
                Self::Object(ParticipantObject {
                    object_id,
                    id,
                    username: text(map.get("username")),
                    display_name: text(map.get("displayName")),
                })
            }
            other => Self::Other(other),
        }
    }
}

impl<'de> Deserialize<'de> for ParticipantRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<&str> for ParticipantRef {
    fn from(value: &str) -> Self {
        Self::Id(value.to_string())
    }
}

impl From<&UserId> for ParticipantRef {
    fn from(value: &UserId) -> Self {
        Self::Id(value.0.clone())
    }
}

/// Message payload as delivered by the history endpoint, the send endpoint
/// or a `new_message` push frame. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ParticipantRef>,
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circle_id: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<ParticipantRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_state: Option<DeliveryState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: RawMessage,
}

/// Call setup signal. Only the signaling envelope is carried; no media path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    End,
}

/// Frames the client writes to the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Register {
        user_id: UserId,
    },
    JoinRoom {
        conversation_id: ConversationId,
    },
    LeaveRoom {
        conversation_id: ConversationId,
    },
    Signal {
        to: UserId,
        call_type: CallType,
        signal: CallSignal,
    },
}

/// Frames the server pushes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: RawMessage,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Signal {
        from: UserId,
        call_type: CallType,
        signal: CallSignal,
    },
    ConversationCleared {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared_by: Option<UserId>,
    },
    BlockUpdated {
        conversation_id: ConversationId,
        #[serde(default)]
        blocked_by: Vec<UserId>,
    },
    ChannelError {
        code: ChannelErrorCode,
        #[serde(default)]
        message: String,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
