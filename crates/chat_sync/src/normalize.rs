use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryState, Message, MessageId, UserId},
    protocol::RawMessage,
};
use uuid::Uuid;

use crate::identity::{resolve_identity, resolve_raw};

/// Prefix for ids minted when a payload carries no id at all.
pub const ANONYMOUS_ID_PREFIX: &str = "anon-";

/// Conversion into the canonical [`Message`] record.
///
/// `conversation_id` is the conversation the payload was fetched or
/// delivered for; it is used when the payload does not name one itself.
pub trait Normalize {
    fn normalize(self, conversation_id: &ConversationId) -> Message;
}

impl Normalize for Message {
    fn normalize(self, _conversation_id: &ConversationId) -> Message {
        self
    }
}

impl Normalize for RawMessage {
    fn normalize(self, conversation_id: &ConversationId) -> Message {
        let id = self
            .id
            .as_ref()
            .and_then(resolve_raw)
            .or_else(|| self.object_id.as_ref().and_then(resolve_raw))
            .unwrap_or_else(|| format!("{ANONYMOUS_ID_PREFIX}{}", Uuid::new_v4()));

        let payload_conversation = [&self.conversation_id, &self.chat_id, &self.circle_id]
            .into_iter()
            .flatten()
            .find_map(resolve_raw);

        let sender_id = [&self.sender, &self.sender_id]
            .into_iter()
            .flatten()
            .map(resolve_identity)
            .find(|user| !user.is_unknown())
            .unwrap_or_else(UserId::unknown);

        let read_by: BTreeSet<_> = self
            .read_by
            .unwrap_or_default()
            .iter()
            .map(resolve_identity)
            .filter(|user| !user.is_unknown())
            .collect();

        Message {
            id: MessageId(id),
            conversation_id: payload_conversation
                .map(ConversationId)
                .unwrap_or_else(|| conversation_id.clone()),
            sender_id,
            text: self.text.unwrap_or_default(),
            attachments: self.attachments.or(self.media).unwrap_or_default(),
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            delivery_state: self.delivery_state.unwrap_or(DeliveryState::Confirmed),
            read_by,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
