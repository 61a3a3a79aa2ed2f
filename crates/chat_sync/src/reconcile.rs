use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use shared::{
    domain::{Attachment, ConversationId, DeliveryState, Message, MessageId, UserId},
    protocol::RawMessage,
};
use tracing::{debug, info};

use crate::{cache::ConversationCache, log::ReplaceOutcome, normalize::Normalize};

pub const TEMP_ID_PREFIX: &str = "temp-";

/// Server ids never carry this prefix, so temporary ids cannot collide with them.
pub fn is_temporary_id(id: &MessageId) -> bool {
    id.as_str().starts_with(TEMP_ID_PREFIX)
}

#[derive(Debug, Default)]
pub struct TempIdGenerator {
    sequence: AtomicU64,
}

impl TempIdGenerator {
    pub fn next_id(&self) -> MessageId {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        MessageId(format!(
            "{TEMP_ID_PREFIX}{}-{sequence}",
            Utc::now().timestamp_millis()
        ))
    }
}

/// A locally originated message awaiting the send call's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Trimmed text that goes to the server.
    pub text: String,
    /// The input exactly as typed, restored to the compose field on failure.
    pub draft: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub message: Message,
    /// `None` when the conversation's log was evicted before the response arrived.
    pub outcome: Option<ReplaceOutcome>,
}

/// Optimistic send bookkeeping: `pending` then `confirmed` or `failed`.
///
/// A pushed copy of a pending message may confirm it before the send call
/// returns. Such sends move from `pending` to `echoed` until the call settles.
#[derive(Debug, Default)]
pub struct Reconciler {
    ids: TempIdGenerator,
    pending: Vec<PendingSend>,
    echoed: HashMap<MessageId, Message>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locally_originated(&self, id: &MessageId) -> bool {
        self.pending.iter().any(|pending| &pending.temp_id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSend> {
        self.pending.iter()
    }

    fn untrack(&mut self, temp_id: &MessageId) -> Option<PendingSend> {
        let position = self
            .pending
            .iter()
            .position(|pending| &pending.temp_id == temp_id)?;
        Some(self.pending.remove(position))
    }

    /// Inserts the optimistic entry at the end of the log and starts tracking it.
    pub fn begin(
        &mut self,
        cache: &mut ConversationCache,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        draft: &str,
        attachments: Vec<Attachment>,
    ) -> (PendingSend, Message) {
        let temp_id = self.ids.next_id();
        let text = draft.trim().to_string();
        let message = Message {
            id: temp_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            text: text.clone(),
            attachments,
            created_at: Some(Utc::now()),
            delivery_state: DeliveryState::Pending,
            read_by: Default::default(),
        };
        cache.append(conversation_id, message.clone());

        let pending = PendingSend {
            temp_id: temp_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            text,
            draft: draft.to_string(),
        };
        self.pending.push(pending.clone());
        debug!(conversation_id = %conversation_id, temp_id = %temp_id, "send: optimistic insert");
        (pending, message)
    }

    /// Resolves the oldest pending send that `message` is a pushed copy of:
    /// same conversation, same sender, same text. The server record takes the
    /// temporary entry's place. Returns the temporary id and the installed record.
    pub fn absorb_echo(
        &mut self,
        cache: &mut ConversationCache,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Option<(MessageId, Message)> {
        if is_temporary_id(&message.id) {
            return None;
        }
        let position = self.pending.iter().position(|pending| {
            &pending.conversation_id == conversation_id
                && pending.sender_id == message.sender_id
                && pending.text == message.text
        })?;
        let pending = self.pending.remove(position);

        let mut confirmed = message.clone();
        confirmed.delivery_state = DeliveryState::Confirmed;
        let outcome = cache.replace(conversation_id, &pending.temp_id, confirmed.clone());
        info!(
            conversation_id = %conversation_id,
            temp_id = %pending.temp_id,
            message_id = %confirmed.id,
            ?outcome,
            "send: confirmed by pushed copy"
        );
        self.echoed.insert(pending.temp_id.clone(), confirmed.clone());
        Some((pending.temp_id, confirmed))
    }

    /// Installs the server record in place of the temporary entry.
    ///
    /// After [`Reconciler::absorb_echo`] the temporary entry is already gone,
    /// so the outcome is [`ReplaceOutcome::Duplicate`] when both name the same id.
    pub fn confirm(
        &mut self,
        cache: &mut ConversationCache,
        pending: &PendingSend,
        server_message: RawMessage,
    ) -> Confirmation {
        self.untrack(&pending.temp_id);
        self.echoed.remove(&pending.temp_id);
        let mut message = server_message.normalize(&pending.conversation_id);
        message.delivery_state = DeliveryState::Confirmed;

        let outcome = cache.replace(&pending.conversation_id, &pending.temp_id, message.clone());
        info!(
            conversation_id = %pending.conversation_id,
            temp_id = %pending.temp_id,
            message_id = %message.id,
            ?outcome,
            "send: confirmed"
        );
        Confirmation { message, outcome }
    }

    /// Takes the record a pushed copy already installed for this send, if any.
    pub fn take_echoed(&mut self, pending: &PendingSend) -> Option<Message> {
        self.echoed.remove(&pending.temp_id)
    }

    /// Rolls back the temporary entry. Returns the draft to restore.
    pub fn fail(&mut self, cache: &mut ConversationCache, pending: &PendingSend) -> String {
        self.untrack(&pending.temp_id);
        cache.remove(&pending.conversation_id, &pending.temp_id);
        info!(
            conversation_id = %pending.conversation_id,
            temp_id = %pending.temp_id,
            "send: failed, optimistic entry removed"
        );
        pending.draft.clone()
    }

    /// Drops all tracking; later confirmations and failures become no-ops.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.echoed.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
