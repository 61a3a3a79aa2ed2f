use std::collections::HashMap;

use shared::domain::{ConversationId, Message, MessageId, UserId};

use crate::{
    log::{MessageLog, ReplaceOutcome},
    normalize::Normalize,
};

/// Process-wide store of conversation logs, owned by one signed-in session.
///
/// Logs are created on first use and kept until invalidated or the session
/// signs out. Operations that finish work started earlier (`replace`,
/// `remove`) do nothing once the conversation has been evicted.
#[derive(Debug, Default)]
pub struct ConversationCache {
    logs: HashMap<ConversationId, MessageLog>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&MessageLog> {
        self.logs.get(conversation_id)
    }

    pub fn put(&mut self, conversation_id: ConversationId, log: MessageLog) {
        debug_assert_eq!(log.conversation_id(), &conversation_id);
        self.logs.insert(conversation_id, log);
    }

    pub fn invalidate(&mut self, conversation_id: &ConversationId) -> Option<MessageLog> {
        self.logs.remove(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.logs.contains_key(conversation_id)
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.logs
            .get(conversation_id)
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    fn log_mut(&mut self, conversation_id: &ConversationId) -> &mut MessageLog {
        self.logs
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageLog::new(conversation_id.clone()))
    }

    pub fn seed<M, I>(&mut self, conversation_id: &ConversationId, messages: I)
    where
        M: Normalize,
        I: IntoIterator<Item = M>,
    {
        self.log_mut(conversation_id).seed(messages);
    }

    pub fn prepend<M, I>(&mut self, conversation_id: &ConversationId, messages: I) -> usize
    where
        M: Normalize,
        I: IntoIterator<Item = M>,
    {
        self.log_mut(conversation_id).prepend(messages)
    }

    pub fn append(&mut self, conversation_id: &ConversationId, message: impl Normalize) -> bool {
        self.log_mut(conversation_id).append(message)
    }

    pub fn replace(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
        message: impl Normalize,
    ) -> Option<ReplaceOutcome> {
        self.logs
            .get_mut(conversation_id)
            .map(|log| log.replace(temp_id, message))
    }

    pub fn remove(&mut self, conversation_id: &ConversationId, id: &MessageId) -> Option<Message> {
        self.logs.get_mut(conversation_id)?.remove(id)
    }

    pub fn mark_read(&mut self, conversation_id: &ConversationId, reader: &UserId) -> usize {
        self.logs
            .get_mut(conversation_id)
            .map(|log| log.mark_read(reader))
            .unwrap_or(0)
    }

    /// Empties a conversation's log without forgetting it.
    pub fn clear(&mut self, conversation_id: &ConversationId) {
        if let Some(log) = self.logs.get_mut(conversation_id) {
            log.clear();
        }
    }

    pub fn clear_all(&mut self) {
        self.logs.clear();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
