use std::collections::HashSet;

use shared::domain::{ConversationId, Message, MessageId, UserId};

use crate::normalize::Normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The temporary entry was swapped for the server record at this index.
    Replaced { position: usize },
    /// No temporary entry existed; the server record was appended.
    Appended,
    /// No temporary entry existed and the server id was already present.
    Duplicate,
}

/// Ordered, duplicate-free timeline for a single conversation.
///
/// Entries are kept in arrival order and never re-sorted. `index` mirrors the
/// ids present in `entries` at all times.
#[derive(Debug, Clone)]
pub struct MessageLog {
    conversation_id: ConversationId,
    entries: Vec<Message>,
    index: HashSet<MessageId>,
}

impl MessageLog {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            index: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains(id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.index.contains(id) {
            return None;
        }
        self.entries.iter().position(|message| &message.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.position(id).map(|position| &self.entries[position])
    }

    /// Replaces the whole log with `messages`, keeping the first copy of each id.
    ///
    /// Entries still pending a send confirmation are carried over after the
    /// history so their confirmation can land in place.
    pub fn seed<M, I>(&mut self, messages: I)
    where
        M: Normalize,
        I: IntoIterator<Item = M>,
    {
        let mut entries = Vec::new();
        let mut index = HashSet::new();
        for message in messages {
            let message = message.normalize(&self.conversation_id);
            if index.insert(message.id.clone()) {
                entries.push(message);
            }
        }

        let pending = self
            .entries
            .drain(..)
            .filter(|message| message.is_pending())
            .collect::<Vec<_>>();
        for message in pending {
            if index.insert(message.id.clone()) {
                entries.push(message);
            }
        }

        self.entries = entries;
        self.index = index;
    }

    /// Appends `message` unless its id is already present. Returns whether it was added.
    pub fn append(&mut self, message: impl Normalize) -> bool {
        let message = message.normalize(&self.conversation_id);
        if !self.index.insert(message.id.clone()) {
            return false;
        }
        self.entries.push(message);
        true
    }

    /// Puts an older page in front of the current entries, skipping known ids.
    pub fn prepend<M, I>(&mut self, messages: I) -> usize
    where
        M: Normalize,
        I: IntoIterator<Item = M>,
    {
        let mut older = Vec::new();
        for message in messages {
            let message = message.normalize(&self.conversation_id);
            if self.index.insert(message.id.clone()) {
                older.push(message);
            }
        }
        let added = older.len();
        older.append(&mut self.entries);
        self.entries = older;
        added
    }

    /// Swaps the entry named `temp_id` for `message`, keeping its position.
    ///
    /// A copy of the server record that raced ahead of the confirmation is
    /// dropped so the id stays unique.
    pub fn replace(&mut self, temp_id: &MessageId, message: impl Normalize) -> ReplaceOutcome {
        let message = message.normalize(&self.conversation_id);
        let Some(mut position) = self.position(temp_id) else {
            return if self.append(message) {
                ReplaceOutcome::Appended
            } else {
                ReplaceOutcome::Duplicate
            };
        };

        if &message.id != temp_id {
            if let Some(raced) = self.position(&message.id) {
                self.entries.remove(raced);
                if raced < position {
                    position -= 1;
                }
            }
            self.index.remove(temp_id);
            self.index.insert(message.id.clone());
        }
        self.entries[position] = message;
        ReplaceOutcome::Replaced { position }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let position = self.position(id)?;
        self.index.remove(id);
        Some(self.entries.remove(position))
    }

    /// Records `reader` on every message. Returns how many entries changed.
    pub fn mark_read(&mut self, reader: &UserId) -> usize {
        self.entries
            .iter_mut()
            .map(|message| message.read_by.insert(reader.clone()))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
#[path = "tests/log_tests.rs"]
mod tests;
