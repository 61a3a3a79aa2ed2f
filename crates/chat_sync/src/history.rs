use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::{Conversation, MessageId};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    api::{ConversationApi, HistoryQuery},
    cache::ConversationCache,
    log::MessageLog,
};

/// Fetches REST backlog pages and feeds them into the conversation cache.
pub struct HistoryLoader {
    api: Arc<dyn ConversationApi>,
    page_size: u32,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ConversationApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.clamp(1, 100),
        }
    }

    /// Loads the latest page and seeds the log with it. Returns the log length.
    pub async fn load(
        &self,
        cache: &Mutex<ConversationCache>,
        conversation: &Conversation,
    ) -> Result<usize> {
        let messages = self
            .api
            .fetch_history(
                conversation,
                HistoryQuery {
                    limit: self.page_size,
                    before: None,
                },
            )
            .await
            .with_context(|| format!("failed to load history for {}", conversation.id))?;
        let fetched = messages.len();

        let mut cache = cache.lock().await;
        let len = if cache.contains(&conversation.id) {
            cache.seed(&conversation.id, messages);
            cache.get(&conversation.id).map_or(0, MessageLog::len)
        } else {
            let mut log = MessageLog::new(conversation.id.clone());
            log.seed(messages);
            let len = log.len();
            cache.put(conversation.id.clone(), log);
            len
        };
        info!(conversation_id = %conversation.id, fetched, len, "history: seeded");
        Ok(len)
    }

    /// Fetches the latest page and appends whatever the log does not hold yet.
    /// Returns how many were new.
    pub async fn refresh(
        &self,
        cache: &Mutex<ConversationCache>,
        conversation: &Conversation,
    ) -> Result<usize> {
        let messages = self
            .api
            .fetch_history(
                conversation,
                HistoryQuery {
                    limit: self.page_size,
                    before: None,
                },
            )
            .await
            .with_context(|| format!("failed to refresh history for {}", conversation.id))?;

        let mut cache = cache.lock().await;
        let mut added = 0;
        for message in messages {
            if cache.append(&conversation.id, message) {
                added += 1;
            }
        }
        info!(conversation_id = %conversation.id, added, "history: refreshed");
        Ok(added)
    }

    /// Loads the page before `before` and puts it ahead of the log. Returns how many were new.
    pub async fn load_older(
        &self,
        cache: &Mutex<ConversationCache>,
        conversation: &Conversation,
        before: &MessageId,
    ) -> Result<usize> {
        let messages = self
            .api
            .fetch_history(
                conversation,
                HistoryQuery {
                    limit: self.page_size,
                    before: Some(before.clone()),
                },
            )
            .await
            .with_context(|| format!("failed to load older history for {}", conversation.id))?;

        let added = cache.lock().await.prepend(&conversation.id, messages);
        info!(conversation_id = %conversation.id, added, "history: older page loaded");
        Ok(added)
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
