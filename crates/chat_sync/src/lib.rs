//! Conversation synchronization for direct and circle chats.
//!
//! A [`ChatSession`] merges three sources into one timeline per conversation:
//! the REST history, the push channel and locally sent messages.

use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use shared::{
    domain::{CallType, Conversation, ConversationId, ConversationKind, Message, UserId},
    error::ChannelErrorCode,
    protocol::CallSignal,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod history;
pub mod identity;
pub mod log;
pub mod normalize;
pub mod reconcile;
pub mod transport;

pub use api::{ConversationApi, HttpConversationApi};
pub use config::{load_config, SyncConfig};
pub use connection::{ConnectionManager, PushTransport, TransportSignal};
pub use error::SyncError;
pub use events::{ChannelEvent, SessionState, SyncEvent};
pub use transport::WsTransport;

use cache::ConversationCache;
use history::HistoryLoader;
use log::ReplaceOutcome;
use normalize::Normalize;
use reconcile::Reconciler;

#[derive(Default)]
struct SessionContext {
    user_id: Option<UserId>,
    open: HashMap<ConversationId, Conversation>,
    blocked_by: HashMap<ConversationId, Vec<UserId>>,
}

/// Process-wide chat state for one signed-in user.
pub struct ChatSession {
    api: Arc<dyn ConversationApi>,
    history: HistoryLoader,
    connection: Arc<ConnectionManager>,
    cache: Mutex<ConversationCache>,
    reconciler: Mutex<Reconciler>,
    inner: Mutex<SessionContext>,
    applier: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChatSession {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        let api = Arc::new(HttpConversationApi::new(
            config.base_url.clone(),
            config.auth_token.clone(),
        ));
        let transport = Arc::new(WsTransport::new(
            config.base_url.clone(),
            config.reconnect_attempts,
            config.reconnect_delay,
        ));
        Self::new_with_dependencies(&config, api, transport)
    }

    pub fn new_with_dependencies(
        config: &SyncConfig,
        api: Arc<dyn ConversationApi>,
        transport: Arc<dyn PushTransport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            history: HistoryLoader::new(Arc::clone(&api), config.page_size()),
            api,
            connection: ConnectionManager::new(transport, config.event_buffer),
            cache: Mutex::new(ConversationCache::new()),
            reconciler: Mutex::new(Reconciler::new()),
            inner: Mutex::new(SessionContext::default()),
            applier: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn connection_state(&self) -> SessionState {
        self.connection.state().await
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.cache.lock().await.snapshot(conversation_id)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn user_id(&self) -> Result<UserId, SyncError> {
        self.inner
            .lock()
            .await
            .user_id
            .clone()
            .ok_or(SyncError::NotSignedIn)
    }

    /// Opens the push channel for `user_id` and starts applying its events.
    pub async fn sign_in(self: &Arc<Self>, user_id: UserId) -> Result<(), SyncError> {
        {
            let mut guard = self.inner.lock().await;
            if let Some(current) = &guard.user_id {
                if current != &user_id {
                    return Err(anyhow!("already signed in as {current}; sign out first").into());
                }
            }
            guard.user_id = Some(user_id.clone());
        }

        {
            let mut applier = self.applier.lock().await;
            if applier.is_none() {
                *applier = Some(self.spawn_applier());
            }
        }

        if let Err(err) = self.connection.connect(user_id.clone()).await {
            self.inner.lock().await.user_id = None;
            if let Some(task) = self.applier.lock().await.take() {
                task.abort();
            }
            return Err(err.into());
        }
        info!(user_id = %user_id, "session: signed in");
        Ok(())
    }

    fn spawn_applier(self: &Arc<Self>) -> JoinHandle<()> {
        let mut channel_events = self.connection.subscribe();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match channel_events.recv().await {
                    Ok(event) => session.apply_channel_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: event bus lagged; reloading open conversations");
                        session.resync_open_conversations().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Applies one push channel event to the conversation logs, then republishes it.
    pub async fn apply_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived {
                conversation_id,
                message,
            } => {
                let message = message.normalize(&conversation_id);
                let (echoed, appended) = {
                    let mut reconciler = self.reconciler.lock().await;
                    let mut cache = self.cache.lock().await;
                    let echoed = reconciler.absorb_echo(&mut cache, &conversation_id, &message);
                    let appended =
                        echoed.is_none() && cache.append(&conversation_id, message.clone());
                    (echoed, appended)
                };
                if let Some((temp_id, message)) = echoed {
                    self.emit(SyncEvent::MessageConfirmed {
                        conversation_id,
                        temp_id,
                        message,
                    });
                } else if appended {
                    self.emit(SyncEvent::MessageAppended {
                        conversation_id,
                        message,
                    });
                } else {
                    debug!(
                        conversation_id = %conversation_id,
                        message_id = %message.id,
                        "session: duplicate message suppressed"
                    );
                }
            }
            ChannelEvent::ReadReceipt {
                conversation_id,
                user_id,
            } => {
                self.cache
                    .lock()
                    .await
                    .mark_read(&conversation_id, &user_id);
                self.emit(SyncEvent::ReadReceipt {
                    conversation_id,
                    user_id,
                });
            }
            ChannelEvent::ConversationCleared { conversation_id } => {
                self.cache.lock().await.clear(&conversation_id);
                self.emit(SyncEvent::ConversationCleared { conversation_id });
            }
            ChannelEvent::BlockUpdated {
                conversation_id,
                blocked_by,
            } => {
                self.inner
                    .lock()
                    .await
                    .blocked_by
                    .insert(conversation_id.clone(), blocked_by.clone());
                self.emit(SyncEvent::BlockUpdated {
                    conversation_id,
                    blocked_by,
                });
            }
            ChannelEvent::Signal {
                from,
                call_type,
                signal,
            } => self.emit(SyncEvent::Signal {
                from,
                call_type,
                signal,
            }),
            ChannelEvent::ConnectionStateChanged(state) => {
                self.emit(SyncEvent::ConnectionStateChanged(state))
            }
            ChannelEvent::ChannelError(err) => self.emit(SyncEvent::ChannelError(err)),
            ChannelEvent::Error(err) => self.emit(SyncEvent::Error(err)),
        }
    }

    /// Seeds the conversation from history, then joins its room.
    ///
    /// A conversation already cached with entries keeps its log, including
    /// older pages; only messages missed since are appended.
    pub async fn open_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<Vec<Message>, SyncError> {
        self.user_id().await?;
        self.inner
            .lock()
            .await
            .open
            .insert(conversation.id.clone(), conversation.clone());

        let cached = self
            .cache
            .lock()
            .await
            .get(&conversation.id)
            .is_some_and(|log| !log.is_empty());
        let loaded = if cached {
            self.history.refresh(&self.cache, &conversation).await
        } else {
            self.history.load(&self.cache, &conversation).await
        };
        if let Err(err) = &loaded {
            self.emit(SyncEvent::Error(format!("{err:#}")));
        }
        if conversation.uses_room() {
            self.connection.join_room(&conversation.id).await?;
        }
        loaded?;
        Ok(self.messages(&conversation.id).await)
    }

    /// Leaves the conversation's room. The cached log and in-flight sends survive.
    pub async fn close_conversation(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        let closed = self.inner.lock().await.open.remove(conversation_id);
        if closed.is_some_and(|conversation| conversation.uses_room()) {
            self.connection.leave_room(conversation_id).await?;
        }
        Ok(())
    }

    pub async fn load_older(&self, conversation: &Conversation) -> Result<usize, SyncError> {
        let oldest = {
            let cache = self.cache.lock().await;
            cache
                .get(&conversation.id)
                .and_then(|log| log.messages().first())
                .map(|message| message.id.clone())
        };
        let added = match oldest {
            Some(before) => {
                self.history
                    .load_older(&self.cache, conversation, &before)
                    .await?
            }
            None => self.history.load(&self.cache, conversation).await?,
        };
        Ok(added)
    }

    async fn block_state(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Option<ChannelErrorCode> {
        let guard = self.inner.lock().await;
        let blocked_by = guard.blocked_by.get(conversation_id)?;
        if blocked_by.is_empty() {
            None
        } else if blocked_by.contains(user_id) {
            Some(ChannelErrorCode::YouBlockedTarget)
        } else {
            Some(ChannelErrorCode::BlockedByTarget)
        }
    }

    /// Sends the trimmed `draft`, showing it immediately and reconciling once
    /// the server answers.
    ///
    /// On failure the optimistic entry is removed and the error carries `draft`
    /// exactly as given.
    pub async fn send_message(
        &self,
        conversation: &Conversation,
        draft: &str,
    ) -> Result<Message, SyncError> {
        if draft.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let user_id = self.user_id().await?;
        if let Some(code) = self.block_state(&conversation.id, &user_id).await {
            return Err(SyncError::Authorization(code));
        }

        let (pending, optimistic) = {
            let mut reconciler = self.reconciler.lock().await;
            let mut cache = self.cache.lock().await;
            reconciler.begin(&mut cache, &conversation.id, &user_id, draft, Vec::new())
        };
        self.emit(SyncEvent::MessageAppended {
            conversation_id: conversation.id.clone(),
            message: optimistic,
        });

        match self.api.send_message(conversation, &pending.text).await {
            Ok(server_message) => {
                let confirmation = {
                    let mut reconciler = self.reconciler.lock().await;
                    let mut cache = self.cache.lock().await;
                    reconciler.confirm(&mut cache, &pending, server_message)
                };
                // A pushed copy already confirmed this send.
                if confirmation.outcome != Some(ReplaceOutcome::Duplicate) {
                    self.emit(SyncEvent::MessageConfirmed {
                        conversation_id: conversation.id.clone(),
                        temp_id: pending.temp_id,
                        message: confirmation.message.clone(),
                    });
                }
                Ok(confirmation.message)
            }
            Err(err) => {
                let draft = {
                    let mut reconciler = self.reconciler.lock().await;
                    if let Some(message) = reconciler.take_echoed(&pending) {
                        warn!(
                            conversation_id = %conversation.id,
                            message_id = %message.id,
                            error = %err,
                            "session: send call failed after the server delivered the message"
                        );
                        return Ok(message);
                    }
                    let mut cache = self.cache.lock().await;
                    reconciler.fail(&mut cache, &pending)
                };
                warn!(conversation_id = %conversation.id, error = %err, "session: send failed");
                self.emit(SyncEvent::MessageFailed {
                    conversation_id: conversation.id.clone(),
                    temp_id: pending.temp_id.clone(),
                    draft: draft.clone(),
                });
                Err(SyncError::SendFailed {
                    conversation_id: conversation.id.clone(),
                    temp_id: pending.temp_id,
                    draft,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    pub async fn clear_history(&self, conversation: &Conversation) -> Result<(), SyncError> {
        self.api.clear_history(conversation).await?;
        self.cache.lock().await.clear(&conversation.id);
        self.emit(SyncEvent::ConversationCleared {
            conversation_id: conversation.id.clone(),
        });
        Ok(())
    }

    pub async fn set_blocked(
        &self,
        conversation: &Conversation,
        blocked: bool,
    ) -> Result<(), SyncError> {
        let user_id = self.user_id().await?;
        self.api.set_blocked(conversation, blocked).await?;
        let blocked_by = {
            let mut guard = self.inner.lock().await;
            let entry = guard.blocked_by.entry(conversation.id.clone()).or_default();
            entry.retain(|user| user != &user_id);
            if blocked {
                entry.push(user_id);
            }
            entry.clone()
        };
        self.emit(SyncEvent::BlockUpdated {
            conversation_id: conversation.id.clone(),
            blocked_by,
        });
        Ok(())
    }

    /// Forwards a call signaling frame. Blocked partners are rejected locally.
    pub async fn send_signal(
        &self,
        to: UserId,
        call_type: CallType,
        signal: CallSignal,
    ) -> Result<(), SyncError> {
        let user_id = self.user_id().await?;
        let direct_with_target = {
            let guard = self.inner.lock().await;
            guard
                .open
                .values()
                .find(|conversation| {
                    matches!(&conversation.kind, ConversationKind::Direct { partner } if partner == &to)
                })
                .map(|conversation| conversation.id.clone())
        };
        if let Some(conversation_id) = direct_with_target {
            if let Some(code) = self.block_state(&conversation_id, &user_id).await {
                return Err(SyncError::Authorization(code));
            }
        }
        self.connection.send_signal(to, call_type, signal).await
    }

    async fn resync_open_conversations(&self) {
        let open: Vec<Conversation> = self.inner.lock().await.open.values().cloned().collect();
        for conversation in open {
            if let Err(err) = self.history.load(&self.cache, &conversation).await {
                self.emit(SyncEvent::Error(format!("{err:#}")));
            }
        }
    }

    /// Leaves all rooms, closes the channel and drops every cached log.
    pub async fn sign_out(&self) {
        let user_id = {
            let mut guard = self.inner.lock().await;
            guard.open.clear();
            guard.blocked_by.clear();
            guard.user_id.take()
        };
        self.connection.disconnect().await;
        if let Some(task) = self.applier.lock().await.take() {
            task.abort();
        }
        self.reconciler.lock().await.clear();
        self.cache.lock().await.clear_all();
        if let Some(user_id) = user_id {
            info!(user_id = %user_id, "session: signed out");
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod tests_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
