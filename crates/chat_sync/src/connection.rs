use std::{collections::BTreeSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CallType, ConversationId, UserId},
    error::ChannelError,
    protocol::{CallSignal, ClientRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::SyncError,
    events::{ChannelEvent, SessionState},
};

/// What a push transport reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Connected,
    Disconnected { reason: String },
    Reconnected { attempt: u32 },
    ReconnectFailed { attempts: u32 },
    Frame(ServerEvent),
    Malformed(String),
}

/// Push channel transport. Reconnecting after a drop is the transport's job;
/// restating registration and room membership is the manager's.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(
        &self,
        user_id: &UserId,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()>;
    async fn send(&self, request: ClientRequest) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

struct ConnectionState {
    user_id: Option<UserId>,
    session: SessionState,
    rooms: BTreeSet<ConversationId>,
    pump: Option<JoinHandle<()>>,
}

/// Owns the single push channel session of the signed-in user.
pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    inner: Mutex<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, event_buffer: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Arc::new(Self {
            transport,
            inner: Mutex::new(ConnectionState {
                user_id: None,
                session: SessionState::Disconnected,
                rooms: BTreeSet::new(),
                pump: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.session
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id.clone()
    }

    pub async fn active_rooms(&self) -> Vec<ConversationId> {
        self.inner.lock().await.rooms.iter().cloned().collect()
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub async fn connect(self: &Arc<Self>, user_id: UserId) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.session != SessionState::Disconnected {
                if guard.user_id.as_ref() == Some(&user_id) {
                    return Ok(());
                }
                return Err(anyhow!(
                    "push channel already open for another user; disconnect first"
                ));
            }
            guard.user_id = Some(user_id.clone());
            guard.session = SessionState::Connecting;
        }
        self.emit(ChannelEvent::ConnectionStateChanged(
            SessionState::Connecting,
        ));

        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        if let Err(err) = self.transport.open(&user_id, signals_tx).await {
            {
                let mut guard = self.inner.lock().await;
                guard.session = SessionState::Disconnected;
                guard.user_id = None;
            }
            self.emit(ChannelEvent::ConnectionStateChanged(
                SessionState::Disconnected,
            ));
            return Err(err);
        }

        let manager = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(signal) = signals_rx.recv().await {
                manager.handle_signal(signal).await;
            }
        });
        if let Some(previous) = self.inner.lock().await.pump.replace(pump) {
            previous.abort();
        }
        info!(user_id = %user_id, "push: channel opened");
        Ok(())
    }

    pub async fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected => self.reassert("connected").await,
            TransportSignal::Reconnected { attempt } => {
                info!(attempt, "push: transport reconnected");
                self.reassert("reconnected").await;
            }
            TransportSignal::Disconnected { reason } => {
                warn!(%reason, "push: transport dropped");
                let changed = {
                    let mut guard = self.inner.lock().await;
                    if guard.session == SessionState::Connected {
                        guard.session = SessionState::Connecting;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.emit(ChannelEvent::ConnectionStateChanged(
                        SessionState::Connecting,
                    ));
                }
            }
            TransportSignal::ReconnectFailed { attempts } => {
                error!(attempts, "push: transport gave up reconnecting");
                self.inner.lock().await.session = SessionState::Disconnected;
                self.emit(ChannelEvent::ConnectionStateChanged(
                    SessionState::Disconnected,
                ));
                self.emit(ChannelEvent::Error(format!(
                    "push channel reconnect failed after {attempts} attempts"
                )));
            }
            TransportSignal::Frame(event) => self.dispatch(event).await,
            TransportSignal::Malformed(err) => {
                warn!(%err, "push: dropping malformed frame");
                self.emit(ChannelEvent::Error(format!("invalid server event: {err}")));
            }
        }
    }

    /// Restates registration and every active room. The server keeps no
    /// subscription state across transport sessions.
    async fn reassert(&self, cause: &str) {
        let (user_id, rooms) = {
            let mut guard = self.inner.lock().await;
            let Some(user_id) = guard.user_id.clone() else {
                debug!(cause, "push: ignoring connect signal after disconnect");
                return;
            };
            guard.session = SessionState::Connected;
            (user_id, guard.rooms.iter().cloned().collect::<Vec<_>>())
        };
        self.emit(ChannelEvent::ConnectionStateChanged(
            SessionState::Connected,
        ));

        if let Err(err) = self
            .transport
            .send(ClientRequest::Register {
                user_id: user_id.clone(),
            })
            .await
        {
            self.emit(ChannelEvent::Error(format!("failed to register: {err}")));
        }
        for conversation_id in rooms {
            if let Err(err) = self
                .transport
                .send(ClientRequest::JoinRoom {
                    conversation_id: conversation_id.clone(),
                })
                .await
            {
                self.emit(ChannelEvent::Error(format!(
                    "failed to join room {conversation_id}: {err}"
                )));
            }
        }
        info!(user_id = %user_id, cause, "push: registration and rooms re-asserted");
    }

    async fn dispatch(&self, event: ServerEvent) {
        let event = match event {
            ServerEvent::NewMessage {
                conversation_id,
                message,
            } => ChannelEvent::MessageReceived {
                conversation_id,
                message,
            },
            ServerEvent::ReadReceipt {
                conversation_id,
                user_id,
            } => ChannelEvent::ReadReceipt {
                conversation_id,
                user_id,
            },
            ServerEvent::Signal {
                from,
                call_type,
                signal,
            } => {
                if self.inner.lock().await.user_id.as_ref() == Some(&from) {
                    return;
                }
                ChannelEvent::Signal {
                    from,
                    call_type,
                    signal,
                }
            }
            ServerEvent::ConversationCleared {
                conversation_id, ..
            } => ChannelEvent::ConversationCleared { conversation_id },
            ServerEvent::BlockUpdated {
                conversation_id,
                blocked_by,
            } => ChannelEvent::BlockUpdated {
                conversation_id,
                blocked_by,
            },
            ServerEvent::ChannelError { code, message } => {
                warn!(%code, %message, "push: channel error");
                ChannelEvent::ChannelError(ChannelError::new(code, message))
            }
        };
        self.emit(event);
    }

    /// Subscribes to a conversation's room. Joining twice is a no-op.
    pub async fn join_room(&self, conversation_id: &ConversationId) -> Result<()> {
        let send_now = {
            let mut guard = self.inner.lock().await;
            guard.rooms.insert(conversation_id.clone()) && guard.session == SessionState::Connected
        };
        if send_now {
            self.transport
                .send(ClientRequest::JoinRoom {
                    conversation_id: conversation_id.clone(),
                })
                .await?;
            debug!(conversation_id = %conversation_id, "push: joined room");
        }
        Ok(())
    }

    pub async fn leave_room(&self, conversation_id: &ConversationId) -> Result<()> {
        let send_now = {
            let mut guard = self.inner.lock().await;
            guard.rooms.remove(conversation_id) && guard.session == SessionState::Connected
        };
        if send_now {
            self.transport
                .send(ClientRequest::LeaveRoom {
                    conversation_id: conversation_id.clone(),
                })
                .await?;
            debug!(conversation_id = %conversation_id, "push: left room");
        }
        Ok(())
    }

    pub async fn send_signal(
        &self,
        to: UserId,
        call_type: CallType,
        signal: CallSignal,
    ) -> Result<(), SyncError> {
        if self.state().await != SessionState::Connected {
            return Err(SyncError::NotConnected);
        }
        self.transport
            .send(ClientRequest::Signal {
                to,
                call_type,
                signal,
            })
            .await?;
        Ok(())
    }

    /// Leaves every room, then tears the channel down.
    pub async fn disconnect(&self) {
        let (rooms, pump, connected) = {
            let mut guard = self.inner.lock().await;
            let connected = guard.session == SessionState::Connected;
            guard.session = SessionState::Disconnected;
            guard.user_id = None;
            (std::mem::take(&mut guard.rooms), guard.pump.take(), connected)
        };

        if connected {
            for conversation_id in rooms {
                if let Err(err) = self
                    .transport
                    .send(ClientRequest::LeaveRoom { conversation_id })
                    .await
                {
                    warn!(%err, "push: failed to leave room during disconnect");
                }
            }
        }
        if let Err(err) = self.transport.close().await {
            warn!(%err, "push: failed to close transport");
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.emit(ChannelEvent::ConnectionStateChanged(
            SessionState::Disconnected,
        ));
        info!("push: channel closed");
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
