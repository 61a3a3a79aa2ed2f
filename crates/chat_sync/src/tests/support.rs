use std::sync::Mutex as StdMutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use shared::{
    domain::Conversation,
    protocol::{ClientRequest, RawMessage},
};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::{
    api::{ConversationApi, HistoryQuery},
    connection::{PushTransport, TransportSignal},
};

pub(crate) fn raw(id: &str, conversation: &str, sender: &str, text: &str) -> RawMessage {
    serde_json::from_value(json!({
        "id": id,
        "conversationId": conversation,
        "sender": { "_id": sender, "username": sender },
        "text": text,
        "createdAt": "2024-05-01T10:00:00Z",
    }))
    .expect("raw message")
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: StdMutex<Vec<ClientRequest>>,
    signals: StdMutex<Option<mpsc::UnboundedSender<TransportSignal>>>,
    closed: StdMutex<bool>,
    fail_open: bool,
}

impl RecordingTransport {
    pub(crate) fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().expect("sent").clone()
    }

    pub(crate) fn clear_sent(&self) {
        self.sent.lock().expect("sent").clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.lock().expect("closed")
    }

    pub(crate) fn signal_sender(&self) -> mpsc::UnboundedSender<TransportSignal> {
        self.signals
            .lock()
            .expect("signals")
            .clone()
            .expect("transport opened")
    }

    pub(crate) fn push(&self, signal: TransportSignal) {
        let guard = self.signals.lock().expect("signals");
        guard
            .as_ref()
            .expect("transport opened")
            .send(signal)
            .expect("signal receiver alive");
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn open(
        &self,
        _user_id: &shared::domain::UserId,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()> {
        if self.fail_open {
            return Err(anyhow!("connection refused"));
        }
        *self.signals.lock().expect("signals") = Some(signals);
        Ok(())
    }

    async fn send(&self, request: ClientRequest) -> Result<()> {
        self.sent.lock().expect("sent").push(request);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().expect("closed") = true;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pub(crate) history: StdMutex<Vec<RawMessage>>,
    pub(crate) older: StdMutex<Vec<RawMessage>>,
    pub(crate) queries: StdMutex<Vec<HistoryQuery>>,
    pub(crate) send_reply: StdMutex<Option<RawMessage>>,
    pub(crate) sent_texts: StdMutex<Vec<String>>,
    pub(crate) send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub(crate) fail_history: bool,
}

impl FakeApi {
    pub(crate) fn with_history(history: Vec<RawMessage>) -> Self {
        Self {
            history: StdMutex::new(history),
            ..Self::default()
        }
    }

    pub(crate) fn reply_with(self, reply: RawMessage) -> Self {
        *self.send_reply.lock().expect("reply") = Some(reply);
        self
    }

    /// Holds the next send response until the returned sender fires.
    pub(crate) async fn gate_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().await = Some(rx);
        tx
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn fetch_history(
        &self,
        _conversation: &Conversation,
        query: HistoryQuery,
    ) -> Result<Vec<RawMessage>> {
        if self.fail_history {
            return Err(anyhow!("history endpoint unavailable"));
        }
        let older = query.before.is_some();
        self.queries.lock().expect("queries").push(query);
        if older {
            Ok(self.older.lock().expect("older").clone())
        } else {
            Ok(self.history.lock().expect("history").clone())
        }
    }

    async fn send_message(&self, _conversation: &Conversation, text: &str) -> Result<RawMessage> {
        self.sent_texts
            .lock()
            .expect("sent texts")
            .push(text.to_string());
        let gate = self.send_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.send_reply
            .lock()
            .expect("reply")
            .clone()
            .ok_or_else(|| anyhow!("500 Internal Server Error"))
    }

    async fn clear_history(&self, _conversation: &Conversation) -> Result<()> {
        Ok(())
    }

    async fn set_blocked(&self, _conversation: &Conversation, _blocked: bool) -> Result<()> {
        Ok(())
    }
}
