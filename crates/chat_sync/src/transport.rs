use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{PushTransport, TransportSignal};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Derives the push endpoint from the REST base URL.
pub fn websocket_url(base_url: &str, user_id: &UserId) -> Result<Url> {
    let mut url = Url::parse(base_url).with_context(|| format!("invalid base url: {base_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        "ws" | "wss" => url.scheme(),
        other => return Err(anyhow!("unsupported base url scheme: {other}")),
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| anyhow!("cannot switch {base_url} to {scheme}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user_id.as_str());
    Ok(url)
}

struct WsSession {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// JSON-over-WebSocket push transport with bounded automatic reconnects.
pub struct WsTransport {
    base_url: String,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    session: Mutex<Option<WsSession>>,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>, reconnect_attempts: u32, reconnect_delay: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            reconnect_attempts,
            reconnect_delay,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn open(
        &self,
        user_id: &UserId,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<()> {
        let url = websocket_url(&self.base_url, user_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        info!(%url, "ws: connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(
            url,
            stream,
            outbound_rx,
            signals,
            self.reconnect_attempts,
            self.reconnect_delay,
        ));

        if let Some(previous) = self.session.lock().await.replace(WsSession { outbound, task }) {
            previous.task.abort();
        }
        Ok(())
    }

    async fn send(&self, request: ClientRequest) -> Result<()> {
        let frame = serde_json::to_string(&request)?;
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| anyhow!("websocket is not open"))?;
        session
            .outbound
            .send(frame)
            .map_err(|_| anyhow!("websocket writer has stopped"))
    }

    async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.lock().await.take() {
            drop(session.outbound);
            if tokio::time::timeout(Duration::from_secs(1), session.task)
                .await
                .is_err()
            {
                warn!("ws: writer did not stop in time");
            }
        }
        Ok(())
    }
}

enum StreamEnd {
    /// The owner dropped the outbound sender.
    Closed,
    Dropped(String),
}

async fn supervise(
    url: Url,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
) {
    if signals.send(TransportSignal::Connected).is_err() {
        return;
    }

    let mut stream = stream;
    loop {
        let reason = match pump_stream(stream, &mut outbound, &signals).await {
            StreamEnd::Closed => return,
            StreamEnd::Dropped(reason) => reason,
        };
        if signals
            .send(TransportSignal::Disconnected { reason })
            .is_err()
        {
            return;
        }

        let mut attempt = 0;
        stream = loop {
            attempt += 1;
            if attempt > reconnect_attempts {
                let _ = signals.send(TransportSignal::ReconnectFailed {
                    attempts: reconnect_attempts,
                });
                return;
            }

            // Frames written while offline are dropped; the owner restates state on reconnect.
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                frame = outbound.recv() => match frame {
                    Some(_) => debug!("ws: dropping frame while reconnecting"),
                    None => return,
                },
            }

            match connect_async(url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(err) => warn!(attempt, %err, "ws: reconnect attempt failed"),
            }
        };

        if signals
            .send(TransportSignal::Reconnected { attempt })
            .is_err()
        {
            return;
        }
    }
}

async fn pump_stream(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    signals: &mpsc::UnboundedSender<TransportSignal>,
) -> StreamEnd {
    let (mut writer, mut reader) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = writer.send(Message::Close(None)).await;
                    return StreamEnd::Closed;
                };
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    return StreamEnd::Dropped(format!("websocket send failed: {err}"));
                }
            }
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let signal = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => TransportSignal::Frame(event),
                        Err(err) => TransportSignal::Malformed(err.to_string()),
                    };
                    if signals.send(signal).is_err() {
                        return StreamEnd::Closed;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "server closed the connection".to_string());
                    return StreamEnd::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return StreamEnd::Dropped(format!("websocket receive failed: {err}")),
                None => return StreamEnd::Dropped("websocket stream ended".to_string()),
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
