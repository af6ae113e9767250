//! Delivery of agent events to the collector.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::io::Write;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::Backoff;
use crate::types::AgentEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First frame on every connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub api_key: Option<String>,
    pub cluster_name: String,
    pub agent_version: &'static str,
}

impl Hello {
    pub fn new(api_key: Option<String>, cluster_name: String) -> Self {
        Self {
            api_key,
            cluster_name,
            agent_version: env!("CARGO_PKG_VERSION"),
        }
    }

    fn frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(&serde_json::json!({ "event": "hello", "payload": self }))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    /// Every sender is gone and the queue is empty.
    Drained,
    Stopped,
    Lost(String),
}

/// Websocket client that forwards the event queue to the collector, reconnecting
/// with the fixed backoff. Events are sent in submission order; one whose send
/// failed is re-sent first on the next connection.
pub struct CollectorTransport {
    url: String,
    hello: Hello,
    backoff: Backoff,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    pending: Option<String>,
}

impl CollectorTransport {
    pub fn new(
        url: impl Into<String>,
        hello: Hello,
        backoff: Backoff,
        events: mpsc::UnboundedReceiver<AgentEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            hello,
            backoff,
            events,
            pending: None,
        }
    }

    /// Run until the event queue is drained or `stop` fires.
    pub async fn run(mut self, stop: CancellationToken) {
        loop {
            let connected = tokio::select! {
                _ = stop.cancelled() => return,
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            };
            match connected {
                Ok((ws, _)) => {
                    info!("Connected to collector at {}", self.url);
                    match self.run_connection(ws, &stop).await {
                        Disconnect::Drained => {
                            info!("Event queue drained, closing collector connection");
                            return;
                        }
                        Disconnect::Stopped => return,
                        Disconnect::Lost(reason) => {
                            warn!("Lost collector connection: {}", reason);
                        }
                    }
                }
                Err(err) => warn!("Failed to connect to collector at {}: {}", self.url, err),
            }
            if !self.backoff.wait(&stop).await {
                return;
            }
        }
    }

    async fn run_connection(&mut self, ws: WsStream, stop: &CancellationToken) -> Disconnect {
        let (mut write, mut read) = ws.split();

        let hello = match self.hello.frame() {
            Ok(frame) => frame,
            Err(err) => return Disconnect::Lost(format!("failed to encode hello: {}", err)),
        };
        if let Err(err) = write.send(Message::Text(hello)).await {
            return Disconnect::Lost(format!("hello failed: {}", err));
        }
        if let Err(reason) = self.send_pending(&mut write).await {
            return Disconnect::Lost(reason);
        }

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Disconnect::Stopped,
                msg = read.next() => {
                    if let Some(reason) = closed_reason(msg) {
                        return Disconnect::Lost(reason);
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        let _ = write.close().await;
                        return Disconnect::Drained;
                    };
                    match serde_json::to_string(&event) {
                        Ok(frame) => self.pending = Some(frame),
                        Err(err) => {
                            error!("Failed to encode {} event: {}", event.name(), err);
                            continue;
                        }
                    }
                    if let Err(reason) = self.send_pending(&mut write).await {
                        return Disconnect::Lost(reason);
                    }
                }
            }
        }
    }

    async fn send_pending(
        &mut self,
        write: &mut SplitSink<WsStream, Message>,
    ) -> Result<(), String> {
        let Some(frame) = &self.pending else {
            return Ok(());
        };
        write
            .send(Message::Text(frame.clone()))
            .await
            .map_err(|err| format!("send failed: {}", err))?;
        self.pending = None;
        Ok(())
    }
}

/// Why the read half ended, or `None` if the message is just noise.
fn closed_reason(
    msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<String> {
    match msg {
        Some(Ok(Message::Close(_))) => Some("collector closed the connection".to_string()),
        Some(Err(err)) => Some(format!("websocket error: {}", err)),
        None => Some("connection closed".to_string()),
        Some(Ok(other)) => {
            debug!("Ignoring collector message: {:?}", other);
            None
        }
    }
}

/// Stdout mode: one JSON document per event.
pub async fn print_events(events: mpsc::UnboundedReceiver<AgentEvent>) {
    write_events(events, std::io::stdout()).await;
}

/// Once a write fails the rest of the queue is discarded, so a closed pipe
/// does not stop the agent.
async fn write_events<W: Write>(mut events: mpsc::UnboundedReceiver<AgentEvent>, mut out: W) -> W {
    while let Some(event) = events.recv().await {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                error!("Failed to encode {} event: {}", event.name(), err);
                continue;
            }
        };
        let written = writeln!(out, "{}", line).and_then(|()| out.flush());
        if let Err(err) = written {
            warn!("Cannot write events to stdout, discarding them: {}", err);
            while events.recv().await.is_some() {}
            break;
        }
    }
    out
}
