//! Watcher → collector relay for the split topology.
//!
//! The watcher publishes each new raw log line on a broadcast channel and
//! serves it to WebSocket subscribers at [`RELAY_PATH`]; one text frame is
//! one line, with no envelope and no acknowledgment. The collector connects
//! with [`RelaySubscriber`] and hands every frame to a [`LineForwarder`].
//!
//! Delivery is FIFO per connection. Nothing is persisted or replayed: lines
//! published while no collector is connected are lost, as are lines a slow
//! subscriber falls behind on by more than the channel capacity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

use crate::tailer::LineForwarder;

/// Name of the only event carried by the relay.
pub const NEW_LINE_EVENT: &str = "new_line";

/// WebSocket route serving [`NEW_LINE_EVENT`].
pub const RELAY_PATH: &str = "/relay/new_line";

/// Publishing half of the relay, owned by the watcher's tailer.
#[derive(Clone)]
pub struct RelayPublisher {
    tx: broadcast::Sender<String>,
}

impl RelayPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes one line and returns how many subscribers will receive it.
    pub fn publish(&self, line: &str) -> usize {
        self.tx.send(line.to_string()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl LineForwarder for RelayPublisher {
    async fn forward(&mut self, line: &str) -> Result<()> {
        if self.publish(line) == 0 {
            debug!(event = NEW_LINE_EVENT, "no relay subscriber; line dropped");
        }
        Ok(())
    }
}

pub fn relay_router(publisher: RelayPublisher) -> Router {
    Router::new()
        .route(RELAY_PATH, get(handle_subscribe))
        .with_state(publisher)
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve_relay(
    listener: TcpListener,
    publisher: RelayPublisher,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, path = RELAY_PATH, "relay listening");
    axum::serve(listener, relay_router(publisher))
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server failed")?;
    Ok(())
}

async fn handle_subscribe(
    ws: WebSocketUpgrade,
    State(publisher): State<RelayPublisher>,
) -> Response {
    // subscribe before the handshake completes so no line slips in between
    let rx = publisher.subscribe();
    ws.on_upgrade(move |socket| stream_lines(socket, rx))
}

async fn stream_lines(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    info!("relay subscriber connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(line) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "relay subscriber lagged; events lost");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("relay subscriber disconnected");
}

/// Subscribing half of the relay, run by the collector.
pub struct RelaySubscriber {
    url: String,
    reconnect: Duration,
}

impl RelaySubscriber {
    pub fn new(url: impl Into<String>, reconnect: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connects once and forwards frames until the connection ends.
    ///
    /// A line the handler fails on is logged and skipped; the relay cannot
    /// resend it.
    pub async fn connect_once(&self, handler: &mut dyn LineForwarder) -> Result<()> {
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to relay at {}", self.url))?;
        info!(url = %self.url, event = NEW_LINE_EVENT, "subscribed to relay");

        while let Some(frame) = ws.next().await {
            match frame.context("relay connection error")? {
                tungstenite::Message::Text(text) => {
                    if let Err(err) = handler.forward(text.as_str()).await {
                        error!(error = %format!("{:#}", err), line = text.as_str(), "dropped relayed line");
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }

        Ok(())
    }

    /// Keeps a subscription alive, reconnecting after each drop, until
    /// `shutdown` resolves.
    pub async fn run(
        &self,
        handler: &mut dyn LineForwarder,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = self.connect_once(&mut *handler) => match result {
                    Ok(()) => warn!(url = %self.url, "relay connection closed"),
                    Err(err) => warn!(error = %format!("{:#}", err), "relay unavailable"),
                },
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.reconnect) => {
                    debug!(url = %self.url, "reconnecting to relay");
                }
            }
        }

        info!("relay subscriber stopped");
    }
}
