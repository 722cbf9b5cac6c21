//! WebSocket transport over tokio-tungstenite
//!
//! One link task per connection owns both halves of the socket. Outbound
//! frames reach it through an mpsc queue; inbound text frames are decoded
//! into `ServerMessage`s and broadcast to subscribers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent, TransportStatus};
use crate::config::TransportConfig;
use crate::error::EngineError;
use crate::models::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Link {
    status: TransportStatus,
    /// Bumped on every open/close; a link task only reports for its own
    generation: u64,
    outbound: Option<mpsc::Sender<Message>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn detach(&mut self) -> Option<JoinHandle<()>> {
        self.outbound = None;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.take()
    }
}

struct Shared {
    link: Mutex<Link>,
    events: broadcast::Sender<TransportEvent>,
}

pub struct WsTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config,
            shared: Arc::new(Shared {
                link: Mutex::new(Link {
                    status: TransportStatus::Closed,
                    generation: 0,
                    outbound: None,
                    shutdown: None,
                    task: None,
                }),
                events,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<(), EngineError> {
        let (generation, previous) = {
            let mut link = self.shared.link.lock();
            link.generation += 1;
            link.status = TransportStatus::Opening;
            (link.generation, link.detach())
        };
        if let Some(task) = previous {
            let _ = timeout(CLOSE_GRACE, task).await;
        }

        debug!(url = %self.config.url, "ws_connecting");
        let connected = timeout(self.config.connect_timeout(), connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "connect",
                after: self.config.connect_timeout(),
            })
            .and_then(|r| r.map_err(|e| EngineError::Transport(e.to_string())));

        let ws = match connected {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let mut link = self.shared.link.lock();
                if link.generation == generation {
                    link.status = TransportStatus::Closed;
                }
                warn!(url = %self.config.url, error = %e, "ws_connect_failed");
                return Err(e);
            }
        };

        let mut link = self.shared.link.lock();
        if link.generation != generation {
            // close() or another open() won the race; drop this socket
            return Err(EngineError::Transport("open superseded".to_string()));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.send_queue.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = self.shared.clone();
        link.task = Some(tokio::spawn(run_link(
            shared,
            generation,
            ws,
            outbound_rx,
            shutdown_rx,
        )));
        link.outbound = Some(outbound_tx);
        link.shutdown = Some(shutdown_tx);
        link.status = TransportStatus::Open;

        info!(url = %self.config.url, "ws_connected");
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        let outbound = {
            let link = self.shared.link.lock();
            match (&link.status, &link.outbound) {
                (TransportStatus::Open, Some(tx)) => tx.clone(),
                _ => return Err(EngineError::TransportNotReady),
            }
        };
        let text = serde_json::to_string(&message)
            .map_err(|e| EngineError::Protocol(format!("encode failed: {e}")))?;
        outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| EngineError::Transport("send queue closed".to_string()))
    }

    async fn close(&self) {
        let task = {
            let mut link = self.shared.link.lock();
            link.generation += 1;
            link.status = TransportStatus::Closed;
            link.detach()
        };
        if let Some(task) = task {
            if timeout(CLOSE_GRACE, task).await.is_err() {
                debug!("ws_close_grace_elapsed");
            }
            info!(url = %self.config.url, "ws_closed");
        }
    }

    fn status(&self) -> TransportStatus {
        self.shared.link.lock().status
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

async fn run_link(
    shared: Arc<Shared>,
    generation: u64,
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (mut write, mut read) = ws.split();

    let lost: Option<String> = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = write.send(frame).await {
                    break Some(format!("write failed: {e}"));
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        let _ = shared.events.send(TransportEvent::Message(message));
                    }
                    Err(e) => warn!(error = %e, "ws_message_decode_failed"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break Some(match frame {
                        Some(f) => format!("closed by server: {} {}", f.code, f.reason),
                        None => "closed by server".to_string(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("stream ended".to_string()),
            }
        }
    };

    let current = {
        let mut link = shared.link.lock();
        let current = link.generation == generation;
        if current {
            link.status = TransportStatus::Closed;
            link.outbound = None;
            link.shutdown = None;
            link.task = None;
        }
        current
    };

    if let (true, Some(reason)) = (current, lost) {
        warn!(reason = %reason, "ws_link_lost");
        let _ = shared.events.send(TransportEvent::Closed { reason });
    }
}
