//! Real-time channel abstraction
//!
//! Only the connection manager opens and closes the transport; every other
//! component just sends and listens.

pub mod ws;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::models::{ClientMessage, ServerMessage};

pub use ws::WsTransport;

/// Coarse link status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Closed,
    Opening,
    Open,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Opening => write!(f, "OPENING"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The open link ended without `close()` being called
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new link, replacing any existing one
    async fn open(&self) -> Result<(), EngineError>;

    /// Queue a message; `TransportNotReady` unless the link is open
    async fn send(&self, message: ClientMessage) -> Result<(), EngineError>;

    /// Close the link. Does not emit `TransportEvent::Closed`.
    async fn close(&self);

    fn status(&self) -> TransportStatus;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn is_open(&self) -> bool {
        self.status() == TransportStatus::Open
    }
}
