//! simlink - connection resilience and session sync for the trading simulator
//!
//! Exposes the engine for use by the binary and integration tests.
//! `ConnectionManager` is the entry point; everything else is a collaborator
//! it wires together.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod identity;
pub mod manager;
pub mod models;
pub mod notify;
pub mod resilience;
pub mod session;
pub mod simulator;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use config::EngineConfig;
pub use error::{EngineError, FailureKind};
pub use manager::{Collaborators, ConnectionManager, EngineState};
pub use models::{ConnectionStatus, DesiredState, DesiredStatePatch, DisconnectReason};
