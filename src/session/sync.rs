//! Session negotiation over the real-time channel
//!
//! Requests carry a fresh correlation id. The synchronizer subscribes to the
//! inbound stream before sending, then waits for the first message of the
//! expected type carrying the same id. Responses may arrive in any order, so
//! concurrent requests do not interfere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionSyncConfig;
use crate::error::EngineError;
use crate::identity::DeviceIdentity;
use crate::models::{ClientMessage, ServerMessage, SessionInfo, SimulatorStatus};
use crate::transport::{Transport, TransportEvent};

/// Server session as last negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: Option<String>,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub simulator_id: Option<String>,
    pub simulator_status: SimulatorStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopResult {
    pub success: bool,
}

pub struct SessionSynchronizer {
    config: SessionSyncConfig,
    transport: Arc<dyn Transport>,
    device: Arc<dyn DeviceIdentity>,
    session: RwLock<Option<Session>>,
}

impl SessionSynchronizer {
    pub fn new(
        config: SessionSyncConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceIdentity>,
    ) -> Self {
        Self {
            config,
            transport,
            device,
            session: RwLock::new(None),
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn clear(&self) {
        self.session.write().take();
    }

    /// Apply a server-reported simulator status to the current session
    pub fn observe_simulator_status(&self, status: SimulatorStatus) {
        if let Some(session) = self.session.write().as_mut() {
            session.simulator_status = status;
        }
    }

    /// Ask the server to describe (or create) the session for this device
    pub async fn request_session_info(&self) -> Result<SessionInfo, EngineError> {
        let request_id = Uuid::new_v4().to_string();
        let message = ClientMessage::RequestSession {
            request_id: request_id.clone(),
            device_id: self.device.device_id(),
        };

        let info = self
            .request("request_session", message, |m| match m {
                ServerMessage::SessionInfo(info) if info.request_id == request_id => {
                    Some(info.clone())
                }
                _ => None,
            })
            .await?;

        let Some(device_id) = info.device_id.clone() else {
            warn!(request_id = %info.request_id, "session_info_missing_device_id");
            return Err(EngineError::Protocol(
                "session_info without deviceId".to_string(),
            ));
        };

        // A rejected device never becomes the current session
        if info.device_id_valid != Some(false) {
            let mut session = self.session.write();
            let created_at = match session.as_ref() {
                Some(s) if s.session_id.is_some() && s.session_id == info.session_id => s.created_at,
                _ => Utc::now(),
            };
            *session = Some(Session {
                session_id: info.session_id.clone(),
                device_id,
                created_at,
                simulator_id: info.simulator_id.clone(),
                simulator_status: info.simulator_status.unwrap_or_default(),
            });
        }

        info!(
            session_id = ?info.session_id,
            simulator_status = ?info.simulator_status,
            device_id_valid = ?info.device_id_valid,
            "session_info_received"
        );
        Ok(info)
    }

    /// Ask the server to end the session
    pub async fn stop_session(&self) -> Result<StopResult, EngineError> {
        let request_id = Uuid::new_v4().to_string();
        let message = ClientMessage::StopSession {
            request_id: request_id.clone(),
        };

        let success = self
            .request("stop_session", message, |m| match m {
                ServerMessage::SessionStopped {
                    request_id: id,
                    success,
                } if *id == request_id => Some(*success),
                _ => None,
            })
            .await?;

        info!(success, "session_stopped");
        Ok(StopResult { success })
    }

    async fn request<T, M>(
        &self,
        operation: &'static str,
        message: ClientMessage,
        matcher: M,
    ) -> Result<T, EngineError>
    where
        M: Fn(&ServerMessage) -> Option<T>,
    {
        if !self.transport.is_open() {
            return Err(EngineError::TransportNotReady);
        }

        let mut inbound = self.transport.subscribe();
        self.transport.send(message).await?;

        let wait = async {
            loop {
                match inbound.recv().await {
                    Ok(TransportEvent::Message(m)) => {
                        if let Some(found) = matcher(&m) {
                            return Ok(found);
                        }
                    }
                    Ok(TransportEvent::Closed { reason }) => {
                        return Err(EngineError::Transport(reason));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(operation, skipped, "inbound_lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(EngineError::Transport("inbound stream closed".to_string()));
                    }
                }
            }
        };

        let after = self.config.request_timeout();
        match timeout(after, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = after.as_millis() as u64, "request_timed_out");
                Err(EngineError::Timeout { operation, after })
            }
        }
    }
}
