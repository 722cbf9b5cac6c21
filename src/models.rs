//! Shared engine types and wire messages

use serde::{Deserialize, Serialize};

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// Externally visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Resilience exhausted; needs a manual reconnect
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why the engine left (or refused) a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    UserRequested,
    AuthLost,
    DeviceIdInvalidated,
    HeartbeatTimeout,
    TransportClosed,
    ConnectFailed,
    SessionInvalid,
    Disposed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user_requested"),
            Self::AuthLost => write!(f, "auth_lost"),
            Self::DeviceIdInvalidated => write!(f, "device_id_invalidated"),
            Self::HeartbeatTimeout => write!(f, "heartbeat_timeout"),
            Self::TransportClosed => write!(f, "transport_closed"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::SessionInvalid => write!(f, "session_invalid"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// What the caller wants; the reconciler chases it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub connected: bool,
    pub simulator_running: bool,
}

/// Partial update of `DesiredState`; `None` fields are left alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredStatePatch {
    pub connected: Option<bool>,
    pub simulator_running: Option<bool>,
}

impl DesiredStatePatch {
    pub fn connected(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            simulator_running: None,
        }
    }

    pub fn simulator_running(running: bool) -> Self {
        Self {
            connected: None,
            simulator_running: Some(running),
        }
    }

    /// Apply onto `desired`, returning true when anything changed
    pub fn apply(&self, desired: &mut DesiredState) -> bool {
        let before = *desired;
        if let Some(connected) = self.connected {
            desired.connected = connected;
        }
        if let Some(running) = self.simulator_running {
            desired.simulator_running = running;
        }
        before != *desired
    }
}

/// Link quality derived from the latest heartbeat sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Unknown,
    Good,
    Degraded,
    Poor,
}

pub const GOOD_LATENCY_MS: u64 = 250;
pub const DEGRADED_LATENCY_MS: u64 = 750;

impl ConnectionQuality {
    /// Pure function of the latest latency sample and outstanding misses
    pub fn assess(latency_ms: Option<u64>, consecutive_misses: u32) -> Self {
        if consecutive_misses >= 2 {
            return Self::Poor;
        }
        let by_latency = match latency_ms {
            None => Self::Unknown,
            Some(ms) if ms <= GOOD_LATENCY_MS => Self::Good,
            Some(ms) if ms <= DEGRADED_LATENCY_MS => Self::Degraded,
            Some(_) => Self::Poor,
        };
        if consecutive_misses == 1 {
            by_latency.max(Self::Degraded)
        } else {
            by_latency
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Good => write!(f, "good"),
            Self::Degraded => write!(f, "degraded"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

// =============================================================================
// SIMULATOR
// =============================================================================

/// Remote simulator lifecycle as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulatorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SimulatorStatus {
    /// Running or on its way there
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }

    /// Stopped or on its way there
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Stopped | Self::Stopping)
    }
}

impl std::fmt::Display for SimulatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// =============================================================================
// WIRE MESSAGES
// =============================================================================

/// Messages the engine sends over the real-time channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Heartbeat { timestamp: i64, device_id: String },
    RequestSession { request_id: String, device_id: String },
    StopSession { request_id: String },
}

/// `session_info` payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub request_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub simulator_id: Option<String>,
    #[serde(default)]
    pub simulator_status: Option<SimulatorStatus>,
    #[serde(default)]
    pub device_id_valid: Option<bool>,
}

/// `heartbeat_ack` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub client_timestamp: i64,
    #[serde(default = "default_true")]
    pub device_id_valid: bool,
    #[serde(default)]
    pub simulator_status: Option<SimulatorStatus>,
}

fn default_true() -> bool {
    true
}

/// Messages received from the session service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HeartbeatAck(HeartbeatAck),
    SessionInfo(SessionInfo),
    SessionStopped {
        request_id: String,
        success: bool,
    },
    DeviceIdInvalidated {
        device_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Any message type this engine does not handle
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_shape() {
        let msg = ClientMessage::RequestSession {
            request_id: "r-1".into(),
            device_id: "d1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request_session");
        assert_eq!(json["requestId"], "r-1");
        assert_eq!(json["deviceId"], "d1");

        let hb = serde_json::to_value(ClientMessage::Heartbeat {
            timestamp: 42,
            device_id: "d1".into(),
        })
        .unwrap();
        assert_eq!(hb["type"], "heartbeat");
        assert_eq!(hb["timestamp"], 42);
    }

    #[test]
    fn test_server_message_parsing() {
        let ack: ServerMessage = serde_json::from_str(
            r#"{"type":"heartbeat_ack","clientTimestamp":7,"deviceIdValid":false,"simulatorStatus":"RUNNING"}"#,
        )
        .unwrap();
        assert_eq!(
            ack,
            ServerMessage::HeartbeatAck(HeartbeatAck {
                client_timestamp: 7,
                device_id_valid: false,
                simulator_status: Some(SimulatorStatus::Running),
            })
        );

        let info: ServerMessage = serde_json::from_str(
            r#"{"type":"session_info","requestId":"r-9","deviceId":"d1","simulatorStatus":"PAUSED_FOR_MAINTENANCE"}"#,
        )
        .unwrap();
        match info {
            ServerMessage::SessionInfo(info) => {
                assert_eq!(info.device_id.as_deref(), Some("d1"));
                assert_eq!(info.simulator_status, Some(SimulatorStatus::Unknown));
                assert_eq!(info.session_id, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let invalidated: ServerMessage = serde_json::from_str(
            r#"{"type":"device_id_invalidated","deviceId":"d1","reason":"signed in elsewhere"}"#,
        )
        .unwrap();
        assert!(matches!(invalidated, ServerMessage::DeviceIdInvalidated { .. }));

        let unknown: ServerMessage =
            serde_json::from_str(r#"{"type":"order_update","orderId":"x"}"#).unwrap();
        assert_eq!(unknown, ServerMessage::Unknown);
    }

    #[test]
    fn test_simulator_status_unknown_fallback() {
        assert_eq!(SimulatorStatus::default(), SimulatorStatus::Unknown);
        assert_eq!(
            serde_json::to_string(&SimulatorStatus::Unknown).unwrap(),
            r#""UNKNOWN""#
        );
        let status: SimulatorStatus = serde_json::from_str(r#""HIBERNATING""#).unwrap();
        assert_eq!(status, SimulatorStatus::Unknown);
        let status: SimulatorStatus = serde_json::from_str(r#""RUNNING""#).unwrap();
        assert_eq!(status, SimulatorStatus::Running);
    }

    #[test]
    fn test_quality_assessment() {
        assert_eq!(ConnectionQuality::assess(None, 0), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::assess(Some(250), 0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::assess(Some(251), 0), ConnectionQuality::Degraded);
        assert_eq!(ConnectionQuality::assess(Some(750), 0), ConnectionQuality::Degraded);
        assert_eq!(ConnectionQuality::assess(Some(751), 0), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::assess(Some(40), 1), ConnectionQuality::Degraded);
        assert_eq!(ConnectionQuality::assess(Some(40), 2), ConnectionQuality::Poor);
    }

    #[test]
    fn test_desired_patch() {
        let mut desired = DesiredState::default();
        assert!(DesiredStatePatch::connected(true).apply(&mut desired));
        assert!(!DesiredStatePatch::connected(true).apply(&mut desired));
        assert!(DesiredStatePatch::simulator_running(true).apply(&mut desired));
        assert_eq!(
            desired,
            DesiredState {
                connected: true,
                simulator_running: true
            }
        );
    }
}
