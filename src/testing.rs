//! Scripted collaborators for engine tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::auth::AuthProvider;
use crate::error::EngineError;
use crate::models::{ClientMessage, HeartbeatAck, ServerMessage, SessionInfo, SimulatorStatus};
use crate::notify::{Notifier, NotifyLevel};
use crate::simulator::{SimulatorApi, SimulatorRequest};
use crate::transport::{Transport, TransportEvent, TransportStatus};

/// How the scripted server answers `request_session`
#[derive(Debug, Clone)]
pub struct SessionReply {
    pub include_device_id: bool,
    pub session_id: Option<String>,
    pub simulator_id: Option<String>,
    pub simulator_status: Option<SimulatorStatus>,
    pub device_id_valid: Option<bool>,
}

impl Default for SessionReply {
    fn default() -> Self {
        Self {
            include_device_id: true,
            session_id: Some("s-1".to_string()),
            simulator_id: Some("sim-1".to_string()),
            simulator_status: None,
            device_id_valid: Some(true),
        }
    }
}

/// In-process transport whose server side is a script
pub struct ScriptedTransport {
    status: Mutex<TransportStatus>,
    open_results: Mutex<VecDeque<Result<(), EngineError>>>,
    open_delay: Mutex<Duration>,
    fail_all_opens: AtomicBool,
    auto_ack: AtomicBool,
    device_valid_in_acks: AtomicBool,
    ack_simulator_status: Mutex<Option<SimulatorStatus>>,
    session_reply: Mutex<Option<SessionReply>>,
    events: broadcast::Sender<TransportEvent>,
    sent: Mutex<Vec<ClientMessage>>,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            status: Mutex::new(TransportStatus::Closed),
            open_results: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(Duration::ZERO),
            fail_all_opens: AtomicBool::new(false),
            auto_ack: AtomicBool::new(true),
            device_valid_in_acks: AtomicBool::new(true),
            ack_simulator_status: Mutex::new(None),
            session_reply: Mutex::new(Some(SessionReply::default())),
            events,
            sent: Mutex::new(Vec::new()),
            open_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
        })
    }

    /// Mark the link open without going through `open()`
    pub fn open_now(&self) {
        *self.status.lock() = TransportStatus::Open;
    }

    /// Queue one `open()` outcome; an empty queue means success
    pub fn push_open_result(&self, result: Result<(), EngineError>) {
        self.open_results.lock().push_back(result);
    }

    pub fn set_fail_all_opens(&self, fail: bool) {
        self.fail_all_opens.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_ack_device_valid(&self, valid: bool) {
        self.device_valid_in_acks.store(valid, Ordering::SeqCst);
    }

    pub fn set_ack_simulator_status(&self, status: Option<SimulatorStatus>) {
        *self.ack_simulator_status.lock() = status;
    }

    /// `None` leaves session requests unanswered
    pub fn set_session_reply(&self, reply: Option<SessionReply>) {
        *self.session_reply.lock() = reply;
    }

    pub fn inject(&self, message: ServerMessage) {
        let _ = self.events.send(TransportEvent::Message(message));
    }

    /// Simulate the server side going away
    pub fn drop_connection(&self, reason: &str) {
        *self.status.lock() = TransportStatus::Closed;
        let _ = self.events.send(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Timestamps of every heartbeat probe sent so far
    pub fn sent_heartbeats(&self) -> Vec<i64> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Heartbeat { timestamp, .. } => Some(*timestamp),
                _ => None,
            })
            .collect()
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn respond(&self, message: &ClientMessage) {
        let reply = match message {
            ClientMessage::Heartbeat { timestamp, .. } => {
                if !self.auto_ack.load(Ordering::SeqCst) {
                    return;
                }
                ServerMessage::HeartbeatAck(HeartbeatAck {
                    client_timestamp: *timestamp,
                    device_id_valid: self.device_valid_in_acks.load(Ordering::SeqCst),
                    simulator_status: *self.ack_simulator_status.lock(),
                })
            }
            ClientMessage::RequestSession {
                request_id,
                device_id,
            } => {
                let Some(reply) = self.session_reply.lock().clone() else {
                    return;
                };
                ServerMessage::SessionInfo(SessionInfo {
                    request_id: request_id.clone(),
                    device_id: reply.include_device_id.then(|| device_id.clone()),
                    session_id: reply.session_id,
                    simulator_id: reply.simulator_id,
                    simulator_status: reply.simulator_status,
                    device_id_valid: reply.device_id_valid,
                })
            }
            ClientMessage::StopSession { request_id } => {
                if self.session_reply.lock().is_none() {
                    return;
                }
                ServerMessage::SessionStopped {
                    request_id: request_id.clone(),
                    success: true,
                }
            }
        };
        let _ = self.events.send(TransportEvent::Message(reply));
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<(), EngineError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = TransportStatus::Opening;

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if self.fail_all_opens.load(Ordering::SeqCst) {
            Err(EngineError::Transport("connection refused".to_string()))
        } else {
            self.open_results.lock().pop_front().unwrap_or(Ok(()))
        };
        *self.status.lock() = if result.is_ok() {
            TransportStatus::Open
        } else {
            TransportStatus::Closed
        };
        result
    }

    async fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        if *self.status.lock() != TransportStatus::Open {
            return Err(EngineError::TransportNotReady);
        }
        self.sent.lock().push(message.clone());
        self.respond(&message);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = TransportStatus::Closed;
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

pub struct FakeAuth {
    resolved: AtomicBool,
    authenticated: AtomicBool,
}

impl FakeAuth {
    pub fn signed_in() -> Arc<Self> {
        Arc::new(Self {
            resolved: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
        })
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self {
            resolved: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            resolved: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn resolve(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
        self.resolved.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn access_token(&self) -> Option<String> {
        self.is_authenticated().then(|| "test-token".to_string())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    posted: Mutex<Vec<(NotifyLevel, String, Option<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn posted(&self) -> Vec<(NotifyLevel, String, Option<String>)> {
        self.posted.lock().clone()
    }

    pub fn count(&self, level: NotifyLevel) -> usize {
        self.posted.lock().iter().filter(|(l, _, _)| *l == level).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(
        &self,
        level: NotifyLevel,
        message: &str,
        _duration: Option<Duration>,
        dedupe_id: Option<&str>,
    ) {
        self.posted
            .lock()
            .push((level, message.to_string(), dedupe_id.map(str::to_string)));
    }
}

pub struct MockSimulatorApi {
    delay: Mutex<Duration>,
    reply: Mutex<Result<SimulatorStatus, EngineError>>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl MockSimulatorApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delay: Mutex::new(Duration::ZERO),
            reply: Mutex::new(Ok(SimulatorStatus::Unknown)),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_reply(&self, reply: Result<SimulatorStatus, EngineError>) {
        *self.reply.lock() = reply;
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Delay and reply are fixed when the call is made
    async fn answer(&self) -> Result<SimulatorStatus, EngineError> {
        let delay = *self.delay.lock();
        let reply = self.reply.lock().clone();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

#[async_trait]
impl SimulatorApi for MockSimulatorApi {
    async fn start(&self, _request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await
    }

    async fn stop(&self, _request: &SimulatorRequest) -> Result<SimulatorStatus, EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await
    }
}

/// Poll `check` on the (possibly paused) clock until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
