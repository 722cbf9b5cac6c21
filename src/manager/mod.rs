//! Connection Manager
//! Mission: Keep the live connection, session and simulator where the user wants them
//!
//! The manager owns the desired state and every status transition. It reacts
//! to events from the transport, heartbeat monitor, resilience controller and
//! simulator controller, and re-plans after each change.
//!
//! Connection epochs: every connect and every teardown bumps `Core::epoch`.
//! Async continuations capture the epoch they started under and become
//! no-ops once it moves on.

pub mod metrics;
pub mod reconcile;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind};
use crate::events::{
    DeviceEvent, EventChannel, HeartbeatEvent, Listeners, SimulatorEvent, StatusEvent,
    Subscription,
};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatRecord};
use crate::identity::DeviceIdentity;
use crate::models::{
    ConnectionQuality, ConnectionStatus, DesiredState, DesiredStatePatch, DisconnectReason,
    ServerMessage, SessionInfo, SimulatorStatus,
};
use crate::notify::Notifier;
use crate::resilience::{ResilienceController, ResilienceEvent, ResilienceSnapshot, ResilienceState};
use crate::session::{Session, SessionStore, SessionSynchronizer, StopResult, StoredSession};
use crate::simulator::{SimulatorApi, SimulatorController, SimulatorOpResult, SimulatorRequest};
use crate::transport::{Transport, TransportEvent};

pub use metrics::EngineMetrics;
pub use reconcile::{plan, Action, ReconcileInputs};

/// External collaborators injected at construction
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub auth: Arc<dyn AuthProvider>,
    pub device: Arc<dyn DeviceIdentity>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn SessionStore>,
    pub simulator_api: Arc<dyn SimulatorApi>,
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    pub status: ConnectionStatus,
    pub recovering: bool,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub desired: DesiredState,
    pub device_invalidated: bool,
    pub resilience: ResilienceSnapshot,
    pub heartbeat: HeartbeatRecord,
    pub quality: ConnectionQuality,
    pub session: Option<Session>,
    pub simulator_status: SimulatorStatus,
}

struct Core {
    status: ConnectionStatus,
    recovering: bool,
    last_reason: Option<DisconnectReason>,
    desired: DesiredState,
    /// Caller has expressed a simulator preference; until then the
    /// server-reported status is left alone
    simulator_pinned: bool,
    device_invalidated: bool,
    epoch: u64,
    disconnected_at: Option<Instant>,
}

pub struct ConnectionManager {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    device: Arc<dyn DeviceIdentity>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn SessionStore>,
    resilience: Arc<ResilienceController>,
    heartbeat: Arc<HeartbeatMonitor>,
    sync: Arc<SessionSynchronizer>,
    simulator: Arc<SimulatorController>,
    metrics: EngineMetrics,
    core: Mutex<Core>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_events: Listeners<StatusEvent>,
    device_events: Listeners<DeviceEvent>,
    /// Serializes transport open/close
    link: tokio::sync::Mutex<()>,
    router: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    /// Build the engine and start routing inbound traffic. Nothing connects
    /// until the desired state asks for it.
    pub fn spawn(config: EngineConfig, deps: Collaborators) -> Arc<Self> {
        let resilience = ResilienceController::new(config.resilience.clone(), &config.backoff);
        let heartbeat = HeartbeatMonitor::new(
            config.heartbeat.clone(),
            deps.transport.clone(),
            deps.device.clone(),
        );
        let sync = Arc::new(SessionSynchronizer::new(
            config.session.clone(),
            deps.transport.clone(),
            deps.device.clone(),
        ));
        let simulator = Arc::new(SimulatorController::new(deps.simulator_api.clone()));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        let manager = Arc::new(Self {
            config,
            transport: deps.transport,
            auth: deps.auth,
            device: deps.device,
            notifier: deps.notifier,
            store: deps.store,
            resilience,
            heartbeat,
            sync,
            simulator,
            metrics: EngineMetrics::new(),
            core: Mutex::new(Core {
                status: ConnectionStatus::Disconnected,
                recovering: false,
                last_reason: None,
                desired: DesiredState::default(),
                simulator_pinned: false,
                device_invalidated: false,
                epoch: 0,
                disconnected_at: None,
            }),
            status_tx,
            status_events: Listeners::new(),
            device_events: Listeners::new(),
            link: tokio::sync::Mutex::new(()),
            router: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        manager.wire();
        info!(url = %manager.config.transport.url, "engine_started");
        manager
    }

    fn wire(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.resilience.listeners().add(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_resilience_event(event);
            }
        });

        let weak = Arc::downgrade(self);
        self.heartbeat.listeners().add(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.on_heartbeat_event(event);
            }
        });

        let weak = Arc::downgrade(self);
        self.simulator.listeners().add(move |event| {
            if let Some(manager) = weak.upgrade() {
                if let SimulatorEvent::StatusChanged { to, .. } = event {
                    manager.sync.observe_simulator_status(*to);
                }
            }
        });

        let inbound = self.transport.subscribe();
        let router = tokio::spawn(route_inbound(Arc::downgrade(self), inbound));
        *self.router.lock() = Some(router);
    }

    // =========================================================================
    // PUBLIC SURFACE
    // =========================================================================

    pub fn set_desired_state(self: &Arc<Self>, patch: DesiredStatePatch) {
        if self.is_disposed() {
            return;
        }
        let (changed, simulator_changed, connected) = {
            let mut core = self.core.lock();
            let before = core.desired;
            let changed = patch.apply(&mut core.desired);
            if patch.simulator_running.is_some() {
                core.simulator_pinned = true;
            }
            (
                changed,
                before.simulator_running != core.desired.simulator_running,
                core.status == ConnectionStatus::Connected,
            )
        };
        if changed {
            let desired = self.desired();
            info!(
                connected = desired.connected,
                simulator_running = desired.simulator_running,
                "desired_state_changed"
            );
        }
        if simulator_changed && connected {
            tokio::spawn(self.clone().reconcile_simulator());
        }
        self.reconcile();
    }

    pub fn desired(&self) -> DesiredState {
        self.core.lock().desired
    }

    /// Clear exhaustion and identity blocks and connect again. False when
    /// the user is not signed in or the engine is disposed.
    pub fn manual_reconnect(self: &Arc<Self>) -> bool {
        if self.is_disposed() || !self.auth.is_resolved() || !self.auth.is_authenticated() {
            return false;
        }
        info!("manual_reconnect");
        if self.status() != ConnectionStatus::Disconnected {
            self.teardown(DisconnectReason::UserRequested);
        }
        {
            let mut core = self.core.lock();
            core.device_invalidated = false;
            core.desired.connected = true;
        }
        self.resilience.reset();
        self.reconcile();
        true
    }

    /// Start the simulator now if connected; the preference is kept either way
    pub async fn start_simulator(self: &Arc<Self>) -> SimulatorOpResult {
        self.request_simulator(true).await
    }

    pub async fn stop_simulator(self: &Arc<Self>) -> SimulatorOpResult {
        self.request_simulator(false).await
    }

    /// Stop the server session, forget it locally and disconnect
    pub async fn end_session(self: &Arc<Self>) -> StopResult {
        let result = if self.transport.is_open() {
            match self.sync.stop_session().await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "end_session_stop_failed");
                    StopResult { success: false }
                }
            }
        } else {
            StopResult { success: false }
        };

        self.sync.clear();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "session_store_clear_failed");
        }
        self.set_desired_state(DesiredStatePatch {
            connected: Some(false),
            simulator_running: Some(false),
        });
        result
    }

    /// Re-read the auth provider; lifts a device-invalidation block once the
    /// user is signed in again
    pub fn notify_auth_changed(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let authenticated = self.auth.is_resolved() && self.auth.is_authenticated();
        if authenticated {
            let mut core = self.core.lock();
            if core.device_invalidated {
                info!("device_block_lifted_by_reauth");
                core.device_invalidated = false;
            }
        }
        debug!(authenticated, "auth_changed");
        self.reconcile();
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.lock().status
    }

    pub fn get_state(&self) -> EngineState {
        let heartbeat = self.heartbeat.record();
        let quality = heartbeat.quality();
        let resilience = self.resilience.get_state();
        let core = self.core.lock();
        EngineState {
            status: core.status,
            recovering: core.recovering,
            last_disconnect_reason: core.last_reason,
            desired: core.desired,
            device_invalidated: core.device_invalidated,
            resilience,
            heartbeat,
            quality,
            session: self.sync.session(),
            simulator_status: self.simulator.status(),
        }
    }

    /// Wait until the status equals `status`; false on timeout
    pub async fn wait_for_status(&self, status: ConnectionStatus, within: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let reached = tokio::time::timeout(within, rx.wait_for(|s| *s == status))
            .await
            .map(|r| r.is_ok());
        matches!(reached, Ok(true))
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn subscribe_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        Subscription {
            channel: EventChannel::Status,
            id: self.status_events.add(listener),
        }
    }

    pub fn subscribe_heartbeat<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&HeartbeatEvent) + Send + Sync + 'static,
    {
        Subscription {
            channel: EventChannel::Heartbeat,
            id: self.heartbeat.listeners().add(listener),
        }
    }

    pub fn subscribe_simulator<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SimulatorEvent) + Send + Sync + 'static,
    {
        Subscription {
            channel: EventChannel::Simulator,
            id: self.simulator.listeners().add(listener),
        }
    }

    pub fn subscribe_device<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        Subscription {
            channel: EventChannel::Device,
            id: self.device_events.add(listener),
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        match subscription.channel {
            EventChannel::Status => self.status_events.remove(subscription.id),
            EventChannel::Heartbeat => self.heartbeat.listeners().remove(subscription.id),
            EventChannel::Simulator => self.simulator.listeners().remove(subscription.id),
            EventChannel::Device => self.device_events.remove(subscription.id),
        }
    }

    /// Disconnect, stop every timer and drop every subscriber. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = {
            let mut core = self.core.lock();
            core.epoch += 1;
            core.recovering = false;
            self.transition(&mut core, ConnectionStatus::Disconnected, Some(DisconnectReason::Disposed))
        };
        self.publish(event);

        self.resilience.shutdown();
        self.heartbeat.stop();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.status_events.clear();
        self.device_events.clear();
        self.heartbeat.listeners().clear();
        self.simulator.listeners().clear();

        let _link = self.link.lock().await;
        self.transport.close().await;
        info!(metrics = %self.metrics.summary(), "engine_disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // RECONCILIATION
    // =========================================================================

    fn reconcile(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let resilience = self.resilience.state();
        let inputs = {
            let core = self.core.lock();
            ReconcileInputs {
                auth_resolved: self.auth.is_resolved(),
                authenticated: self.auth.is_authenticated(),
                device_invalidated: core.device_invalidated,
                resilience,
                status: core.status,
                desired: core.desired,
            }
        };

        let action = plan(&inputs);
        debug!(?action, status = %inputs.status, resilience = %inputs.resilience, "reconcile");
        match action {
            Action::Defer | Action::Converged => {}
            Action::Connect => {
                if let Some(epoch) = self.begin_connect(false) {
                    tokio::spawn(self.clone().connect(epoch));
                }
            }
            Action::Disconnect(reason) => self.teardown(reason),
        }
    }

    /// Claim the transition to `Connecting`; None when another path already
    /// owns the connection
    fn begin_connect(&self, recovery: bool) -> Option<u64> {
        let (epoch, event) = {
            let mut core = self.core.lock();
            if core.status != ConnectionStatus::Disconnected {
                return None;
            }
            if recovery {
                let identity_ok = self.auth.is_authenticated() && !core.device_invalidated;
                if !identity_ok || !core.desired.connected {
                    return None;
                }
            }
            core.epoch += 1;
            let event = self.transition(&mut core, ConnectionStatus::Connecting, None);
            (core.epoch, event)
        };
        self.metrics.record_connect_attempt();
        self.publish(event);
        Some(epoch)
    }

    async fn connect(self: Arc<Self>, epoch: u64) {
        let established = match self.open_link(epoch).await {
            Ok(()) if !self.is_current(epoch) => {
                debug!(epoch, "connect_superseded_after_open");
                return;
            }
            Ok(()) => self.validate_session().await,
            Err(e) => Err(e),
        };
        if !self.is_current(epoch) {
            debug!(epoch, "connect_result_stale");
            return;
        }
        match established {
            Ok(info) => self.on_established(epoch, info).await,
            Err(e) => self.on_connect_failed(epoch, e),
        }
    }

    async fn open_link(&self, epoch: u64) -> Result<(), EngineError> {
        let _link = self.link.lock().await;
        if !self.is_current(epoch) {
            return Err(EngineError::Transport("superseded".to_string()));
        }
        self.transport.open().await
    }

    /// Describe the session and check the server still accepts this device
    async fn validate_session(&self) -> Result<SessionInfo, EngineError> {
        let info = self.sync.request_session_info().await?;
        if info.device_id_valid == Some(false) {
            return Err(EngineError::Identity(
                "device id rejected by session service".to_string(),
            ));
        }
        Ok(info)
    }

    async fn on_established(self: &Arc<Self>, epoch: u64, info: SessionInfo) {
        let (event, desired_connected) = {
            let mut core = self.core.lock();
            if core.epoch != epoch || self.is_disposed() {
                return;
            }
            if core.desired.connected {
                core.recovering = false;
                core.last_reason = None;
                (
                    self.transition(&mut core, ConnectionStatus::Connected, None),
                    true,
                )
            } else {
                (None, false)
            }
        };

        if !desired_connected {
            // Desired state moved on while the handshake was in flight
            self.teardown(DisconnectReason::UserRequested);
            return;
        }

        self.publish(event);
        self.metrics.record_connect_success();
        self.resilience.record_success();
        if let Some(status) = info.simulator_status {
            self.simulator.observe(status);
        }
        self.heartbeat.start();

        let stored = StoredSession {
            token: self.auth.access_token().await,
            session_id: info.session_id.clone(),
            simulator_id: info.simulator_id.clone(),
            last_active: chrono::Utc::now(),
        };
        if let Err(e) = self.store.save(&stored) {
            warn!(error = %e, "session_store_save_failed");
        }

        if self.is_current(epoch) {
            tokio::spawn(self.clone().reconcile_simulator());
        }
    }

    fn on_connect_failed(self: &Arc<Self>, epoch: u64, error: EngineError) {
        self.metrics.record_connect_failure();
        warn!(error = %error, kind = %error.kind(), "connect_failed");

        if error.kind() == FailureKind::Identity {
            let device_id = self.device.device_id();
            self.invalidate_device(&device_id, Some(error.to_string()));
            return;
        }

        let (event, close_epoch) = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return;
            }
            core.epoch += 1;
            let event = self.transition(
                &mut core,
                ConnectionStatus::Disconnected,
                Some(DisconnectReason::ConnectFailed),
            );
            (event, core.epoch)
        };
        self.publish(event);
        self.close_link(close_epoch);
        self.resilience.record_failure(&error.reason());
        self.attempt_recovery();
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.is_disposed() && self.core.lock().epoch == epoch
    }

    // =========================================================================
    // RECOVERY
    // =========================================================================

    fn attempt_recovery(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let eligible = {
            let core = self.core.lock();
            self.auth.is_resolved()
                && self.auth.is_authenticated()
                && !core.device_invalidated
                && core.desired.connected
                && core.status == ConnectionStatus::Disconnected
        };
        if !eligible {
            debug!("recovery_not_eligible");
            return;
        }

        let weak = Arc::downgrade(self);
        let admitted = self.resilience.attempt_reconnection(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(manager) => manager.recovery_attempt().await,
                    None => false,
                }
            }
        });
        if !admitted {
            debug!(resilience = %self.resilience.state(), "recovery_not_admitted");
        }
    }

    /// One attempt inside the resilience loop: the full connect chain, open
    /// then session request
    async fn recovery_attempt(self: Arc<Self>) -> bool {
        let Some(epoch) = self.begin_connect(true) else {
            return false;
        };
        let attempt = match self.open_link(epoch).await {
            Ok(()) if !self.is_current(epoch) => return false,
            Ok(()) => self.validate_session().await.map(|_| ()),
            Err(e) => Err(e),
        };
        let error = match attempt {
            Ok(()) => return self.is_current(epoch),
            Err(e) => e,
        };

        debug!(error = %error, kind = %error.kind(), "recovery_attempt_failed");
        self.metrics.record_connect_failure();
        if error.kind() == FailureKind::Identity && self.is_current(epoch) {
            let device_id = self.device.device_id();
            self.invalidate_device(&device_id, Some(error.to_string()));
            return false;
        }

        let (event, close_epoch) = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                return false;
            }
            core.epoch += 1;
            let event = self.transition(
                &mut core,
                ConnectionStatus::Disconnected,
                Some(DisconnectReason::ConnectFailed),
            );
            (event, core.epoch)
        };
        self.publish(event);
        self.close_link(close_epoch);
        false
    }

    /// The loop reports success; re-validate the session before declaring
    /// the connection usable, since the link underneath may have rotated.
    /// A failure here escalates to a fresh connection-level failure.
    async fn finish_recovery(self: Arc<Self>, epoch: u64) {
        let validated = self.validate_session().await;
        if !self.is_current(epoch) {
            return;
        }
        match validated {
            Ok(info) => {
                self.metrics.record_recovery();
                info!(session_id = ?info.session_id, "recovery_complete");
                self.on_established(epoch, info).await;
            }
            Err(e) => {
                warn!(error = %e, "recovery_validation_failed");
                self.on_connect_failed(epoch, e);
            }
        }
    }

    fn on_resilience_event(self: &Arc<Self>, event: &ResilienceEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            ResilienceEvent::RetryScheduled { attempt, delay } => {
                self.status_events.emit(&StatusEvent::RecoveryScheduled {
                    attempt: *attempt,
                    delay: *delay,
                });
            }
            ResilienceEvent::ReconnectSuccess { attempt } => {
                debug!(attempt, "reconnect_success");
                let epoch = self.core.lock().epoch;
                tokio::spawn(self.clone().finish_recovery(epoch));
            }
            ResilienceEvent::ReconnectFailure { attempt } => {
                debug!(attempt, "reconnect_failure");
            }
            ResilienceEvent::StateChanged { from, to } => match (from, to) {
                (_, ResilienceState::Suspended) => {
                    self.metrics.record_breaker_trip();
                    let cooldown = self.config.resilience.cooldown();
                    let event = {
                        let mut core = self.core.lock();
                        if core.status == ConnectionStatus::Disconnected {
                            core.recovering = false;
                            self.transition(&mut core, ConnectionStatus::Failed, None)
                        } else {
                            None
                        }
                    };
                    self.publish(event);
                    self.status_events.emit(&StatusEvent::Suspended { cooldown });
                    self.notifier.warn(
                        &format!(
                            "Connection unstable. Retrying in {}s.",
                            cooldown.as_secs()
                        ),
                        Some("resilience_suspended"),
                    );
                }
                (_, ResilienceState::GivenUp) => {
                    let attempts = self.resilience.get_state().attempt;
                    let event = {
                        let mut core = self.core.lock();
                        core.recovering = false;
                        self.transition(&mut core, ConnectionStatus::Failed, None)
                    };
                    self.publish(event);
                    self.status_events.emit(&StatusEvent::GaveUp { attempts });
                    self.notifier.error(
                        "Unable to reach the session service. Reconnect manually.",
                        Some("resilience_given_up"),
                    );
                }
                (ResilienceState::Suspended, ResilienceState::Idle) => {
                    let event = {
                        let mut core = self.core.lock();
                        if core.status == ConnectionStatus::Failed {
                            self.transition(&mut core, ConnectionStatus::Disconnected, None)
                        } else {
                            None
                        }
                    };
                    self.publish(event);
                    self.status_events.emit(&StatusEvent::Resumed);
                    self.reconcile();
                }
                _ => {}
            },
        }
    }

    // =========================================================================
    // FAILURE INTAKE
    // =========================================================================

    fn on_heartbeat_event(self: &Arc<Self>, event: &HeartbeatEvent) {
        match event {
            HeartbeatEvent::Response {
                device_id_valid,
                simulator_status,
                ..
            } => {
                if !device_id_valid {
                    let device_id = self.device.device_id();
                    self.invalidate_device(&device_id, Some("rejected by heartbeat".to_string()));
                    return;
                }
                if let Some(status) = simulator_status {
                    self.simulator.observe(*status);
                }
            }
            HeartbeatEvent::Missed { .. } => {}
            HeartbeatEvent::Timeout { .. } => {
                self.metrics.record_heartbeat_timeout();
                self.connection_lost(DisconnectReason::HeartbeatTimeout);
            }
        }
    }

    fn on_transport_closed(self: &Arc<Self>, reason: &str) {
        if self.status() == ConnectionStatus::Connected {
            warn!(reason, "transport_closed_while_connected");
            self.connection_lost(DisconnectReason::TransportClosed);
        }
    }

    fn on_server_message(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::HeartbeatAck(ack) => self.heartbeat.handle_ack(&ack),
            ServerMessage::DeviceIdInvalidated { device_id, reason } => {
                if self.core.lock().device_invalidated {
                    return;
                }
                let current = self.device.device_id();
                if device_id != current {
                    debug!(device_id = %device_id, "device_invalidation_for_other_device");
                    return;
                }
                self.invalidate_device(&device_id, reason);
            }
            ServerMessage::SessionInfo(info) => {
                if info.device_id_valid == Some(false) {
                    // device_id() would mint a replacement once cleared
                    if self.core.lock().device_invalidated {
                        return;
                    }
                    let current = self.device.device_id();
                    match info.device_id.as_deref() {
                        Some(other) if other != current => {
                            debug!(device_id = %other, "session_info_for_other_device");
                        }
                        _ => self.invalidate_device(&current, None),
                    }
                    return;
                }
                // Solicited replies are consumed by the synchronizer; pushes
                // carry fresh simulator status
                if self.status() == ConnectionStatus::Connected {
                    if let Some(status) = info.simulator_status {
                        self.simulator.observe(status);
                    }
                }
            }
            ServerMessage::SessionStopped { .. } | ServerMessage::Unknown => {}
        }
    }

    /// An established connection went away underneath us
    fn connection_lost(self: &Arc<Self>, reason: DisconnectReason) {
        let (event, close_epoch) = {
            let mut core = self.core.lock();
            if core.status != ConnectionStatus::Connected {
                return;
            }
            core.epoch += 1;
            core.recovering = true;
            let event = self.transition(&mut core, ConnectionStatus::Disconnected, Some(reason));
            (event, core.epoch)
        };
        warn!(reason = %reason, "connection_lost");
        self.publish(event);
        self.heartbeat.stop();
        self.close_link(close_epoch);
        self.resilience.record_failure(&reason.to_string());
        self.attempt_recovery();
    }

    fn invalidate_device(self: &Arc<Self>, device_id: &str, reason: Option<String>) {
        if self.is_disposed() {
            return;
        }
        {
            let mut core = self.core.lock();
            if core.device_invalidated {
                return;
            }
            core.device_invalidated = true;
            core.recovering = false;
        }
        warn!(device_id, reason = ?reason, "device_id_invalidated");
        self.metrics.record_device_invalidation();

        self.device.clear_device_id();
        self.sync.clear();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "session_store_clear_failed");
        }
        self.resilience.reset();
        self.teardown(DisconnectReason::DeviceIdInvalidated);

        self.device_events.emit(&DeviceEvent::Invalidated {
            device_id: device_id.to_string(),
            reason,
        });
        self.notifier.error(
            "This device was signed out because your account is active elsewhere. Sign in again to reconnect.",
            Some("device_id_invalidated"),
        );
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Deliberate disconnect: stop timers and the attempt loop, close the link
    fn teardown(self: &Arc<Self>, reason: DisconnectReason) {
        let (event, close_epoch) = {
            let mut core = self.core.lock();
            core.epoch += 1;
            core.recovering = false;
            let event = self.transition(&mut core, ConnectionStatus::Disconnected, Some(reason));
            (event, core.epoch)
        };
        info!(reason = %reason, "teardown");
        self.publish(event);
        self.heartbeat.stop();
        self.resilience.reset();
        self.close_link(close_epoch);
    }

    /// Close the transport unless a newer connect has claimed it by then
    fn close_link(self: &Arc<Self>, epoch: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let _link = manager.link.lock().await;
            let current = manager.core.lock().epoch == epoch;
            if !current {
                return;
            }
            manager.transport.close().await;
        });
    }

    // =========================================================================
    // SIMULATOR
    // =========================================================================

    async fn request_simulator(self: &Arc<Self>, running: bool) -> SimulatorOpResult {
        if self.is_disposed() {
            return SimulatorOpResult::failed(self.simulator.status(), EngineError::Disposed.to_string());
        }
        {
            let mut core = self.core.lock();
            core.desired.simulator_running = running;
            core.simulator_pinned = true;
        }
        if self.status() != ConnectionStatus::Connected {
            return SimulatorOpResult::failed(
                self.simulator.status(),
                EngineError::TransportNotReady.to_string(),
            );
        }
        self.apply_simulator(running).await
    }

    async fn reconcile_simulator(self: Arc<Self>) {
        let (pinned, desired, status) = {
            let core = self.core.lock();
            (core.simulator_pinned, core.desired, core.status)
        };
        if !pinned || status != ConnectionStatus::Connected {
            return;
        }
        let _ = self.apply_simulator(desired.simulator_running).await;
    }

    async fn apply_simulator(self: &Arc<Self>, running: bool) -> SimulatorOpResult {
        let ctx = SimulatorRequest {
            session_id: self.sync.session().and_then(|s| s.session_id),
            device_id: self.device.device_id(),
            access_token: self.auth.access_token().await,
        };
        let result = if running {
            self.simulator.start(&ctx).await
        } else {
            self.simulator.stop(&ctx).await
        };

        if !result.success {
            self.metrics.record_simulator_failure();
            if running {
                self.core.lock().desired.simulator_running = false;
            }
            let error = result.error.as_deref().unwrap_or("unknown error");
            self.notifier.warn(
                &format!(
                    "Simulator could not be {}: {}",
                    if running { "started" } else { "stopped" },
                    error
                ),
                Some("simulator_failed"),
            );
        }
        result
    }

    // =========================================================================
    // STATUS BOOKKEEPING
    // =========================================================================

    /// Apply a status change under the core lock. The returned event must be
    /// published after the lock is released.
    fn transition(
        &self,
        core: &mut Core,
        to: ConnectionStatus,
        reason: Option<DisconnectReason>,
    ) -> Option<StatusEvent> {
        if reason.is_some() {
            core.last_reason = reason;
        }
        if core.status == to {
            return None;
        }
        let from = core.status;
        core.status = to;

        match (from, to) {
            (ConnectionStatus::Connected, _) => core.disconnected_at = Some(Instant::now()),
            (_, ConnectionStatus::Connected) => {
                if let Some(since) = core.disconnected_at.take() {
                    self.metrics.add_downtime(since.elapsed());
                }
            }
            _ => {}
        }

        self.status_tx.send_replace(to);
        info!(
            from = %from,
            to = %to,
            reason = ?reason,
            recovering = core.recovering,
            "connection_transition"
        );
        Some(StatusEvent::Changed {
            from,
            to,
            recovering: core.recovering,
            reason,
        })
    }

    fn publish(&self, event: Option<StatusEvent>) {
        if let Some(event) = event {
            self.status_events.emit(&event);
        }
    }
}

async fn route_inbound(
    manager: Weak<ConnectionManager>,
    mut inbound: tokio::sync::broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = match inbound.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "inbound_router_lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(message) => manager.on_server_message(message),
            TransportEvent::Closed { reason } => manager.on_transport_closed(&reason),
        }
    }
}
