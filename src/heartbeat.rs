//! Heartbeat Monitor
//! Mission: Prove the link is alive end to end and measure its round trip
//!
//! Probes go out immediately on start and then every `interval`. Each probe
//! carries a strictly increasing client timestamp; the server echoes it in
//! `heartbeat_ack`, which is how a response is paired with its probe. A probe
//! unanswered after `timeout` is a miss, and reaching `max_misses` ends
//! probing with `HeartbeatEvent::Timeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::events::{HeartbeatEvent, Listeners};
use crate::identity::DeviceIdentity;
use crate::models::{ClientMessage, ConnectionQuality, HeartbeatAck};
use crate::transport::Transport;

/// Liveness bookkeeping for the current link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_ack_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub consecutive_misses: u32,
}

impl HeartbeatRecord {
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::assess(self.latency_ms, self.consecutive_misses)
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    timestamp: i64,
    sent_at: Instant,
}

#[derive(Default)]
struct State {
    record: HeartbeatRecord,
    pending: Option<Probe>,
    last_timestamp: i64,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    transport: Arc<dyn Transport>,
    device: Arc<dyn DeviceIdentity>,
    state: Mutex<State>,
    /// Timestamp of the latest matched ack
    acks: watch::Sender<i64>,
    active: AtomicBool,
    listeners: Listeners<HeartbeatEvent>,
}

impl HeartbeatMonitor {
    pub fn new(
        config: HeartbeatConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceIdentity>,
    ) -> Arc<Self> {
        let (acks, _) = watch::channel(0);
        Arc::new(Self {
            config,
            transport,
            device,
            state: Mutex::new(State::default()),
            acks,
            active: AtomicBool::new(false),
            listeners: Listeners::new(),
        })
    }

    pub fn listeners(&self) -> &Listeners<HeartbeatEvent> {
        &self.listeners
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> HeartbeatRecord {
        self.state.lock().record.clone()
    }

    /// Start probing; no-op when already active
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        state.generation += 1;
        state.pending = None;
        state.record.consecutive_misses = 0;
        state.record.latency_ms = None;

        let generation = state.generation;
        let this = self.clone();
        if let Some(old) = state.task.take() {
            old.abort();
        }
        state.task = Some(tokio::spawn(async move { this.run(generation).await }));
        info!(
            interval_ms = self.config.interval_ms,
            timeout_ms = self.config.timeout_ms,
            "heartbeat_started"
        );
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        let was_active = self.active.swap(false, Ordering::SeqCst);
        state.generation += 1;
        state.pending = None;
        // Quality describes the live link only
        state.record.latency_ms = None;
        state.record.consecutive_misses = 0;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if was_active {
            debug!("heartbeat_stopped");
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let Some(timestamp) = self.arm(generation) else {
                return;
            };
            let mut acks = self.acks.subscribe();

            let probe = ClientMessage::Heartbeat {
                timestamp,
                device_id: self.device.device_id(),
            };
            if let Err(e) = self.transport.send(probe).await {
                // Left to expire as a miss
                debug!(error = %e, timestamp, "heartbeat_send_failed");
            }

            let answered = matches!(
                timeout(self.config.timeout(), acks.wait_for(|v| *v >= timestamp)).await,
                Ok(Ok(_))
            );
            if answered {
                continue;
            }

            let (misses, timed_out) = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                if matches!(state.pending, Some(p) if p.timestamp == timestamp) {
                    state.pending = None;
                }
                state.record.consecutive_misses += 1;
                let misses = state.record.consecutive_misses;
                let timed_out = misses >= self.config.max_misses;
                if timed_out {
                    // Still under the lock so a racing start() keeps its task
                    self.active.store(false, Ordering::SeqCst);
                    state.task = None;
                }
                (misses, timed_out)
            };

            if timed_out {
                warn!(consecutive_misses = misses, "heartbeat_timeout");
                self.listeners.emit(&HeartbeatEvent::Timeout {
                    consecutive_misses: misses,
                });
                return;
            }

            warn!(consecutive_misses = misses, "heartbeat_missed");
            self.listeners.emit(&HeartbeatEvent::Missed {
                consecutive_misses: misses,
            });
        }
    }

    /// Register the next probe; None once this loop has been superseded
    fn arm(&self, generation: u64) -> Option<i64> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return None;
        }
        let timestamp = Utc::now().timestamp_millis().max(state.last_timestamp + 1);
        state.last_timestamp = timestamp;
        state.pending = Some(Probe {
            timestamp,
            sent_at: Instant::now(),
        });
        state.record.last_sent_at = Some(Utc::now());
        Some(timestamp)
    }

    /// Apply an ack; acks not matching the outstanding probe are ignored
    pub fn handle_ack(&self, ack: &HeartbeatAck) {
        let sample = {
            let mut state = self.state.lock();
            match state.pending {
                Some(probe) if probe.timestamp == ack.client_timestamp => {
                    state.pending = None;
                    let latency_ms = probe.sent_at.elapsed().as_millis() as u64;
                    state.record.latency_ms = Some(latency_ms);
                    state.record.last_ack_at = Some(Utc::now());
                    state.record.consecutive_misses = 0;
                    Some((latency_ms, state.record.quality()))
                }
                _ => None,
            }
        };

        let Some((latency_ms, quality)) = sample else {
            debug!(client_timestamp = ack.client_timestamp, "heartbeat_ack_stale");
            return;
        };

        self.acks.send_replace(ack.client_timestamp);
        debug!(latency_ms, quality = %quality, "heartbeat_ack");
        self.listeners.emit(&HeartbeatEvent::Response {
            latency_ms,
            quality,
            device_id_valid: ack.device_id_valid,
            simulator_status: ack.simulator_status,
        });
    }
}
