//! Engine event channels
//!
//! One closed event type per channel, dispatched to registered listeners.
//! Listeners run synchronously on the emitting task, after the emitter has
//! released its own locks, so a listener may call back into the engine.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::RwLock;

use crate::models::{
    ConnectionQuality, ConnectionStatus, DisconnectReason, SimulatorStatus,
};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Listener registry for one event type
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Listener<E>)>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning its id
    pub fn add<F>(&self, listener: F) -> u64
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; false if the id was unknown
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Deliver `event` to every listener registered at call time
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// CHANNELS
// =============================================================================

/// Connection status channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Changed {
        from: ConnectionStatus,
        to: ConnectionStatus,
        recovering: bool,
        reason: Option<DisconnectReason>,
    },
    /// Reconnection temporarily suspended by the circuit breaker
    Suspended { cooldown: Duration },
    /// Cooldown elapsed or resilience was reset
    Resumed,
    /// A recovery attempt was scheduled
    RecoveryScheduled { attempt: u32, delay: Duration },
    /// Attempts exhausted; a manual reconnect is required
    GaveUp { attempts: u32 },
}

/// Heartbeat channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    Response {
        latency_ms: u64,
        quality: ConnectionQuality,
        device_id_valid: bool,
        simulator_status: Option<SimulatorStatus>,
    },
    /// A probe went unanswered but the miss threshold was not reached
    Missed { consecutive_misses: u32 },
    /// Miss threshold reached; probing stopped
    Timeout { consecutive_misses: u32 },
}

/// Simulator channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorEvent {
    StatusChanged {
        from: SimulatorStatus,
        to: SimulatorStatus,
    },
    OperationFailed {
        operation: &'static str,
        error: String,
    },
}

/// Device identity channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Invalidated {
        device_id: String,
        reason: Option<String>,
    },
}

/// Which channel a subscription belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    Status,
    Heartbeat,
    Simulator,
    Device,
}

/// Handle returned by the manager's `subscribe_*` methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub channel: EventChannel,
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_and_remove() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = listeners.add(move |v| sink.lock().push(*v));
        listeners.emit(&1);
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&2);

        assert_eq!(*seen.lock(), vec![1]);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_listener_may_reenter_registry() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let inner = listeners.clone();
        listeners.add(move |_| {
            // Registering from inside a callback must not deadlock
            inner.add(|_| {});
        });
        listeners.emit(&0);
        assert_eq!(listeners.len(), 2);
    }
}
