//! Circuit breaker around reconnection attempts
//!
//! ```text
//! Idle --attempt--> Attempting --success--> Idle
//!                   Attempting --failure (< threshold)--> Attempting (after backoff)
//!                   Attempting --failure (>= threshold)--> Suspended --cooldown--> Idle
//!                   Attempting --attempt >= max_attempts--> GivenUp
//! any --reset()--> Idle
//! ```
//!
//! Every timer is a spawned task tracked by its `JoinHandle`. A generation
//! counter is bumped on reset and suspension so a continuation that wakes up
//! after either becomes a no-op.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use crate::config::{BackoffConfig, ResilienceConfig};
use crate::events::Listeners;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResilienceState {
    Idle,
    Attempting,
    /// Attempts paused until the cooldown elapses
    Suspended,
    /// Terminal until `reset()`
    GivenUp,
}

impl std::fmt::Display for ResilienceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Attempting => write!(f, "ATTEMPTING"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::GivenUp => write!(f, "GIVEN_UP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResilienceEvent {
    StateChanged {
        from: ResilienceState,
        to: ResilienceState,
    },
    ReconnectSuccess {
        attempt: u32,
    },
    ReconnectFailure {
        attempt: u32,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceSnapshot {
    pub state: ResilienceState,
    pub attempt: u32,
    pub consecutive_failures: u32,
    pub last_failure_reason: Option<String>,
}

struct Inner {
    state: ResilienceState,
    attempt: u32,
    consecutive_failures: u32,
    last_failure_reason: Option<String>,
    backoff: BackoffPolicy,
    generation: u64,
    retry_task: Option<JoinHandle<()>>,
    cooldown_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn transition(&mut self, to: ResilienceState, events: &mut Vec<ResilienceEvent>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!(
            from = %from,
            to = %to,
            attempt = self.attempt,
            consecutive_failures = self.consecutive_failures,
            "resilience_transition"
        );
        events.push(ResilienceEvent::StateChanged { from, to });
    }

    fn clear_counters(&mut self) {
        self.attempt = 0;
        self.consecutive_failures = 0;
        self.last_failure_reason = None;
        self.backoff.reset();
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        if let Some(task) = self.cooldown_task.take() {
            task.abort();
        }
    }
}

pub struct ResilienceController {
    config: ResilienceConfig,
    inner: Mutex<Inner>,
    listeners: Listeners<ResilienceEvent>,
}

impl ResilienceController {
    pub fn new(config: ResilienceConfig, backoff: &BackoffConfig) -> Arc<Self> {
        Self::with_backoff(config, BackoffPolicy::new(backoff))
    }

    pub fn with_backoff(config: ResilienceConfig, backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                state: ResilienceState::Idle,
                attempt: 0,
                consecutive_failures: 0,
                last_failure_reason: None,
                backoff,
                generation: 0,
                retry_task: None,
                cooldown_task: None,
            }),
            listeners: Listeners::new(),
        })
    }

    pub fn listeners(&self) -> &Listeners<ResilienceEvent> {
        &self.listeners
    }

    pub fn get_state(&self) -> ResilienceSnapshot {
        let g = self.inner.lock();
        ResilienceSnapshot {
            state: g.state,
            attempt: g.attempt,
            consecutive_failures: g.consecutive_failures,
            last_failure_reason: g.last_failure_reason.clone(),
        }
    }

    pub fn state(&self) -> ResilienceState {
        self.inner.lock().state
    }

    /// Admit a reconnection loop. Each attempt waits its backoff delay and
    /// then runs `work`; `true` from `work` ends the loop successfully.
    ///
    /// Returns false when refused (`Attempting`, `Suspended`, `GivenUp`, or
    /// the attempt budget is already spent).
    pub fn attempt_reconnection<F, Fut>(self: &Arc<Self>, work: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut events = Vec::new();
        let admitted = {
            let mut g = self.inner.lock();
            let state = g.state;
            match state {
                ResilienceState::Idle if g.attempt >= self.config.max_attempts => {
                    warn!(attempts = g.attempt, "reconnect_budget_exhausted");
                    g.transition(ResilienceState::GivenUp, &mut events);
                    false
                }
                ResilienceState::Idle => {
                    g.transition(ResilienceState::Attempting, &mut events);
                    let generation = g.generation;
                    let this = self.clone();
                    g.retry_task = Some(tokio::spawn(async move {
                        this.run_attempts(generation, work).await;
                    }));
                    true
                }
                state => {
                    debug!(state = %state, "reconnect_attempt_refused");
                    false
                }
            }
        };
        self.emit_all(events);
        admitted
    }

    async fn run_attempts<F, Fut>(self: Arc<Self>, generation: u64, work: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        loop {
            let (attempt, delay) = {
                let mut g = self.inner.lock();
                if g.generation != generation {
                    return;
                }
                g.attempt += 1;
                let delay = g.backoff.next();
                (g.attempt, delay)
            };
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect_scheduled"
            );
            self.listeners
                .emit(&ResilienceEvent::RetryScheduled { attempt, delay });

            tokio::time::sleep(delay).await;
            if self.inner.lock().generation != generation {
                return;
            }

            let ok = work().await;

            let mut events = Vec::new();
            let done = {
                let mut g = self.inner.lock();
                if g.generation != generation {
                    return;
                }
                if ok {
                    events.push(ResilienceEvent::ReconnectSuccess { attempt });
                    g.clear_counters();
                    g.retry_task = None;
                    g.transition(ResilienceState::Idle, &mut events);
                    true
                } else {
                    events.push(ResilienceEvent::ReconnectFailure { attempt });
                    g.consecutive_failures += 1;
                    g.last_failure_reason = Some("reconnect_failed".to_string());
                    warn!(
                        attempt,
                        consecutive_failures = g.consecutive_failures,
                        "reconnect_failed"
                    );
                    if g.consecutive_failures >= self.config.failure_threshold {
                        g.retry_task = None;
                        self.suspend(&mut g, &mut events);
                        true
                    } else if g.attempt >= self.config.max_attempts {
                        g.retry_task = None;
                        g.transition(ResilienceState::GivenUp, &mut events);
                        true
                    } else {
                        false
                    }
                }
            };
            self.emit_all(events);
            if done {
                return;
            }
        }
    }

    /// Trip the breaker. Caller holds the lock.
    fn suspend(self: &Arc<Self>, g: &mut Inner, events: &mut Vec<ResilienceEvent>) {
        g.generation += 1;
        g.backoff.reset();
        g.transition(ResilienceState::Suspended, events);

        let generation = g.generation;
        let cooldown = self.config.cooldown();
        let this = self.clone();
        if let Some(old) = g.cooldown_task.take() {
            old.abort();
        }
        g.cooldown_task = Some(tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let mut events = Vec::new();
            {
                let mut g = this.inner.lock();
                if g.generation != generation || g.state != ResilienceState::Suspended {
                    return;
                }
                // The attempt budget survives a cooldown; only the streak clears
                g.consecutive_failures = 0;
                g.backoff.reset();
                g.cooldown_task = None;
                g.transition(ResilienceState::Idle, &mut events);
            }
            info!(cooldown_ms = cooldown.as_millis() as u64, "resilience_cooldown_elapsed");
            this.emit_all(events);
        }));
    }

    /// Record a failure observed outside the attempt loop (initial connect,
    /// lost connection). May trip the breaker.
    pub fn record_failure(self: &Arc<Self>, reason: &str) {
        let mut events = Vec::new();
        {
            let mut g = self.inner.lock();
            g.consecutive_failures += 1;
            g.last_failure_reason = Some(reason.to_string());
            debug!(
                reason,
                consecutive_failures = g.consecutive_failures,
                "failure_recorded"
            );
            let tripping = g.consecutive_failures >= self.config.failure_threshold
                && matches!(g.state, ResilienceState::Idle | ResilienceState::Attempting);
            if tripping {
                if let Some(task) = g.retry_task.take() {
                    task.abort();
                }
                self.suspend(&mut g, &mut events);
            }
        }
        self.emit_all(events);
    }

    /// Record a success observed outside the attempt loop
    pub fn record_success(&self) {
        let mut g = self.inner.lock();
        g.clear_counters();
    }

    /// Abort every pending attempt and timer and return to `Idle`
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut g = self.inner.lock();
            g.generation += 1;
            g.abort_tasks();
            g.clear_counters();
            g.transition(ResilienceState::Idle, &mut events);
        }
        self.emit_all(events);
    }

    /// Reset and drop every subscriber
    pub fn shutdown(&self) {
        self.listeners.clear();
        self.reset();
    }

    fn emit_all(&self, events: Vec<ResilienceEvent>) {
        for event in &events {
            self.listeners.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller(threshold: u32, max_attempts: u32, cooldown_ms: u64) -> Arc<ResilienceController> {
        let backoff = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        ResilienceController::with_backoff(
            ResilienceConfig {
                failure_threshold: threshold,
                cooldown_ms,
                max_attempts,
            },
            BackoffPolicy::with_seed(&backoff, 5),
        )
    }

    fn record(controller: &ResilienceController) -> Arc<Mutex<Vec<ResilienceEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        controller.listeners().add(move |e| sink.lock().push(e.clone()));
        seen
    }

    fn counting_work(
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync + 'static
    {
        move || {
            let calls = calls.clone();
            Box::pin(async move { calls.fetch_add(1, Ordering::SeqCst) + 1 >= succeed_on })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_to_idle() {
        let rc = controller(3, 10, 60_000);
        let seen = record(&rc);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(rc.attempt_reconnection(counting_work(calls.clone(), 2)));
        assert_eq!(rc.state(), ResilienceState::Attempting);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snap = rc.get_state();
        assert_eq!(snap.state, ResilienceState::Idle);
        assert_eq!(snap.attempt, 0);
        assert_eq!(snap.consecutive_failures, 0);

        let events = seen.lock().clone();
        assert!(events.contains(&ResilienceEvent::ReconnectFailure { attempt: 1 }));
        assert!(events.contains(&ResilienceEvent::ReconnectSuccess { attempt: 2 }));
        assert_eq!(
            events.last(),
            Some(&ResilienceEvent::StateChanged {
                from: ResilienceState::Attempting,
                to: ResilienceState::Idle
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_then_cooldown_resets() {
        let rc = controller(3, 10, 60_000);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(rc.attempt_reconnection(counting_work(calls.clone(), u32::MAX)));
        tokio::time::sleep(Duration::from_secs(10)).await;

        // Exactly `threshold` attempts before the breaker opens
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snap = rc.get_state();
        assert_eq!(snap.state, ResilienceState::Suspended);
        assert_eq!(snap.consecutive_failures, 3);
        assert_eq!(snap.last_failure_reason.as_deref(), Some("reconnect_failed"));

        // Suspended refuses admission
        assert!(!rc.attempt_reconnection(counting_work(calls.clone(), 1)));

        tokio::time::sleep(Duration::from_secs(61)).await;
        let snap = rc.get_state();
        assert_eq!(snap.state, ResilienceState::Idle);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let rc = controller(100, 3, 60_000);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(rc.attempt_reconnection(counting_work(calls.clone(), u32::MAX)));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rc.state(), ResilienceState::GivenUp);
        assert!(!rc.attempt_reconnection(counting_work(calls.clone(), 1)));

        rc.reset();
        assert_eq!(rc.state(), ResilienceState::Idle);
        assert!(rc.attempt_reconnection(counting_work(calls.clone(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_loop_at_a_time() {
        let rc = controller(3, 10, 60_000);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(rc.attempt_reconnection(counting_work(calls.clone(), 1)));
        assert!(!rc.attempt_reconnection(counting_work(calls.clone(), 1)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_aborts_pending_attempt() {
        let rc = controller(3, 10, 60_000);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(rc.attempt_reconnection(counting_work(calls.clone(), 1)));
        rc.reset();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rc.state(), ResilienceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_failure_trips_and_success_clears() {
        let rc = controller(2, 10, 1_000);
        let seen = record(&rc);

        rc.record_failure("connect_failed");
        assert_eq!(rc.get_state().consecutive_failures, 1);
        rc.record_success();
        assert_eq!(rc.get_state().consecutive_failures, 0);

        rc.record_failure("connect_failed");
        rc.record_failure("heartbeat_timeout");
        assert_eq!(rc.state(), ResilienceState::Suspended);
        assert_eq!(
            rc.get_state().last_failure_reason.as_deref(),
            Some("heartbeat_timeout")
        );

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(rc.state(), ResilienceState::Idle);
        assert!(seen.lock().contains(&ResilienceEvent::StateChanged {
            from: ResilienceState::Suspended,
            to: ResilienceState::Idle
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_listeners() {
        let rc = controller(2, 10, 1_000);
        let seen = record(&rc);
        rc.shutdown();
        rc.record_failure("x");
        rc.record_failure("x");
        assert!(seen.lock().is_empty());
        assert!(rc.listeners().is_empty());
    }
}
