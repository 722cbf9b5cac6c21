//! Reconnection resilience: backoff delays and the circuit breaker that
//! wraps reconnection attempts.

pub mod backoff;
pub mod controller;

pub use backoff::BackoffPolicy;
pub use controller::{ResilienceController, ResilienceEvent, ResilienceSnapshot, ResilienceState};
