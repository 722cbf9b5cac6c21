//! Engine Configuration
//!
//! Production-tuned defaults, overridable from a TOML file and from
//! `SIMLINK_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub backoff: BackoffConfig,
    pub resilience: ResilienceConfig,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionSyncConfig,
    pub simulator: SimulatorApiConfig,
}

/// Real-time channel endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Outbound queue depth per connection
    pub send_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws/session".to_string(),
            connect_timeout_ms: 10_000,
            send_queue: 256,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnection delay growth
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            // 1s base, doubling, 30s cap, x[0.5, 1.5) jitter
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Circuit breaker around reconnection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures before suspending attempts
    pub failure_threshold: u32,
    /// How long attempts stay suspended
    pub cooldown_ms: u64,
    /// Attempts before giving up until an external reset
    pub max_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl ResilienceConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Liveness probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive unanswered probes that force a disconnect
    pub max_misses: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 5_000,
            max_misses: 1,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session request/response negotiation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSyncConfig {
    pub request_timeout_ms: u64,
}

impl Default for SessionSyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
        }
    }
}

impl SessionSyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Simulator control endpoint (HTTP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for SimulatorApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl SimulatorApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing sections and fields keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid engine config")
    }

    /// Load a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Load defaults, then apply environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `SIMLINK_*` overrides; unparseable values keep the current setting
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SIMLINK_WS_URL") {
            if !v.trim().is_empty() {
                self.transport.url = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("SIMLINK_API_URL") {
            if !v.trim().is_empty() {
                self.simulator.base_url = v.trim().to_string();
            }
        }
        override_u64("SIMLINK_CONNECT_TIMEOUT_MS", &mut self.transport.connect_timeout_ms);
        override_u64("SIMLINK_BACKOFF_BASE_MS", &mut self.backoff.base_delay_ms);
        override_u64("SIMLINK_BACKOFF_MAX_MS", &mut self.backoff.max_delay_ms);
        override_u32("SIMLINK_FAILURE_THRESHOLD", &mut self.resilience.failure_threshold);
        override_u64("SIMLINK_COOLDOWN_MS", &mut self.resilience.cooldown_ms);
        override_u32("SIMLINK_MAX_ATTEMPTS", &mut self.resilience.max_attempts);
        override_u64("SIMLINK_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat.interval_ms);
        override_u64("SIMLINK_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat.timeout_ms);
        override_u32("SIMLINK_HEARTBEAT_MAX_MISSES", &mut self.heartbeat.max_misses);
        override_u64("SIMLINK_REQUEST_TIMEOUT_MS", &mut self.session.request_timeout_ms);
        override_u64("SIMLINK_API_TIMEOUT_MS", &mut self.simulator.timeout_ms);
    }
}

fn override_u64(var: &str, slot: &mut u64) {
    if let Some(v) = std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        *slot = v;
    }
}

fn override_u32(var: &str, slot: &mut u32) {
    if let Some(v) = std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&v| v > 0)
    {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(15));
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(5));
        assert_eq!(config.heartbeat.max_misses, 1);
        assert_eq!(config.session.request_timeout(), Duration::from_secs(15));
        assert!(config.backoff.max_delay() > config.backoff.base_delay());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [transport]
            url = "wss://sim.example.com/ws"

            [resilience]
            failure_threshold = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.url, "wss://sim.example.com/ws");
        assert_eq!(config.transport.connect_timeout_ms, 10_000);
        assert_eq!(config.resilience.failure_threshold, 3);
        assert_eq!(config.resilience.max_attempts, 10);
        assert_eq!(config.heartbeat.interval_ms, 15_000);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(EngineConfig::from_toml_str("[heartbeat]\ninterval_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SIMLINK_HEARTBEAT_MAX_MISSES", "3");
        std::env::set_var("SIMLINK_COOLDOWN_MS", "not-a-number");
        let config = EngineConfig::from_env();
        std::env::remove_var("SIMLINK_HEARTBEAT_MAX_MISSES");
        std::env::remove_var("SIMLINK_COOLDOWN_MS");

        assert_eq!(config.heartbeat.max_misses, 3);
        assert_eq!(config.resilience.cooldown_ms, 60_000);
    }
}
