//! User-facing notifications
//!
//! The engine posts short messages (suspension, give-up, identity loss)
//! through a `Notifier`. Messages sharing a dedupe id are collapsed while the
//! previous one is still on screen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

pub trait Notifier: Send + Sync {
    /// `duration: None` keeps the message up until dismissed
    fn notify(
        &self,
        level: NotifyLevel,
        message: &str,
        duration: Option<Duration>,
        dedupe_id: Option<&str>,
    );

    fn info(&self, message: &str) {
        self.notify(NotifyLevel::Info, message, Some(Duration::from_secs(3)), None);
    }

    fn warn(&self, message: &str, dedupe_id: Option<&str>) {
        self.notify(NotifyLevel::Warning, message, Some(Duration::from_secs(5)), dedupe_id);
    }

    /// Blocking error; stays up until dismissed
    fn error(&self, message: &str, dedupe_id: Option<&str>) {
        self.notify(NotifyLevel::Error, message, None, dedupe_id);
    }
}

/// Notifier that writes to the log
pub struct TracingNotifier {
    /// Dedupe window for messages that stay up until dismissed
    sticky_window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
    delivered: AtomicU64,
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TracingNotifier {
    pub fn new(sticky_window: Duration) -> Self {
        Self {
            sticky_window,
            recent: Mutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
        }
    }

    /// Messages actually written (after dedupe)
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn admit(&self, dedupe_id: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.retain(|_, until| *until > now);
        if recent.contains_key(dedupe_id) {
            return false;
        }
        recent.insert(dedupe_id.to_string(), now + window);
        true
    }
}

impl Notifier for TracingNotifier {
    fn notify(
        &self,
        level: NotifyLevel,
        message: &str,
        duration: Option<Duration>,
        dedupe_id: Option<&str>,
    ) {
        if let Some(id) = dedupe_id {
            if !self.admit(id, duration.unwrap_or(self.sticky_window)) {
                return;
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);

        let sticky = duration.is_none();
        match level {
            NotifyLevel::Info => info!(sticky, dedupe_id, "notice: {}", message),
            NotifyLevel::Warning => warn!(sticky, dedupe_id, "notice: {}", message),
            NotifyLevel::Error => error!(sticky, dedupe_id, "notice: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_inside_window() {
        let notifier = TracingNotifier::new(Duration::from_secs(30));

        notifier.warn("Reconnection paused", Some("suspended"));
        notifier.warn("Reconnection paused", Some("suspended"));
        assert_eq!(notifier.delivered(), 1);

        // Different ids and un-keyed messages always go through
        notifier.error("Device signed in elsewhere", Some("device"));
        notifier.info("Connected");
        notifier.info("Connected");
        assert_eq!(notifier.delivered(), 4);

        tokio::time::advance(Duration::from_secs(6)).await;
        notifier.warn("Reconnection paused", Some("suspended"));
        assert_eq!(notifier.delivered(), 5);

        // Sticky messages use the longer window
        notifier.error("Device signed in elsewhere", Some("device"));
        assert_eq!(notifier.delivered(), 5);
    }
}
