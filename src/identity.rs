//! Device identity
//!
//! A device id is generated lazily (UUID v4) the first time it is needed and
//! kept until the server invalidates it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

pub trait DeviceIdentity: Send + Sync {
    /// Current device id, generated if none exists
    fn device_id(&self) -> String;

    /// Forget the current id; the next `device_id()` call generates a new one
    fn clear_device_id(&self);
}

fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

/// Process-lifetime identity
#[derive(Debug, Default)]
pub struct MemoryDeviceIdentity {
    id: RwLock<Option<String>>,
}

impl MemoryDeviceIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: RwLock::new(Some(id.into())),
        }
    }

    /// Current id without generating one
    pub fn peek(&self) -> Option<String> {
        self.id.read().clone()
    }
}

impl DeviceIdentity for MemoryDeviceIdentity {
    fn device_id(&self) -> String {
        if let Some(id) = self.id.read().as_ref() {
            return id.clone();
        }
        self.id.write().get_or_insert_with(generate_device_id).clone()
    }

    fn clear_device_id(&self) {
        self.id.write().take();
    }
}

/// Identity persisted to a file so it survives restarts
pub struct FileDeviceIdentity {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl FileDeviceIdentity {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: RwLock::new(None),
        }
    }

    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read device id {}", self.path.display()))?;
        let id = raw.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    fn persist(&self, id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, id)
            .with_context(|| format!("Failed to write device id {}", self.path.display()))
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn device_id(&self) -> String {
        if let Some(id) = self.cached.read().as_ref() {
            return id.clone();
        }

        let mut cached = self.cached.write();
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }

        let id = match self.load() {
            Ok(Some(id)) => id,
            Ok(None) => {
                let id = generate_device_id();
                info!(device_id = %id, path = %self.path.display(), "device_id_generated");
                if let Err(e) = self.persist(&id) {
                    // Still usable for this process
                    warn!(error = %e, "device_id_persist_failed");
                }
                id
            }
            Err(e) => {
                warn!(error = %e, "device_id_load_failed");
                generate_device_id()
            }
        };
        *cached = Some(id.clone());
        id
    }

    fn clear_device_id(&self) {
        self.cached.write().take();
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(error = %e, path = %self.path.display(), "device_id_remove_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_identity_is_stable_until_cleared() {
        let identity = MemoryDeviceIdentity::new();
        assert_eq!(identity.peek(), None);

        let first = identity.device_id();
        assert_eq!(identity.device_id(), first);
        assert!(Uuid::parse_str(&first).is_ok());

        identity.clear_device_id();
        assert_eq!(identity.peek(), None);
        assert_ne!(identity.device_id(), first);
    }

    #[test]
    fn test_file_identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("device_id");

        let first = FileDeviceIdentity::new(&path).device_id();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        // A fresh instance reads the same id back
        let reloaded = FileDeviceIdentity::new(&path);
        assert_eq!(reloaded.device_id(), first);

        reloaded.clear_device_id();
        assert!(!path.exists());
        assert_ne!(reloaded.device_id(), first);
    }
}
