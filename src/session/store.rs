//! Session Storage
//! Mission: Remember the last negotiated session across restarts

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What survives a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub simulator_id: Option<String>,
    pub last_active: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredSession>>;
    fn save(&self, session: &StoredSession) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<StoredSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<StoredSession>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, session: &StoredSession) -> Result<()> {
        *self.slot.lock() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.slot.lock().take();
        Ok(())
    }
}

const KEY_TOKEN: &str = "token";
const KEY_SESSION_ID: &str = "session_id";
const KEY_SIMULATOR_ID: &str = "simulator_id";
const KEY_LAST_ACTIVE: &str = "last_active";

/// SQLite-backed store: one key/value row per field
pub struct SqliteSessionStore {
    db_path: String,
}

impl SqliteSessionStore {
    /// Open (and create if needed) the store at `db_path`
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_string(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn init_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open session db {}", self.db_path))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create session_kv table")?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self) -> Result<Option<StoredSession>> {
        let conn = Connection::open(&self.db_path)?;
        let mut stmt = conn.prepare("SELECT key, value FROM session_kv")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<HashMap<String, String>>>()
            .context("Failed to read session_kv")?;

        let Some(last_active) = rows.get(KEY_LAST_ACTIVE) else {
            return Ok(None);
        };
        let last_active = DateTime::parse_from_rfc3339(last_active)
            .context("Corrupt last_active timestamp")?
            .with_timezone(&Utc);

        Ok(Some(StoredSession {
            token: rows.get(KEY_TOKEN).cloned(),
            session_id: rows.get(KEY_SESSION_ID).cloned(),
            simulator_id: rows.get(KEY_SIMULATOR_ID).cloned(),
            last_active,
        }))
    }

    fn save(&self, session: &StoredSession) -> Result<()> {
        let mut conn = Connection::open(&self.db_path)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM session_kv", [])?;

        let fields = [
            (KEY_TOKEN, session.token.clone()),
            (KEY_SESSION_ID, session.session_id.clone()),
            (KEY_SIMULATOR_ID, session.simulator_id.clone()),
            (KEY_LAST_ACTIVE, Some(session.last_active.to_rfc3339())),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                tx.execute(
                    "INSERT INTO session_kv (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .with_context(|| format!("Failed to store {key}"))?;
            }
        }
        tx.commit().context("Failed to commit session")?;
        debug!(session_id = ?session.session_id, "session_persisted");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute("DELETE FROM session_kv", [])
            .context("Failed to clear session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (SqliteSessionStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let store = SqliteSessionStore::new(db_path).unwrap();
        (store, temp_file)
    }

    fn sample() -> StoredSession {
        StoredSession {
            token: Some("tok".to_string()),
            session_id: Some("s-1".to_string()),
            simulator_id: None,
            last_active: DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_empty_store_loads_none() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_load_clear() {
        let (store, temp) = create_test_store();
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));

        // Visible through a second handle on the same file
        let reopened = SqliteSessionStore::new(temp.path().to_str().unwrap()).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(sample()));

        // Overwrite drops fields that became None
        let mut updated = sample();
        updated.session_id = None;
        updated.simulator_id = Some("sim-9".to_string());
        store.save(&updated).unwrap();
        assert_eq!(store.load().unwrap(), Some(updated));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::new();
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
