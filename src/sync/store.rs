//! Persisted client state
//!
//! One row per storage key holds the session id, the last acknowledged
//! snapshot and the pending change log, so a restart can rebuild the exact
//! local snapshot by replay.

use anyhow::Context;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::session::{Change, Snapshot};
use crate::config::StorageConfig;
use crate::error::{ChatlinkError, Result};

/// Session state as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSession {
    /// Session identifier
    pub session_id: String,
    /// Last acknowledged snapshot
    pub base: Snapshot,
    /// Unacknowledged changes, oldest first
    pub pending: Vec<Change>,
    /// When the row was written
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed store keyed by a fixed storage name
#[derive(Debug, Clone)]
pub struct SessionStore {
    db_path: PathBuf,
    key: String,
}

fn storage_err(e: impl std::fmt::Display) -> ChatlinkError {
    ChatlinkError::Storage(format!("{e:#}"))
}

impl SessionStore {
    /// Open the store described by `config`.
    ///
    /// Without an explicit path the database lives in the platform data
    /// directory.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db_path = match &config.path {
            Some(path) => path.clone(),
            None => {
                let dirs = ProjectDirs::from("dev", "chatlink", "chatlink")
                    .ok_or_else(|| storage_err("Could not determine data directory"))?;
                dirs.data_dir().join("state.db")
            }
        };
        Self::new_with_path(db_path, &config.key)
    }

    /// Open a store at `db_path`, creating parent directories as needed.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatlink::sync::store::SessionStore;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = SessionStore::new_with_path(dir.path().join("state.db"), "demo").unwrap();
    /// assert!(store.load().unwrap().is_none());
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P, key: &str) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(storage_err)?;
        }

        let store = Self {
            db_path,
            key: key.to_string(),
        };
        store.init()?;
        Ok(store)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)
            .context("Failed to open database")
            .map_err(storage_err)?)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS client_state (
                key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                base JSON NOT NULL,
                pending JSON NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create tables")
        .map_err(storage_err)?;
        Ok(())
    }

    /// Write the session, replacing any previous row for this key.
    pub fn save(&self, session_id: &str, base: &Snapshot, pending: &[Change]) -> Result<()> {
        let conn = self.connect()?;
        let base_json = serde_json::to_string(base)
            .context("Failed to serialize snapshot")
            .map_err(storage_err)?;
        let pending_json = serde_json::to_string(pending)
            .context("Failed to serialize pending changes")
            .map_err(storage_err)?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO client_state (key, session_id, base, pending, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                session_id = excluded.session_id,
                base = excluded.base,
                pending = excluded.pending,
                updated_at = excluded.updated_at",
            params![self.key, session_id, base_json, pending_json, now],
        )
        .context("Failed to save session")
        .map_err(storage_err)?;

        tracing::trace!(session_id, pending = pending.len(), "Session persisted");
        Ok(())
    }

    /// Read the stored session, if any.
    pub fn load(&self) -> Result<Option<PersistedSession>> {
        let conn = self.connect()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT session_id, base, pending, updated_at FROM client_state WHERE key = ?",
                params![self.key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("Failed to query session")
            .map_err(storage_err)?;

        let Some((session_id, base_json, pending_json, updated_at)) = row else {
            return Ok(None);
        };

        let base: Snapshot = serde_json::from_str(&base_json)
            .context("Failed to deserialize snapshot")
            .map_err(storage_err)?;
        let pending: Vec<Change> = serde_json::from_str(&pending_json)
            .context("Failed to deserialize pending changes")
            .map_err(storage_err)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(PersistedSession {
            session_id,
            base,
            pending,
            updated_at,
        }))
    }

    /// Forget the stored session.
    pub fn clear(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM client_state WHERE key = ?",
            params![self.key],
        )
        .context("Failed to clear session")
        .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::session::Mutation;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new_with_path(dir.path().join("state.db"), "k").unwrap();
        assert!(store.load().unwrap().is_none());

        let base = json!({ "view": "intro" }).as_object().cloned().unwrap();
        let pending = vec![Change::now(Mutation::set("view", json!("survey")))];
        store.save("s1", &base, &pending).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.base, base);
        assert_eq!(loaded.pending, pending);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_same_key() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new_with_path(dir.path().join("state.db"), "k").unwrap();
        store.save("s1", &Snapshot::new(), &[]).unwrap();
        store.save("s2", &Snapshot::new(), &[]).unwrap();
        assert_eq!(store.load().unwrap().unwrap().session_id, "s2");
    }

    #[test]
    fn test_keys_are_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = SessionStore::new_with_path(&path, "a").unwrap();
        let b = SessionStore::new_with_path(&path, "b").unwrap();
        a.save("sa", &Snapshot::new(), &[]).unwrap();
        assert!(b.load().unwrap().is_none());
        b.clear().unwrap();
        assert_eq!(a.load().unwrap().unwrap().session_id, "sa");
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.db");
        let store = SessionStore::new_with_path(&path, "k").unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());
    }
}
