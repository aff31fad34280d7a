//! Durable local document store on SQLite.
//!
//! The [`SqliteStore`] owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Records are kept as JSON
//! field maps in a single table keyed by `(collection, id)`; filtering and
//! ordering happen in [`Query::apply`](crate::Query::apply), exactly as for
//! the in-memory backend.
//!
//! Live queries only observe writes made through this handle. Call
//! [`SqliteStore::refresh`] periodically to pick up writes made by other
//! processes sharing the same file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::live::WatchHub;
use crate::migrations;
use crate::store::CommitClock;

pub(crate) struct Inner {
    pub(crate) conn: Connection,
    pub(crate) clock: CommitClock,
}

/// Document store persisted in a SQLite file.
pub struct SqliteStore {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) hub: Arc<WatchHub>,
}

impl SqliteStore {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/tutorlink/tutorlink.db`
    /// - macOS:   `~/Library/Application Support/com.tutorlink.tutorlink/tutorlink.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\tutorlink\tutorlink\data\tutorlink.db`
    pub fn new() -> Result<Self> {
        let db_path = default_path()?;
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::with_connection(conn)
    }

    /// Open a throwaway database that lives as long as the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn)?;

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                clock: CommitClock::default(),
            }),
            hub: WatchHub::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().conn.path().map(PathBuf::from)
    }

    /// Number of registered live queries.
    pub fn active_watches(&self) -> usize {
        self.hub.active()
    }
}

/// Location of the default database file.
pub fn default_path() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("com", "tutorlink", "tutorlink").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().join("tutorlink.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = SqliteStore::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        drop(db);

        // Reopening runs migrations again without error.
        SqliteStore::open_at(&path).expect("should reopen");
    }
}
