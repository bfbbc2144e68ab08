use super::DatabaseError;
use log::debug;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A single SQLite connection shared by the dedup core.
///
/// Repositories borrow the locked connection, so one transaction can span
/// several of them. The guard must not be held across an `.await`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn, true)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, false)
    }

    fn with_connection(conn: Connection, wal: bool) -> Result<Self, DatabaseError> {
        if wal {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS contents (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                content_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Hashes are removed explicitly with their content, not by FK.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS content_hashes (
                id TEXT PRIMARY KEY,
                content_id TEXT NOT NULL,
                hash_type TEXT NOT NULL,
                value TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_content_hashes_type_value
             ON content_hashes(hash_type, value)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_content_hashes_content
             ON content_hashes(content_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS scan_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash_id TEXT NOT NULL UNIQUE
                    REFERENCES content_hashes(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS duplicate_groups (
                id TEXT PRIMARY KEY,
                hash_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS duplicate_group_items (
                group_id TEXT NOT NULL
                    REFERENCES duplicate_groups(id) ON DELETE CASCADE,
                content_id TEXT NOT NULL,
                hash_type TEXT NOT NULL,
                similarity REAL NOT NULL,
                PRIMARY KEY (group_id, content_id),
                UNIQUE (hash_type, content_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS app_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        debug!("SQLite schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = tempdir().unwrap();
        let db = Database::open(temp_dir.path().join("test.db")).unwrap();
        let conn = db.lock().unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('contents', 'content_hashes', 'scan_queue', 'duplicate_groups',
                  'duplicate_group_items', 'app_config')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("test.db");
        drop(Database::open(&path).unwrap());
        assert!(Database::open(&path).is_ok());
    }
}
