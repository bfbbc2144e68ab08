use super::now;
use crate::database::models::{HashType, ScanQueueEntry, ScanQueueItem};
use crate::database::DatabaseError;
use rusqlite::{params, Connection};

/// Durable FIFO set of hashes still waiting to be compared against the
/// corpus. An entry is only considered compared once it has been removed.
pub struct ScanQueueRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ScanQueueRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Queue a hash for comparison. Adding a hash that is already pending is
    /// a no-op; returns whether a new entry was created.
    pub fn add(&self, content_hash_id: &str) -> Result<bool, DatabaseError> {
        let inserted = self.conn.execute(
            "INSERT INTO scan_queue (content_hash_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(content_hash_id) DO NOTHING",
            params![content_hash_id, now()],
        )?;
        Ok(inserted > 0)
    }

    pub fn count(&self) -> Result<usize, DatabaseError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scan_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn find_all(&self) -> Result<Vec<ScanQueueItem>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, content_hash_id, created_at FROM scan_queue ORDER BY id")?;
        let items = stmt
            .query_map([], |row| {
                Ok(ScanQueueItem {
                    id: row.get(0)?,
                    content_hash_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Pending entries joined to their hash value and owning content, oldest first.
    pub fn find_with_hash(&self) -> Result<Vec<ScanQueueEntry>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT q.id, q.content_hash_id, h.content_id, h.hash_type, h.value
             FROM scan_queue q
             INNER JOIN content_hashes h ON h.id = q.content_hash_id
             ORDER BY q.id",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(ScanQueueEntry {
                    id: row.get(0)?,
                    content_hash_id: row.get(1)?,
                    content_id: row.get(2)?,
                    hash_type: HashType::from(row.get::<_, String>(3)?),
                    value: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn remove(&self, id: i64) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .execute("DELETE FROM scan_queue WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn remove_by_content_hash_id(&self, content_hash_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self.conn.execute(
            "DELETE FROM scan_queue WHERE content_hash_id = ?1",
            params![content_hash_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn clear(&self) -> Result<usize, DatabaseError> {
        let deleted = self.conn.execute("DELETE FROM scan_queue", [])?;
        Ok(deleted)
    }

    /// Queue every known hash again, e.g. after the match threshold changed.
    /// Returns the number of entries added.
    pub fn requeue_all(&self) -> Result<usize, DatabaseError> {
        let added = self.conn.execute(
            "INSERT INTO scan_queue (content_hash_id, created_at)
             SELECT id, ?1 FROM content_hashes WHERE true ORDER BY created_at, id
             ON CONFLICT(content_hash_id) DO NOTHING",
            params![now()],
        )?;
        Ok(added)
    }
}
