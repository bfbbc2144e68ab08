use super::now;
use crate::database::models::{ContentHash, HashMetadata, HashType};
use crate::database::DatabaseError;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SELECT_COLUMNS: &str =
    "SELECT id, content_id, hash_type, value, metadata FROM content_hashes";

pub struct ContentHashRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ContentHashRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn save(&self, hash: &ContentHash) -> Result<(), DatabaseError> {
        let metadata = hash
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO content_hashes (id, content_id, hash_type, value, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                hash.id,
                hash.content_id,
                hash.hash_type.as_str(),
                hash.value,
                metadata,
                now()
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<ContentHash>, DatabaseError> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                read_row,
            )
            .optional()?;

        row.map(into_hash).transpose()
    }

    pub fn find_by_type_and_value(
        &self,
        hash_type: &HashType,
        value: &str,
    ) -> Result<Vec<ContentHash>, DatabaseError> {
        self.query(
            &format!(
                "{} WHERE hash_type = ?1 AND value = ?2 ORDER BY created_at, id",
                SELECT_COLUMNS
            ),
            params![hash_type.as_str(), value],
        )
    }

    pub fn find_by_type(&self, hash_type: &HashType) -> Result<Vec<ContentHash>, DatabaseError> {
        self.query(
            &format!("{} WHERE hash_type = ?1 ORDER BY created_at, id", SELECT_COLUMNS),
            params![hash_type.as_str()],
        )
    }

    pub fn find_by_content_id(&self, content_id: &str) -> Result<Vec<ContentHash>, DatabaseError> {
        self.query(
            &format!("{} WHERE content_id = ?1 ORDER BY created_at, id", SELECT_COLUMNS),
            params![content_id],
        )
    }

    /// Delete every hash of a content. Pending queue entries go with them.
    pub fn delete_by_content_id(&self, content_id: &str) -> Result<usize, DatabaseError> {
        let deleted = self.conn.execute(
            "DELETE FROM content_hashes WHERE content_id = ?1",
            params![content_id],
        )?;
        Ok(deleted)
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ContentHash>, DatabaseError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_hash).collect()
    }
}

type HashRow = (String, String, String, String, Option<String>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<HashRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn into_hash(
    (id, content_id, hash_type, value, metadata): HashRow,
) -> Result<ContentHash, DatabaseError> {
    let metadata = metadata
        .map(|json| serde_json::from_str::<HashMetadata>(&json))
        .transpose()?;

    Ok(ContentHash {
        id,
        content_id,
        hash_type: HashType::from(hash_type),
        value,
        metadata,
    })
}
