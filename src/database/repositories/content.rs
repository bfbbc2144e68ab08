use super::now;
use crate::database::models::{Content, ContentType};
use crate::database::DatabaseError;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Read/write access to registered content rows.
pub struct ContentRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ContentRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn save(&self, content: &Content) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO contents (id, path, name, content_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 path = excluded.path,
                 name = excluded.name,
                 content_type = excluded.content_type",
            params![
                content.id,
                content.path,
                content.name,
                content.content_type.as_str(),
                now()
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Content>, DatabaseError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, path, name, content_type FROM contents WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?;

        row.map(into_content).transpose()
    }

    /// The content registered at `path/name`, if any.
    pub fn find_by_location(
        &self,
        path: &str,
        name: &str,
    ) -> Result<Option<Content>, DatabaseError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, path, name, content_type FROM contents WHERE path = ?1 AND name = ?2",
                params![path, name],
                read_row,
            )
            .optional()?;

        row.map(into_content).transpose()
    }

    pub fn find_all(&self) -> Result<Vec<Content>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, name, content_type FROM contents ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(into_content).collect()
    }

    pub fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .execute("DELETE FROM contents WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

type ContentRow = (String, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<ContentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_content((id, path, name, content_type): ContentRow) -> Result<Content, DatabaseError> {
    let content_type = ContentType::try_from(content_type.as_str()).map_err(|message| {
        DatabaseError::InvalidValue {
            column: "contents.content_type",
            message,
        }
    })?;

    Ok(Content {
        id,
        path,
        name,
        content_type,
    })
}
