use super::now;
use crate::core::ids::IdGenerator;
use crate::database::models::{DuplicateGroup, DuplicateGroupItem, HashType};
use crate::database::DatabaseError;
use rusqlite::{params, Connection, OptionalExtension};

pub struct DuplicateGroupRepository<'c> {
    conn: &'c Connection,
    ids: &'c dyn IdGenerator,
}

impl<'c> DuplicateGroupRepository<'c> {
    pub fn new(conn: &'c Connection, ids: &'c dyn IdGenerator) -> Self {
        Self { conn, ids }
    }

    pub fn generate_id(&self) -> String {
        self.ids.generate("grp")
    }

    /// Insert the group if it is new and add any items it does not hold yet.
    /// Items already present (in this or another group of the same hash
    /// type) are left untouched.
    pub fn save(&self, group: &DuplicateGroup) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO duplicate_groups (id, hash_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![
                group.id,
                group.hash_type.as_str(),
                group.created_at,
                group.updated_at
            ],
        )?;

        for item in &group.items {
            self.insert_item(&group.id, &group.hash_type, item)?;
        }
        Ok(())
    }

    /// Add one content to an existing group. Returns whether it was added.
    pub fn add_item(
        &self,
        group_id: &str,
        hash_type: &HashType,
        item: &DuplicateGroupItem,
    ) -> Result<bool, DatabaseError> {
        let added = self.insert_item(group_id, hash_type, item)?;
        if added {
            self.touch(group_id)?;
        }
        Ok(added)
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<DuplicateGroup>, DatabaseError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, hash_type, created_at, updated_at FROM duplicate_groups WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, hash_type, created_at, updated_at)) => {
                let items = self.load_items(&id)?;
                Ok(Some(DuplicateGroup {
                    id,
                    hash_type: HashType::from(hash_type),
                    items,
                    created_at,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// The group a content belongs to under one hashing scheme, if any.
    pub fn find_by_content_id_and_hash_type(
        &self,
        content_id: &str,
        hash_type: &HashType,
    ) -> Result<Option<DuplicateGroup>, DatabaseError> {
        let group_id: Option<String> = self
            .conn
            .query_row(
                "SELECT group_id FROM duplicate_group_items
                 WHERE content_id = ?1 AND hash_type = ?2",
                params![content_id, hash_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match group_id {
            Some(id) => self.find_by_id(&id),
            None => Ok(None),
        }
    }

    /// Ids of every group a content belongs to, under any hash type.
    pub fn find_ids_by_content_id(&self, content_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id FROM duplicate_group_items WHERE content_id = ?1 ORDER BY rowid",
        )?;
        let ids = stmt
            .query_map(params![content_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn find_all(
        &self,
        hash_type: Option<&HashType>,
    ) -> Result<Vec<DuplicateGroup>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM duplicate_groups
             WHERE ?1 IS NULL OR hash_type = ?1
             ORDER BY created_at, id",
        )?;
        let ids = stmt
            .query_map(params![hash_type.map(|t| t.as_str())], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.find_by_id(&id)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Returns whether the item exists.
    pub fn update_similarity(
        &self,
        group_id: &str,
        content_id: &str,
        similarity: f64,
    ) -> Result<bool, DatabaseError> {
        let updated = self.conn.execute(
            "UPDATE duplicate_group_items SET similarity = ?1
             WHERE group_id = ?2 AND content_id = ?3",
            params![similarity, group_id, content_id],
        )?;
        Ok(updated > 0)
    }

    /// Move every item of `source_id` into `target_id` and delete the source
    /// group. Returns the number of items moved.
    pub fn merge_into(&self, target_id: &str, source_id: &str) -> Result<usize, DatabaseError> {
        let moved = self.conn.execute(
            "UPDATE OR IGNORE duplicate_group_items SET group_id = ?1 WHERE group_id = ?2",
            params![target_id, source_id],
        )?;

        self.delete(source_id)?;
        self.touch(target_id)?;
        Ok(moved)
    }

    /// Drop a content from every group it belongs to. Groups left with fewer
    /// than two items no longer describe a duplicate and are deleted.
    /// Returns the number of groups deleted.
    pub fn remove_content(&self, content_id: &str) -> Result<usize, DatabaseError> {
        self.conn.execute(
            "DELETE FROM duplicate_group_items WHERE content_id = ?1",
            params![content_id],
        )?;

        let deleted = self.conn.execute(
            "DELETE FROM duplicate_groups
             WHERE (SELECT COUNT(*) FROM duplicate_group_items i
                    WHERE i.group_id = duplicate_groups.id) < 2",
            [],
        )?;
        Ok(deleted)
    }

    pub fn delete(&self, group_id: &str) -> Result<bool, DatabaseError> {
        // Items cascade.
        let deleted = self.conn.execute(
            "DELETE FROM duplicate_groups WHERE id = ?1",
            params![group_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn count(&self, hash_type: Option<&HashType>) -> Result<usize, DatabaseError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM duplicate_groups WHERE ?1 IS NULL OR hash_type = ?1",
            params![hash_type.map(|t| t.as_str())],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_item(
        &self,
        group_id: &str,
        hash_type: &HashType,
        item: &DuplicateGroupItem,
    ) -> Result<bool, DatabaseError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO duplicate_group_items
             (group_id, content_id, hash_type, similarity)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, item.content_id, hash_type.as_str(), item.similarity],
        )?;
        Ok(inserted > 0)
    }

    fn load_items(&self, group_id: &str) -> Result<Vec<DuplicateGroupItem>, DatabaseError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT content_id, similarity FROM duplicate_group_items
             WHERE group_id = ?1 ORDER BY rowid",
        )?;
        let items = stmt
            .query_map(params![group_id], |row| {
                Ok(DuplicateGroupItem {
                    content_id: row.get(0)?,
                    similarity: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn touch(&self, group_id: &str) -> Result<(), DatabaseError> {
        self.conn.execute(
            "UPDATE duplicate_groups SET updated_at = ?1 WHERE id = ?2",
            params![now(), group_id],
        )?;
        Ok(())
    }
}
