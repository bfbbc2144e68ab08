use super::now;
use crate::config::AppConfig;
use crate::database::DatabaseError;
use log::warn;
use rusqlite::{params, Connection};

/// Application settings stored as key/value rows in `app_config`.
pub struct ConfigRepository<'c> {
    conn: &'c Connection,
}

impl<'c> ConfigRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Load the stored settings over the defaults. Unknown keys and values
    /// that do not parse are skipped.
    pub fn get_config(&self) -> Result<AppConfig, DatabaseError> {
        let mut config = AppConfig::default();

        let mut stmt = self.conn.prepare("SELECT key, value FROM app_config")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, value) = row?;
            if let Err(e) = config.set(&key, &value) {
                warn!("Ignoring stored setting: {}", e);
            }
        }

        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<(), DatabaseError> {
        let timestamp = now();
        for (key, value) in config.entries() {
            self.conn.execute(
                "INSERT OR REPLACE INTO app_config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, timestamp],
            )?;
        }
        Ok(())
    }
}
