//! Key/value records in the shared store, the equivalent of an app-group
//! defaults suite. Every write is a single statement.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{helpers::format_datetime, Database};

pub(crate) fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM shared_defaults WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to read shared value {key}"))
}

pub(crate) fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO shared_defaults (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
        params![key, value, format_datetime(Utc::now())],
    )
    .with_context(|| format!("failed to write shared value {key}"))?;
    Ok(())
}

pub(crate) fn delete_value(conn: &Connection, key: &str) -> Result<bool> {
    let removed = conn
        .execute("DELETE FROM shared_defaults WHERE key = ?1", params![key])
        .with_context(|| format!("failed to delete shared value {key}"))?;
    Ok(removed > 0)
}

impl Database {
    pub async fn get_default(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| read_value(conn, &key)).await
    }

    pub async fn set_default(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| write_value(conn, &key, &value)).await
    }

    pub async fn remove_default(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.execute(move |conn| delete_value(conn, &key)).await
    }
}
