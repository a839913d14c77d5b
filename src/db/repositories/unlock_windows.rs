use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{
    helpers::{format_datetime, parse_datetime},
    Database,
};
use crate::models::{ActivityName, RelockMode};

use super::defaults::{delete_value, read_value, write_value};

/// Shared key holding the end of the unlock registered under `activity`.
pub fn unlock_end_key(activity: &ActivityName) -> String {
    format!("unlockEndTime_{activity}")
}

/// Shared key recording how the unlock under `activity` gets re-locked.
pub fn unlock_relock_key(activity: &ActivityName) -> String {
    format!("unlockRelock_{activity}")
}

impl Database {
    pub async fn unlock_end_time(&self, activity: &ActivityName) -> Result<Option<DateTime<Utc>>> {
        let key = unlock_end_key(activity);
        self.execute(move |conn| match read_value(conn, &key)? {
            Some(raw) => parse_datetime(&raw, &key).map(Some),
            None => Ok(None),
        })
        .await
    }

    pub async fn set_unlock_end_time(
        &self,
        activity: &ActivityName,
        ends_at: DateTime<Utc>,
    ) -> Result<()> {
        let key = unlock_end_key(activity);
        self.execute(move |conn| write_value(conn, &key, &format_datetime(ends_at)))
            .await
    }

    pub async fn unlock_relock_mode(&self, activity: &ActivityName) -> Result<Option<RelockMode>> {
        let key = unlock_relock_key(activity);
        self.execute(move |conn| match read_value(conn, &key)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode {key}"))
                .map(Some),
            None => Ok(None),
        })
        .await
    }

    pub async fn set_unlock_relock_mode(&self, activity: &ActivityName, mode: RelockMode) -> Result<()> {
        let key = unlock_relock_key(activity);
        let value = serde_json::to_string(&mode)?;
        self.execute(move |conn| write_value(conn, &key, &value)).await
    }

    /// Forget the window under `activity`, end time and relock mode together.
    pub async fn clear_unlock_end_time(&self, activity: &ActivityName) -> Result<bool> {
        let key = unlock_end_key(activity);
        let relock_key = unlock_relock_key(activity);
        self.execute(move |conn| {
            delete_value(conn, &relock_key)?;
            delete_value(conn, &key)
        })
        .await
    }

    /// Drop the end time only if it is not after `now`, leaving a newer
    /// window written by another process untouched. Values are stored in one
    /// fixed-width UTC format, so text comparison orders them.
    pub async fn clear_unlock_end_time_if_elapsed(
        &self,
        activity: &ActivityName,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = unlock_end_key(activity);
        let relock_key = unlock_relock_key(activity);
        self.execute(move |conn| {
            let removed = conn.execute(
                "DELETE FROM shared_defaults WHERE key = ?1 AND value <= ?2",
                params![key, format_datetime(now)],
            )?;
            if removed > 0 {
                delete_value(conn, &relock_key)?;
            }
            Ok(removed > 0)
        })
        .await
    }
}
