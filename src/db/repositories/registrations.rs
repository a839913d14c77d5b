use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    helpers::{encode_json, format_datetime, parse_datetime, parse_optional_datetime},
    Database,
};
use crate::models::{ActivityName, MonitorEvent, MonitorRegistration};

const SELECT_COLUMNS: &str = "SELECT id, activity, schedule, interval_start, interval_end, warning_at,
        registered_at, start_delivered_at, warning_delivered_at, end_delivered_at
 FROM monitor_registrations";

fn row_to_registration(row: &Row) -> Result<MonitorRegistration> {
    let schedule: String = row.get(2)?;
    Ok(MonitorRegistration {
        id: row.get(0)?,
        activity: ActivityName::new(row.get::<_, String>(1)?),
        schedule: serde_json::from_str(&schedule).context("failed to decode schedule")?,
        interval_start: parse_datetime(&row.get::<_, String>(3)?, "interval_start")?,
        interval_end: parse_datetime(&row.get::<_, String>(4)?, "interval_end")?,
        warning_at: parse_optional_datetime(row.get(5)?, "warning_at")?,
        registered_at: parse_datetime(&row.get::<_, String>(6)?, "registered_at")?,
        start_delivered_at: parse_optional_datetime(row.get(7)?, "start_delivered_at")?,
        warning_delivered_at: parse_optional_datetime(row.get(8)?, "warning_delivered_at")?,
        end_delivered_at: parse_optional_datetime(row.get(9)?, "end_delivered_at")?,
    })
}

fn delivery_column(event: MonitorEvent) -> &'static str {
    match event {
        MonitorEvent::IntervalDidStart => "start_delivered_at",
        MonitorEvent::IntervalWillEndWarning => "warning_delivered_at",
        MonitorEvent::IntervalDidEnd => "end_delivered_at",
    }
}

pub(crate) fn insert_registration(conn: &Connection, record: &MonitorRegistration) -> Result<()> {
    conn.execute(
        "INSERT INTO monitor_registrations (id, activity, schedule, interval_start, interval_end,
             warning_at, registered_at, start_delivered_at, warning_delivered_at, end_delivered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL)",
        params![
            record.id,
            record.activity.as_str(),
            encode_json(&record.schedule, "schedule")?,
            format_datetime(record.interval_start),
            format_datetime(record.interval_end),
            record.warning_at.map(format_datetime),
            format_datetime(record.registered_at),
        ],
    )
    .context("failed to insert monitor registration")?;
    Ok(())
}

pub(crate) fn delete_for_activities(conn: &Connection, activities: &[ActivityName]) -> Result<usize> {
    let mut removed = 0;
    for activity in activities {
        removed += conn
            .execute(
                "DELETE FROM monitor_registrations WHERE activity = ?1",
                params![activity.as_str()],
            )
            .with_context(|| format!("failed to stop monitoring {activity}"))?;
    }
    Ok(removed)
}

pub(crate) fn count_registrations(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM monitor_registrations", [], |row| {
            row.get(0)
        })
        .context("failed to count monitor registrations")?;
    Ok(count.max(0) as usize)
}

pub(crate) fn list_registrations(conn: &Connection) -> Result<Vec<MonitorRegistration>> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY registered_at ASC"))?;
    let mut rows = stmt.query([])?;
    let mut registrations = Vec::new();
    while let Some(row) = rows.next()? {
        registrations.push(row_to_registration(row)?);
    }
    Ok(registrations)
}

impl Database {
    pub async fn list_registrations(&self) -> Result<Vec<MonitorRegistration>> {
        self.execute(|conn| list_registrations(conn)).await
    }

    /// Mark `event` delivered for registration `id`.
    ///
    /// Returns false when it was already delivered or the registration is gone,
    /// so a callback is handed out at most once even with two dispatchers.
    pub async fn claim_delivery(
        &self,
        id: &str,
        event: MonitorEvent,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let id = id.to_string();
        let column = delivery_column(event);
        self.execute(move |conn| {
            let claimed = conn
                .execute(
                    &format!(
                        "UPDATE monitor_registrations SET {column} = ?1
                         WHERE id = ?2 AND {column} IS NULL"
                    ),
                    params![format_datetime(now), id],
                )
                .with_context(|| format!("failed to claim {event} delivery"))?;
            Ok(claimed == 1)
        })
        .await
    }

    /// Undo a claim whose callback failed, so a later pass delivers it again.
    pub async fn release_delivery(&self, id: &str, event: MonitorEvent) -> Result<()> {
        let id = id.to_string();
        let column = delivery_column(event);
        self.execute(move |conn| {
            conn.execute(
                &format!("UPDATE monitor_registrations SET {column} = NULL WHERE id = ?1"),
                params![id],
            )
            .with_context(|| format!("failed to release {event} delivery"))?;
            Ok(())
        })
        .await
    }

    pub async fn delete_registration(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            conn.execute("DELETE FROM monitor_registrations WHERE id = ?1", params![id])
                .context("failed to delete monitor registration")?;
            Ok(())
        })
        .await
    }
}
