//! Platform seams backed by the shared store.
//!
//! The shield and the interval registrations live in the same SQLite file as
//! the restriction set, so the foreground process and the monitor process see
//! one state without talking to each other.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, Utc};
use log::{info, warn};
use uuid::Uuid;

use crate::db::{
    repositories::{registrations, shield},
    Database,
};
use crate::error::ScheduleError;
use crate::models::{
    ActivityName, ApplicationToken, CategoryToken, DeviceActivitySchedule, MonitorRegistration,
};

use super::{MonitorCenter, ShieldConfig, ShieldSettings};

#[derive(Clone)]
pub struct SharedShield {
    db: Database,
}

impl SharedShield {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ShieldSettings for SharedShield {
    fn set_applications(&self, applications: Option<BTreeSet<ApplicationToken>>) -> Result<()> {
        self.db
            .execute_blocking(move |conn| shield::write_applications(conn, applications.as_ref()))
    }

    fn set_categories(&self, categories: Option<BTreeSet<CategoryToken>>) -> Result<()> {
        self.db
            .execute_blocking(move |conn| shield::write_categories(conn, categories.as_ref()))
    }

    fn current(&self) -> Result<ShieldConfig> {
        self.db.execute_blocking(|conn| shield::read_shield(conn))
    }
}

/// Limits the monitor enforces on registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorLimits {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub max_activities: usize,
}

impl Default for MonitorLimits {
    fn default() -> Self {
        Self {
            min_interval: Duration::ZERO,
            max_interval: Duration::from_secs(7 * 24 * 60 * 60),
            max_activities: 20,
        }
    }
}

impl MonitorLimits {
    fn check(&self, interval: Duration, warning: Duration) -> Result<(), ScheduleError> {
        if interval < self.min_interval || interval.is_zero() {
            return Err(ScheduleError::IntervalTooShort {
                actual: interval,
                minimum: self.min_interval,
            });
        }
        if interval > self.max_interval {
            return Err(ScheduleError::IntervalTooLong {
                actual: interval,
                maximum: self.max_interval,
            });
        }
        if warning >= interval {
            return Err(ScheduleError::WarningExceedsInterval { warning, interval });
        }
        Ok(())
    }
}

/// Registrations persisted for the dispatcher in the monitor process.
#[derive(Clone)]
pub struct SharedMonitorCenter {
    db: Database,
    limits: MonitorLimits,
}

impl SharedMonitorCenter {
    pub fn new(db: Database, limits: MonitorLimits) -> Self {
        Self { db, limits }
    }
}

impl MonitorCenter for SharedMonitorCenter {
    fn start_monitoring(
        &self,
        activity: &ActivityName,
        schedule: &DeviceActivitySchedule,
    ) -> Result<(), ScheduleError> {
        let registered_at = Utc::now();
        let resolved = schedule.resolve(&registered_at.with_timezone(&Local))?;
        self.limits.check(resolved.length(), schedule.warning_time)?;

        let record = MonitorRegistration {
            id: Uuid::new_v4().to_string(),
            activity: activity.clone(),
            schedule: schedule.clone(),
            interval_start: resolved.starts_at,
            interval_end: resolved.ends_at,
            warning_at: resolved.warning_at,
            registered_at,
            start_delivered_at: None,
            warning_delivered_at: None,
            end_delivered_at: None,
        };

        let max_activities = self.limits.max_activities;
        let outcome = self.db.execute_blocking(move |conn| {
            if registrations::count_registrations(conn)? >= max_activities {
                return Ok(Err(ScheduleError::ExcessiveActivities {
                    limit: max_activities,
                }));
            }
            registrations::insert_registration(conn, &record)?;
            Ok(Ok(record))
        });

        match outcome {
            Ok(Ok(record)) => {
                info!(
                    "Registered {} from {} to {} (id {})",
                    record.activity, record.interval_start, record.interval_end, record.id
                );
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(err) => Err(ScheduleError::Unavailable(format!("{err:#}"))),
        }
    }

    fn stop_monitoring(&self, activities: &[ActivityName]) {
        let names = activities.to_vec();
        match self
            .db
            .execute_blocking(move |conn| registrations::delete_for_activities(conn, &names))
        {
            Ok(removed) => info!("Stopped monitoring {activities:?} ({removed} registrations)"),
            Err(err) => warn!("Failed to stop monitoring {activities:?}: {err:#}"),
        }
    }

    fn activities(&self) -> Result<Vec<ActivityName>> {
        let registrations = self
            .db
            .execute_blocking(|conn| registrations::list_registrations(conn))?;
        Ok(registrations.into_iter().map(|r| r.activity).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UnlockWindow, DEFAULT_WARNING_LEAD};

    fn schedule_for(duration: Duration) -> DeviceActivitySchedule {
        let window = UnlockWindow::starting_at(
            ActivityName::unlock(),
            Utc::now(),
            duration,
            DEFAULT_WARNING_LEAD,
        )
        .unwrap();
        DeviceActivitySchedule::for_window(&window)
    }

    #[test]
    fn shield_columns_are_written_independently() {
        let shield = SharedShield::new(Database::in_memory().unwrap());
        assert!(shield.current().unwrap().is_clear());

        shield
            .set_categories(Some([CategoryToken::new("games")].into_iter().collect()))
            .unwrap();
        shield.set_applications(None).unwrap();

        let current = shield.current().unwrap();
        assert_eq!(current.applications, None);
        assert_eq!(current.categories.map(|c| c.len()), Some(1));
    }

    #[test]
    fn registrations_under_one_name_coexist_until_stopped() {
        let center = SharedMonitorCenter::new(Database::in_memory().unwrap(), MonitorLimits::default());
        let unlock = ActivityName::unlock();
        let schedule = schedule_for(Duration::from_secs(300));

        center.start_monitoring(&unlock, &schedule).unwrap();
        center.start_monitoring(&unlock, &schedule).unwrap();
        assert_eq!(center.activities().unwrap().len(), 2);

        center.stop_monitoring(&[unlock]);
        assert!(center.activities().unwrap().is_empty());
    }

    #[test]
    fn short_intervals_are_refused() {
        let limits = MonitorLimits {
            min_interval: Duration::from_secs(15 * 60),
            ..MonitorLimits::default()
        };
        let center = SharedMonitorCenter::new(Database::in_memory().unwrap(), limits);
        let err = center
            .start_monitoring(&ActivityName::unlock(), &schedule_for(Duration::from_secs(300)))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::IntervalTooShort { .. }));
        assert!(center.activities().unwrap().is_empty());
    }

    #[test]
    fn activity_limit_is_enforced() {
        let limits = MonitorLimits {
            max_activities: 1,
            ..MonitorLimits::default()
        };
        let center = SharedMonitorCenter::new(Database::in_memory().unwrap(), limits);
        let schedule = schedule_for(Duration::from_secs(300));
        center
            .start_monitoring(&ActivityName::new("first"), &schedule)
            .unwrap();
        let err = center
            .start_monitoring(&ActivityName::new("second"), &schedule)
            .unwrap_err();
        assert_eq!(err, ScheduleError::ExcessiveActivities { limit: 1 });
    }
}
