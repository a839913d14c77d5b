//! Interval callbacks, as delivered to the monitor context.
//!
//! Nothing here survives between invocations. Every decision is made from the
//! event and the persisted state, and each callback can be delivered twice.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::db::Database;
use crate::models::{ActivityName, MonitorEvent, RestrictionSet};
use crate::restrictions::{Enforcer, RestrictionStore};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "action", content = "restrictions")]
pub enum MonitorAction {
    Cleared,
    Warned,
    Relocked(RestrictionSet),
    Ignored,
}

#[derive(Clone)]
pub struct MonitorHandler {
    store: RestrictionStore,
    enforcer: Enforcer,
    db: Database,
}

impl MonitorHandler {
    pub fn new(db: Database, store: RestrictionStore, enforcer: Enforcer) -> Self {
        Self {
            store,
            enforcer,
            db,
        }
    }

    pub async fn handle(&self, event: MonitorEvent, activity: &ActivityName) -> Result<MonitorAction> {
        if !activity.is_unlock() {
            log_info!("Ignoring {event} callback for activity {activity}");
            return Ok(MonitorAction::Ignored);
        }

        match event {
            MonitorEvent::IntervalDidStart => {
                // Usually a no-op: the scheduler already cleared optimistically.
                self.enforcer.clear().await?;
                log_info!("Interval {activity} started; restrictions cleared");
                Ok(MonitorAction::Cleared)
            }
            MonitorEvent::IntervalWillEndWarning => {
                log_info!("Interval {activity} ends soon");
                Ok(MonitorAction::Warned)
            }
            MonitorEvent::IntervalDidEnd => {
                let set = self.enforcer.reapply_saved(&self.store).await?;
                log_info!(
                    "Interval {activity} ended; re-locked {} apps, {} categories",
                    set.applications.len(),
                    set.categories.len()
                );
                if let Err(err) = self
                    .db
                    .clear_unlock_end_time_if_elapsed(activity, Utc::now())
                    .await
                {
                    log_warn!("Failed to clear end time for {activity}: {err:#}");
                }
                Ok(MonitorAction::Relocked(set))
            }
        }
    }
}
