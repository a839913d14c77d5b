use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::db::Database;
use crate::models::{enforcement_state, ActivityName, EnforcementState, RestrictionSet};

use super::{Enforcer, RestrictionStore};

const ENABLE_LOGS: bool = true;

use crate::log_info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum SelectionOutcome {
    /// Nothing was picked; all restrictions are lifted.
    Cleared,
    /// Saved and shielded now.
    Applied { applications: usize, categories: usize },
    /// Saved; an unlock is running, so the shield picks it up when it ends.
    Deferred { applications: usize, categories: usize },
}

/// Commits the user's picker selection: persist it, then bring the shield in
/// line with it unless an unlock window is open.
#[derive(Clone)]
pub struct SelectionFlow {
    db: Database,
    store: RestrictionStore,
    enforcer: Enforcer,
}

impl SelectionFlow {
    pub fn new(db: Database, store: RestrictionStore, enforcer: Enforcer) -> Self {
        Self {
            db,
            store,
            enforcer,
        }
    }

    pub async fn commit(&self, set: RestrictionSet) -> Result<SelectionOutcome> {
        self.store.save_set(&set).await?;

        let applications = set.applications.len();
        let categories = set.categories.len();
        if set.is_empty() {
            self.enforcer.clear().await?;
            log_info!("Empty selection committed; restrictions cleared");
            return Ok(SelectionOutcome::Cleared);
        }

        let unlock_ends_at = self
            .db
            .unlock_end_time(&ActivityName::unlock())
            .await
            .unwrap_or_default();
        match enforcement_state(&set, unlock_ends_at, Utc::now()) {
            EnforcementState::Shielded(set) => {
                self.enforcer.apply(&set).await?;
                Ok(SelectionOutcome::Applied {
                    applications,
                    categories,
                })
            }
            EnforcementState::Unshielded => {
                log_info!("Selection saved during an unlock; shield follows when it ends");
                Ok(SelectionOutcome::Deferred {
                    applications,
                    categories,
                })
            }
        }
    }
}
