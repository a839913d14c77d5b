use std::sync::Arc;

use anyhow::Result;

use crate::models::RestrictionSet;
use crate::platform::{off_runtime, ShieldConfig, ShieldSettings};

use super::RestrictionStore;

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Applies or lifts the shield. Every operation is idempotent, so either
/// execution context may call it at any time. Shield writes are synchronous
/// platform calls and run off the async workers.
#[derive(Clone)]
pub struct Enforcer {
    shield: Arc<dyn ShieldSettings>,
}

impl Enforcer {
    pub fn new(shield: Arc<dyn ShieldSettings>) -> Self {
        Self { shield }
    }

    pub async fn clear(&self) -> Result<()> {
        let shield = self.shield.clone();
        off_runtime(move || {
            shield.set_applications(None)?;
            shield.set_categories(None)
        })
        .await?;
        log_info!("Shield cleared");
        Ok(())
    }

    /// Shield exactly `set`. Applications and categories are handled on their
    /// own: an empty side is lifted without touching the other.
    pub async fn apply(&self, set: &RestrictionSet) -> Result<()> {
        let applications = (!set.applications.is_empty()).then(|| set.applications.clone());
        let categories = (!set.categories.is_empty()).then(|| set.categories.clone());

        let shield = self.shield.clone();
        off_runtime(move || {
            shield.set_applications(applications)?;
            shield.set_categories(categories)
        })
        .await?;
        log_info!(
            "Shield applied: {} apps, {} categories",
            set.applications.len(),
            set.categories.len()
        );
        Ok(())
    }

    /// Load the persisted set and shield it. Used by every re-lock path.
    pub async fn reapply_saved(&self, store: &RestrictionStore) -> Result<RestrictionSet> {
        let set = store.load().await;
        self.apply(&set).await?;
        Ok(set)
    }

    pub async fn current(&self) -> Result<ShieldConfig> {
        let shield = self.shield.clone();
        off_runtime(move || shield.current()).await
    }
}
