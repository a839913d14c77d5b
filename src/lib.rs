pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod ffi;
pub mod models;
pub mod platform;
pub mod restrictions;
pub mod timer;
pub mod unlock;
pub mod utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use classify::{ClassificationGate, VisionClassifier};
use config::AppConfig;
use db::Database;
use error::UnlockRequestError;
use models::{
    enforcement_state, remaining_secs, ActivityName, EnforcementState, RestrictionSet,
    SelectionState,
};
use platform::{
    off_runtime, AuthorizationCenter, AuthorizationStatus, MonitorCenter, Notifier, ShieldConfig,
    ShieldSettings, SharedMonitorCenter, SharedShield, StaticAuthorization,
};
use restrictions::{Enforcer, RestrictionStore, SelectionFlow};
use timer::CountdownController;
use unlock::{
    confirm_unlock, ConfirmedUnlock, MonitorDispatcher, MonitorHandler, UnlockScheduler, UnlockTicket,
};

pub use utils::logging;

const ENABLE_LOGS: bool = true;

/// Everything one process needs, wired against one shared store.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub store: RestrictionStore,
    pub enforcer: Enforcer,
    pub scheduler: UnlockScheduler,
    pub monitor: MonitorHandler,
    authorization: Arc<dyn AuthorizationCenter>,
    center: Arc<dyn MonitorCenter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub selection: SelectionState,
    pub restrictions: RestrictionSet,
    pub unlock_ends_at: Option<DateTime<Utc>>,
    pub remaining_secs: u64,
    pub enforcement: EnforcementState,
    pub shield: ShieldConfig,
    pub monitored_activities: Vec<ActivityName>,
}

impl AppState {
    /// Open the shared store under `config.data_dir` with the store-backed
    /// shield and monitor.
    pub fn open(config: AppConfig) -> Result<Self> {
        let db = Database::new(config.store_path())?;
        let shield = Arc::new(SharedShield::new(db.clone()));
        let center = Arc::new(SharedMonitorCenter::new(db.clone(), config.monitor_limits()));
        let authorization = Arc::new(StaticAuthorization(AuthorizationStatus::Approved));
        Ok(Self::with_platform(config, db, shield, center, authorization))
    }

    pub fn with_platform(
        config: AppConfig,
        db: Database,
        shield: Arc<dyn ShieldSettings>,
        center: Arc<dyn MonitorCenter>,
        authorization: Arc<dyn AuthorizationCenter>,
    ) -> Self {
        let store = RestrictionStore::new(db.clone());
        let enforcer = Enforcer::new(shield);
        let scheduler = UnlockScheduler::new(
            center.clone(),
            enforcer.clone(),
            store.clone(),
            db.clone(),
            config.scheduler_timings(),
        );
        let monitor = MonitorHandler::new(db.clone(), store.clone(), enforcer.clone());
        Self {
            config,
            db,
            store,
            enforcer,
            scheduler,
            monitor,
            authorization,
            center,
        }
    }

    pub fn selection(&self) -> SelectionFlow {
        SelectionFlow::new(self.db.clone(), self.store.clone(), self.enforcer.clone())
    }

    pub fn countdown(&self, notifier: Arc<dyn Notifier>) -> CountdownController {
        CountdownController::new(
            self.scheduler.clone(),
            self.enforcer.clone(),
            self.store.clone(),
            self.db.clone(),
            notifier,
            self.config.debug,
        )
    }

    pub fn dispatcher(&self) -> MonitorDispatcher {
        MonitorDispatcher::new(self.db.clone(), self.monitor.clone(), self.config.dispatch_poll())
    }

    /// Gate and grant an unlock without a foreground countdown.
    /// Gate refusals come back as `UnlockRequestError` inside the `anyhow`
    /// error.
    pub async fn request_unlock(&self, duration_minutes: u32) -> Result<UnlockTicket> {
        let confirmed = self.confirm_unlock(duration_minutes).await?;
        self.scheduler.start_for(confirmed.duration).await
    }

    /// The full capture flow: gate the request, have the classifier confirm
    /// the photo shows a toilet, then grant.
    pub async fn unlock_with_photo<C: VisionClassifier>(
        &self,
        classifier: C,
        image: &[u8],
        duration_minutes: u32,
    ) -> Result<UnlockTicket> {
        let confirmed = self.confirm_unlock(duration_minutes).await?;
        let gate = ClassificationGate::new(classifier, self.config.classification_timeout());
        if !gate.confirm(image).await? {
            log_info!("Photo rejected, staying locked");
            return Err(UnlockRequestError::NotAToilet.into());
        }
        self.scheduler.start_for(confirmed.duration).await
    }

    pub async fn confirm_unlock(
        &self,
        duration_minutes: u32,
    ) -> Result<ConfirmedUnlock, UnlockRequestError> {
        confirm_unlock(self.authorization.as_ref(), &self.store, duration_minutes).await
    }

    /// Bring the shield in line with the persisted state after a (re)start:
    /// shielded with the saved set unless an unlock window is still open.
    pub async fn restore_on_launch(&self) -> Result<EnforcementState> {
        let now = Utc::now();
        let unlock = ActivityName::unlock();
        let set = self.store.load().await;
        let unlock_ends_at = match self.db.unlock_end_time(&unlock).await {
            Ok(ends_at) => ends_at,
            Err(err) => {
                log_warn!("Unreadable unlock end time, treating as none: {err:#}");
                None
            }
        };

        let state = enforcement_state(&set, unlock_ends_at, now);
        match &state {
            EnforcementState::Shielded(set) => {
                self.enforcer.apply(set).await?;
                log_info!("Launch restore: shield re-applied");
            }
            EnforcementState::Unshielded => {
                self.enforcer.clear().await?;
                log_info!("Launch restore: nothing to shield or unlock still open");
            }
        }

        if unlock_ends_at.is_some_and(|end| end > now) {
            if let Some(mode) = self.scheduler.rearm().await? {
                log_info!("Launch restore: open window relocks via {mode:?}");
            }
        }

        if unlock_ends_at.is_some_and(|end| end <= now) {
            self.db.clear_unlock_end_time_if_elapsed(&unlock, now).await?;
        }
        Ok(state)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let now = Utc::now();
        let restrictions = self.store.load().await;
        let unlock_ends_at = self.db.unlock_end_time(&ActivityName::unlock()).await?;
        let center = self.center.clone();
        let monitored_activities = off_runtime(move || center.activities()).await?;
        Ok(StatusReport {
            selection: self.store.selection_state().await,
            remaining_secs: unlock_ends_at
                .map(|end| remaining_secs(end, now))
                .unwrap_or(0),
            enforcement: enforcement_state(&restrictions, unlock_ends_at, now),
            restrictions,
            unlock_ends_at,
            shield: self.enforcer.current().await?,
            monitored_activities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassificationError;
    use crate::models::{ApplicationToken, CategoryToken, RelockMode};
    use crate::platform::memory::{MemoryMonitorCenter, MemoryShield};
    use crate::unlock::UnlockPath;
    use anyhow::anyhow;

    enum Classifier {
        Says(&'static str),
        Offline,
    }

    impl VisionClassifier for Classifier {
        async fn classify(&self, _image: &[u8], _prompt: &str) -> anyhow::Result<String> {
            match self {
                Classifier::Says(answer) => Ok(answer.to_string()),
                Classifier::Offline => Err(anyhow!("no network")),
            }
        }
    }

    fn app_with(status: AuthorizationStatus) -> (AppState, MemoryShield) {
        let shield = MemoryShield::new();
        let config = AppConfig {
            settle_delay_ms: 1,
            ..AppConfig::default()
        };
        let state = AppState::with_platform(
            config,
            Database::in_memory().unwrap(),
            Arc::new(shield.clone()),
            Arc::new(MemoryMonitorCenter::new()),
            Arc::new(StaticAuthorization(status)),
        );
        (state, shield)
    }

    fn picked() -> RestrictionSet {
        RestrictionSet::new([ApplicationToken::new("appsA")], [CategoryToken::new("catsB")])
    }

    #[tokio::test]
    async fn launch_restore_reapplies_without_an_open_window() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.store.save_set(&picked()).await.unwrap();

        let state = app.restore_on_launch().await.unwrap();
        assert_eq!(state, EnforcementState::Shielded(picked()));
        assert_eq!(shield.snapshot().applications, Some(picked().applications));
    }

    #[tokio::test]
    async fn launch_restore_respects_an_open_window() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.store.save_set(&picked()).await.unwrap();
        app.enforcer.apply(&picked()).await.unwrap();
        app.db
            .set_unlock_end_time(&ActivityName::unlock(), Utc::now() + chrono::Duration::minutes(3))
            .await
            .unwrap();

        assert_eq!(app.restore_on_launch().await.unwrap(), EnforcementState::Unshielded);
        assert!(shield.snapshot().is_clear());
    }

    #[tokio::test]
    async fn launch_restore_forgets_an_elapsed_window() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.store.save_set(&picked()).await.unwrap();
        app.db
            .set_unlock_end_time(&ActivityName::unlock(), Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();

        app.restore_on_launch().await.unwrap();
        assert!(!shield.snapshot().is_clear());
        assert_eq!(app.db.unlock_end_time(&ActivityName::unlock()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn request_unlock_is_gated() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        let err = app.request_unlock(5).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<UnlockRequestError>(),
            Some(&UnlockRequestError::NoSelection)
        );
        assert_eq!(shield.write_count(), 0);

        let (denied, _) = app_with(AuthorizationStatus::Denied);
        denied.store.save_set(&picked()).await.unwrap();
        let err = denied.request_unlock(5).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<UnlockRequestError>(),
            Some(&UnlockRequestError::AuthorizationDenied)
        );
    }

    #[tokio::test]
    async fn status_reports_the_open_window() {
        let (app, _) = app_with(AuthorizationStatus::Approved);
        app.selection().commit(picked()).await.unwrap();
        app.request_unlock(5).await.unwrap();

        let status = app.status().await.unwrap();
        assert_eq!(status.selection, SelectionState::Picked);
        assert_eq!(status.enforcement, EnforcementState::Unshielded);
        assert!(status.remaining_secs > 290 && status.remaining_secs <= 300);
        assert!(status.shield.is_clear());
        assert_eq!(status.monitored_activities, vec![ActivityName::unlock()]);
    }

    #[tokio::test]
    async fn launch_restore_rearms_a_fallback_window() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.store.save_set(&picked()).await.unwrap();
        let unlock = ActivityName::unlock();
        app.db
            .set_unlock_end_time(&unlock, Utc::now() + chrono::Duration::minutes(3))
            .await
            .unwrap();
        app.db
            .set_unlock_relock_mode(&unlock, RelockMode::InProcess)
            .await
            .unwrap();

        assert_eq!(app.restore_on_launch().await.unwrap(), EnforcementState::Unshielded);
        assert!(shield.snapshot().is_clear());
        assert!(app.scheduler.fallback_armed().await);
        app.scheduler.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn photo_of_a_toilet_unlocks() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.selection().commit(picked()).await.unwrap();

        let ticket = app
            .unlock_with_photo(Classifier::Says("Yes."), b"jpeg", 5)
            .await
            .unwrap();
        assert_eq!(ticket.path, UnlockPath::Monitored);
        assert!(shield.snapshot().is_clear());
    }

    #[tokio::test]
    async fn photo_without_a_toilet_stays_locked() {
        let (app, shield) = app_with(AuthorizationStatus::Approved);
        app.selection().commit(picked()).await.unwrap();

        let err = app
            .unlock_with_photo(Classifier::Says("No, that is a sink."), b"jpeg", 5)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<UnlockRequestError>(),
            Some(&UnlockRequestError::NotAToilet)
        );

        let err = app
            .unlock_with_photo(Classifier::Offline, b"jpeg", 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClassificationError>(),
            Some(ClassificationError::Failed(_))
        ));

        assert!(!shield.snapshot().is_clear());
        assert_eq!(app.db.unlock_end_time(&ActivityName::unlock()).await.unwrap(), None);
    }
}
