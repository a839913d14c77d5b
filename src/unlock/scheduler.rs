use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time,
};

use crate::db::Database;
use crate::error::ScheduleError;
use crate::models::{
    ActivityName, DeviceActivitySchedule, RelockMode, RestrictionSet, UnlockWindow,
};
use crate::platform::{off_runtime, MonitorCenter};
use crate::restrictions::{Enforcer, RestrictionStore};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Which re-lock mechanism guards an unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "path", content = "reason")]
pub enum UnlockPath {
    /// The interval monitor will deliver the end callback.
    Monitored,
    /// Registration was refused; an in-process timer re-locks.
    Fallback(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockTicket {
    pub window: UnlockWindow,
    pub path: UnlockPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The in-process fallback timer re-applied `relocked`; leave the timer screen.
    FallbackFired { relocked: RestrictionSet },
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTimings {
    /// Pause between stopping the old registration and creating the new one.
    pub settle_delay: Duration,
    pub warning_lead: Duration,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            warning_lead: crate::models::DEFAULT_WARNING_LEAD,
        }
    }
}

/// Grants unlock windows and makes sure one re-lock mechanism is always armed.
#[derive(Clone)]
pub struct UnlockScheduler {
    activity: ActivityName,
    center: Arc<dyn MonitorCenter>,
    enforcer: Enforcer,
    store: RestrictionStore,
    db: Database,
    timings: SchedulerTimings,
    fallback: Arc<Mutex<Option<JoinHandle<()>>>>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl UnlockScheduler {
    pub fn new(
        center: Arc<dyn MonitorCenter>,
        enforcer: Enforcer,
        store: RestrictionStore,
        db: Database,
        timings: SchedulerTimings,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            activity: ActivityName::unlock(),
            center,
            enforcer,
            store,
            db,
            timings,
            fallback: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn activity(&self) -> &ActivityName {
        &self.activity
    }

    pub async fn start(&self, duration_minutes: u32) -> Result<UnlockTicket> {
        self.start_for(Duration::from_secs(u64::from(duration_minutes) * 60))
            .await
    }

    /// Open an unlock window of `duration` starting now.
    ///
    /// Restrictions are cleared before this returns on both paths, and only
    /// once a re-lock is armed. A refused registration is not an error: the
    /// fallback timer takes over.
    pub async fn start_for(&self, duration: Duration) -> Result<UnlockTicket> {
        if duration.is_zero() {
            bail!("unlock duration must be greater than zero");
        }

        let window = UnlockWindow::starting_at(
            self.activity.clone(),
            Utc::now(),
            duration,
            self.timings.warning_lead,
        )?;
        log_info!(
            "Starting unlock {} until {} ({}s)",
            window.activity,
            window.ends_at,
            duration.as_secs()
        );

        self.cancel_fallback().await;

        // The monitor keeps stale registrations alongside new ones until they
        // are stopped, and needs a moment to release them.
        self.stop_monitoring().await;
        time::sleep(self.timings.settle_delay).await;

        let schedule = DeviceActivitySchedule::for_window(&window);
        let registration = if schedule.spans(&window) {
            self.register(&schedule).await
        } else {
            Err(ScheduleError::WindowTooLong(duration))
        };
        let relock = match registration {
            Ok(()) => RelockMode::Monitored,
            Err(_) => RelockMode::InProcess,
        };

        self.db
            .set_unlock_end_time(&self.activity, window.ends_at)
            .await?;
        self.db.set_unlock_relock_mode(&self.activity, relock).await?;

        let path = match registration {
            Ok(()) => {
                log_info!(
                    "Monitoring {} from {} to {}",
                    self.activity,
                    schedule.interval_start,
                    schedule.interval_end
                );
                UnlockPath::Monitored
            }
            Err(err) => {
                log_warn!("Interval registration failed, using in-process timer: {err}");
                self.arm_fallback(window.ends_at).await;
                UnlockPath::Fallback(err.to_string())
            }
        };
        self.enforcer.clear().await?;

        Ok(UnlockTicket { window, path })
    }

    /// End the current unlock early and re-lock now.
    pub async fn cancel(&self) -> Result<RestrictionSet> {
        self.stop_monitoring().await;
        self.cancel_fallback().await;
        self.db.clear_unlock_end_time(&self.activity).await?;
        let set = self.enforcer.reapply_saved(&self.store).await?;
        log_info!("Unlock cancelled; restrictions re-applied");
        Ok(set)
    }

    /// Pick up an open window after a restart. A window granted on the
    /// fallback path gets its timer back; an unknown mode counts as one.
    /// Returns the window's relock mode, or `None` when nothing is open.
    pub async fn rearm(&self) -> Result<Option<RelockMode>> {
        let now = Utc::now();
        let Some(ends_at) = self
            .db
            .unlock_end_time(&self.activity)
            .await?
            .filter(|end| *end > now)
        else {
            return Ok(None);
        };

        let mode = match self.db.unlock_relock_mode(&self.activity).await {
            Ok(mode) => mode.unwrap_or(RelockMode::InProcess),
            Err(err) => {
                log_warn!("Unreadable relock mode, assuming the fallback path: {err:#}");
                RelockMode::InProcess
            }
        };
        if mode == RelockMode::InProcess && !self.fallback_armed().await {
            log_info!("Re-arming fallback timer until {ends_at}");
            self.arm_fallback(ends_at).await;
        }
        Ok(Some(mode))
    }

    pub async fn fallback_armed(&self) -> bool {
        self.fallback
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn register(&self, schedule: &DeviceActivitySchedule) -> Result<(), ScheduleError> {
        let center = self.center.clone();
        let activity = self.activity.clone();
        let schedule = schedule.clone();
        tokio::task::spawn_blocking(move || center.start_monitoring(&activity, &schedule))
            .await
            .unwrap_or_else(|err| Err(ScheduleError::Unavailable(err.to_string())))
    }

    async fn stop_monitoring(&self) {
        let center = self.center.clone();
        let activities = vec![self.activity.clone()];
        let stopped = off_runtime(move || {
            center.stop_monitoring(&activities);
            Ok(())
        })
        .await;
        if let Err(err) = stopped {
            log_warn!("Stopping {} did not complete: {err:#}", self.activity);
        }
    }

    async fn arm_fallback(&self, ends_at: DateTime<Utc>) {
        let mut guard = self.fallback.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let enforcer = self.enforcer.clone();
        let store = self.store.clone();
        let db = self.db.clone();
        let activity = self.activity.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let remaining = (ends_at - Utc::now()).to_std().unwrap_or_default();
            time::sleep(remaining).await;

            let relocked = match enforcer.reapply_saved(&store).await {
                Ok(set) => set,
                Err(err) => {
                    log_error!("Fallback re-lock failed: {err:#}");
                    return;
                }
            };
            log_info!(
                "Fallback timer re-locked {} apps, {} categories",
                relocked.applications.len(),
                relocked.categories.len()
            );

            if let Err(err) = db.clear_unlock_end_time_if_elapsed(&activity, Utc::now()).await {
                log_warn!("Failed to clear elapsed unlock end time: {err:#}");
            }

            // Nobody listening is fine: the shield is already back.
            let _ = events.send(SchedulerEvent::FallbackFired { relocked });
        });

        *guard = Some(handle);
    }

    async fn cancel_fallback(&self) {
        if let Some(handle) = self.fallback.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApplicationToken, CategoryToken};
    use crate::platform::memory::{MemoryMonitorCenter, MemoryShield, MonitorCall};

    struct Fixture {
        scheduler: UnlockScheduler,
        enforcer: Enforcer,
        store: RestrictionStore,
        center: MemoryMonitorCenter,
        shield: MemoryShield,
        db: Database,
        set: RestrictionSet,
    }

    async fn fixture(center: MemoryMonitorCenter) -> Fixture {
        let db = Database::in_memory().unwrap();
        let store = RestrictionStore::new(db.clone());
        let set = RestrictionSet::new([ApplicationToken::new("appsA")], [CategoryToken::new("catsB")]);
        store.save_set(&set).await.unwrap();

        let shield = MemoryShield::new();
        let enforcer = Enforcer::new(Arc::new(shield.clone()));
        enforcer.apply(&set).await.unwrap();

        let scheduler = UnlockScheduler::new(
            Arc::new(center.clone()),
            enforcer.clone(),
            store.clone(),
            db.clone(),
            SchedulerTimings {
                settle_delay: Duration::from_millis(5),
                ..SchedulerTimings::default()
            },
        );
        Fixture {
            scheduler,
            enforcer,
            store,
            center,
            shield,
            db,
            set,
        }
    }

    #[tokio::test]
    async fn start_clears_and_persists_end_time() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        let before = Utc::now();

        let ticket = fx.scheduler.start(5).await.unwrap();

        assert_eq!(ticket.path, UnlockPath::Monitored);
        assert!(fx.shield.snapshot().is_clear());
        let stored = fx
            .db
            .unlock_end_time(&ActivityName::unlock())
            .await
            .unwrap()
            .unwrap();
        let expected = before + chrono::Duration::minutes(5);
        assert!((stored - expected).num_seconds().abs() <= 2);
        assert!(!fx.scheduler.fallback_armed().await);
    }

    #[tokio::test]
    async fn registration_is_preceded_by_stop() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        fx.scheduler.start(5).await.unwrap();
        fx.scheduler.start(10).await.unwrap();

        let calls = fx.center.calls();
        assert_eq!(calls.len(), 4);
        assert!(matches!(&calls[0], MonitorCall::Stop(names) if names == &[ActivityName::unlock()]));
        assert!(matches!(&calls[1], MonitorCall::Start(name, _) if name.is_unlock()));
        assert!(matches!(&calls[2], MonitorCall::Stop(_)));
        assert!(matches!(&calls[3], MonitorCall::Start(_, _)));
        assert_eq!(fx.center.registrations().len(), 1);
    }

    #[tokio::test]
    async fn schedule_is_non_repeating_with_warning_lead() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        fx.scheduler.start(5).await.unwrap();
        let (_, schedule) = fx.center.registrations().remove(0);
        assert!(!schedule.repeats);
        assert_eq!(schedule.warning_time, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn refused_registration_falls_back_and_relocks() {
        let center = MemoryMonitorCenter::failing_with(ScheduleError::ExcessiveActivities { limit: 0 });
        let fx = fixture(center).await;
        let mut events = fx.scheduler.subscribe();

        let ticket = fx
            .scheduler
            .start_for(Duration::from_millis(150))
            .await
            .unwrap();

        assert!(matches!(ticket.path, UnlockPath::Fallback(_)));
        assert!(fx.shield.snapshot().is_clear());
        assert!(fx.scheduler.fallback_armed().await);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SchedulerEvent::FallbackFired {
                relocked: fx.set.clone()
            }
        );
        assert_eq!(fx.shield.snapshot().applications, Some(fx.set.applications.clone()));
        assert_eq!(fx.shield.snapshot().categories, Some(fx.set.categories.clone()));
    }

    #[tokio::test]
    async fn new_unlock_disarms_previous_fallback() {
        let center = MemoryMonitorCenter::failing_with(ScheduleError::ExcessiveActivities { limit: 0 });
        let fx = fixture(center.clone()).await;
        fx.scheduler.start_for(Duration::from_millis(100)).await.unwrap();

        center.fail_with(None);
        fx.scheduler.start(5).await.unwrap();
        assert!(!fx.scheduler.fallback_armed().await);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(fx.shield.snapshot().is_clear());
    }

    #[tokio::test]
    async fn cancel_relocks_and_forgets_the_window() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        fx.scheduler.start(5).await.unwrap();

        let relocked = fx.scheduler.cancel().await.unwrap();

        assert_eq!(relocked, fx.set);
        assert!(!fx.shield.snapshot().is_clear());
        assert!(fx.center.registrations().is_empty());
        assert_eq!(fx.db.unlock_end_time(&ActivityName::unlock()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_duration_is_rejected() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        assert!(fx.scheduler.start(0).await.is_err());
        assert!(fx.center.calls().is_empty());
        assert!(!fx.shield.snapshot().is_clear());
    }

    #[tokio::test]
    async fn relock_mode_is_persisted_with_the_window() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        fx.scheduler.start(5).await.unwrap();
        assert_eq!(
            fx.db.unlock_relock_mode(&ActivityName::unlock()).await.unwrap(),
            Some(RelockMode::Monitored)
        );

        fx.center.fail_with(Some(ScheduleError::Unavailable("offline".into())));
        fx.scheduler.start(5).await.unwrap();
        assert_eq!(
            fx.db.unlock_relock_mode(&ActivityName::unlock()).await.unwrap(),
            Some(RelockMode::InProcess)
        );
        fx.scheduler.cancel().await.unwrap();
        assert_eq!(fx.db.unlock_relock_mode(&ActivityName::unlock()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_clear_leaves_the_fallback_armed() {
        let center = MemoryMonitorCenter::failing_with(ScheduleError::Unavailable("offline".into()));
        let fx = fixture(center).await;
        fx.shield.fail_next_writes(1);

        assert!(fx.scheduler.start(5).await.is_err());
        assert!(fx.scheduler.fallback_armed().await);
        fx.scheduler.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn day_long_unlock_is_not_registered() {
        let fx = fixture(MemoryMonitorCenter::new()).await;

        let ticket = fx
            .scheduler
            .start_for(Duration::from_secs(25 * 60 * 60))
            .await
            .unwrap();

        assert!(matches!(ticket.path, UnlockPath::Fallback(_)));
        assert!(fx.center.registrations().is_empty());
        assert!(!fx
            .center
            .calls()
            .iter()
            .any(|call| matches!(call, MonitorCall::Start(_, _))));
        assert!(fx.scheduler.fallback_armed().await);
        assert!(fx.shield.snapshot().is_clear());
        fx.scheduler.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn restarted_process_rearms_a_fallback_window() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        let unlock = ActivityName::unlock();
        fx.enforcer.clear().await.unwrap();
        fx.db
            .set_unlock_end_time(&unlock, Utc::now() + chrono::Duration::milliseconds(200))
            .await
            .unwrap();
        fx.db.set_unlock_relock_mode(&unlock, RelockMode::InProcess).await.unwrap();

        // A fresh scheduler stands in for the relaunched process.
        let relaunched = UnlockScheduler::new(
            Arc::new(MemoryMonitorCenter::new()),
            fx.enforcer.clone(),
            fx.store.clone(),
            fx.db.clone(),
            SchedulerTimings::default(),
        );
        let mut events = relaunched.subscribe();
        assert_eq!(relaunched.rearm().await.unwrap(), Some(RelockMode::InProcess));
        assert!(relaunched.fallback_armed().await);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SchedulerEvent::FallbackFired { relocked: fx.set.clone() });
        assert_eq!(fx.shield.snapshot().applications, Some(fx.set.applications.clone()));
    }

    #[tokio::test]
    async fn rearm_leaves_monitored_windows_to_the_monitor() {
        let fx = fixture(MemoryMonitorCenter::new()).await;
        fx.scheduler.start(5).await.unwrap();
        assert_eq!(fx.scheduler.rearm().await.unwrap(), Some(RelockMode::Monitored));
        assert!(!fx.scheduler.fallback_armed().await);

        fx.db.clear_unlock_end_time(&ActivityName::unlock()).await.unwrap();
        assert_eq!(fx.scheduler.rearm().await.unwrap(), None);
    }
}
