use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        Mutex,
    },
    task::JoinHandle,
    time,
};

use crate::{
    db::Database,
    models::{remaining_secs, ActivityName, RestrictionSet},
    platform::{NotificationAuthorization, NotificationRequest, Notifier},
    restrictions::{Enforcer, RestrictionStore},
    unlock::{SchedulerEvent, UnlockPath, UnlockScheduler, UnlockTicket},
};

use super::{format_remaining, CountdownState, CountdownStatus, RelockMode};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const NOTIFICATION_ID: &str = "unlockTimer";
const NOTIFICATION_TITLE: &str = "Time's up!";
const NOTIFICATION_BODY: &str = "Get off the toilet";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountdownSnapshot {
    pub state: CountdownState,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountdownEvent {
    Tick { remaining_secs: u64 },
    /// The shield is back; carries what was re-applied.
    Relocked(RestrictionSet),
    /// Leave the timer screen.
    Finished,
}

/// The visible unlock countdown. Purely feedback on the monitored path; on
/// the fallback path its zero-crossing is also a re-lock trigger.
#[derive(Clone)]
pub struct CountdownController {
    state: Arc<Mutex<CountdownState>>,
    scheduler: UnlockScheduler,
    enforcer: Enforcer,
    store: RestrictionStore,
    db: Database,
    notifier: Arc<dyn Notifier>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    log_every_ticks: u64,
    events: broadcast::Sender<CountdownEvent>,
}

impl CountdownController {
    pub fn new(
        scheduler: UnlockScheduler,
        enforcer: Enforcer,
        store: RestrictionStore,
        db: Database,
        notifier: Arc<dyn Notifier>,
        debug: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(CountdownState::new())),
            scheduler,
            enforcer,
            store,
            db,
            notifier,
            ticker: Arc::new(Mutex::new(None)),
            tick_interval: Duration::from_secs(1),
            log_every_ticks: if debug { 1 } else { 30 },
            events,
        }
    }

    /// Shorter ticks for tests and demos; the counter still moves one second
    /// per tick.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CountdownEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> CountdownSnapshot {
        let state = self.state.lock().await.clone();
        CountdownSnapshot {
            display: format_remaining(state.remaining_secs),
            state,
        }
    }

    pub async fn start(&self, duration_minutes: u32) -> Result<UnlockTicket> {
        self.start_for(Duration::from_secs(u64::from(duration_minutes) * 60))
            .await
    }

    /// Grant the unlock and start counting down from `duration`.
    pub async fn start_for(&self, duration: Duration) -> Result<UnlockTicket> {
        self.cancel_ticker().await;

        let ticket = self.scheduler.start_for(duration).await?;
        let relock = match ticket.path {
            UnlockPath::Monitored => RelockMode::Monitored,
            UnlockPath::Fallback(_) => RelockMode::InProcess,
        };
        let total_secs = remaining_secs(ticket.window.ends_at, ticket.window.starts_at);

        self.state.lock().await.begin(
            total_secs,
            relock,
            ticket.window.starts_at,
            ticket.window.ends_at,
        );
        log_info!(
            "Countdown started: {} ({:?})",
            format_remaining(total_secs),
            relock
        );

        self.schedule_notification(total_secs);
        let _ = self.events.send(CountdownEvent::Tick {
            remaining_secs: total_secs,
        });
        self.spawn_ticker().await;

        Ok(ticket)
    }

    /// Bring the counter back in line with the persisted end time, e.g. after
    /// the app returns from the background or is relaunched. A window
    /// granted on the fallback path gets its re-lock timer back.
    pub async fn resume(&self) -> Result<CountdownSnapshot> {
        let relock = self.scheduler.rearm().await?;
        let now = Utc::now();
        let ends_at = self.db.unlock_end_time(&ActivityName::unlock()).await?;

        match ends_at.filter(|end| *end > now) {
            Some(end) => {
                let remaining = remaining_secs(end, now);
                let was_running = {
                    let mut state = self.state.lock().await;
                    let was_running = state.is_running();
                    if !was_running {
                        state.begin(remaining, relock.unwrap_or_default(), now, end);
                    }
                    state.resync(end, remaining);
                    was_running
                };
                log_info!("Countdown resumed with {}", format_remaining(remaining));

                self.schedule_notification(remaining);
                if !was_running || !self.ticker_alive().await {
                    self.spawn_ticker().await;
                }
                let _ = self.events.send(CountdownEvent::Tick {
                    remaining_secs: remaining,
                });
            }
            None => {
                let was_running = self.state.lock().await.is_running();
                if was_running {
                    log_info!("Unlock window ended while away");
                    self.finish().await;
                }
            }
        }

        Ok(self.snapshot().await)
    }

    /// Leave the timer screen: stop counting and drop the pending
    /// notification. Enforcement is untouched.
    pub async fn teardown(&self) {
        self.cancel_ticker().await;
        self.notifier.cancel(NOTIFICATION_ID);
        self.state.lock().await.reset();
        log_info!("Countdown torn down");
    }

    /// The user gave up the rest of the window.
    pub async fn end_early(&self) -> Result<RestrictionSet> {
        self.cancel_ticker().await;
        self.notifier.cancel(NOTIFICATION_ID);
        let set = self.scheduler.cancel().await?;
        self.state.lock().await.finish();
        let _ = self.events.send(CountdownEvent::Relocked(set.clone()));
        let _ = self.events.send(CountdownEvent::Finished);
        Ok(set)
    }

    async fn finish(&self) {
        self.cancel_ticker().await;
        self.state.lock().await.finish();
        let _ = self.events.send(CountdownEvent::Finished);
    }

    fn schedule_notification(&self, after_secs: u64) {
        let request = NotificationRequest {
            id: NOTIFICATION_ID.to_string(),
            title: NOTIFICATION_TITLE.to_string(),
            body: NOTIFICATION_BODY.to_string(),
            fire_after: Duration::from_secs(after_secs),
        };

        let allowed = match self.notifier.authorization() {
            NotificationAuthorization::Authorized => true,
            NotificationAuthorization::NotDetermined => self.notifier.request_authorization(),
            NotificationAuthorization::Denied => false,
        };
        if !allowed {
            log_info!("Notifications not permitted; countdown runs without one");
            return;
        }
        if let Err(err) = self.notifier.schedule(request) {
            log_warn!("Failed to schedule countdown notification: {err:#}");
        }
    }

    async fn ticker_alive(&self) -> bool {
        self.ticker
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let events = self.events.clone();
        let enforcer = self.enforcer.clone();
        let store = self.store.clone();
        let tick_interval = self.tick_interval;
        let log_every = self.log_every_ticks;
        let mut scheduler_events = self.scheduler.subscribe();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick_interval, tick_interval);
            let mut ticks: u64 = 0;
            let mut scheduler_open = true;

            let relocked = loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let (remaining, relock) = {
                            let mut guard = state.lock().await;
                            if !guard.is_running() {
                                return;
                            }
                            (guard.tick(), guard.relock)
                        };
                        let _ = events.send(CountdownEvent::Tick { remaining_secs: remaining });

                        ticks = ticks.wrapping_add(1);
                        if ticks % log_every == 0 {
                            log_debug!("Countdown {}", format_remaining(remaining));
                        }

                        if remaining == 0 {
                            match relock {
                                RelockMode::Monitored => break None,
                                RelockMode::InProcess => match enforcer.reapply_saved(&store).await {
                                    Ok(set) => break Some(set),
                                    Err(err) => {
                                        log_error!("Countdown re-lock failed: {err:#}");
                                        break None;
                                    }
                                },
                            }
                        }
                    }
                    event = scheduler_events.recv(), if scheduler_open => match event {
                        Ok(SchedulerEvent::FallbackFired { relocked }) => break Some(relocked),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => {
                            log_warn!("Scheduler events closed; countdown continues on its own");
                            scheduler_open = false;
                        }
                    }
                }
            };

            state.lock().await.finish();
            if let Some(set) = relocked {
                log_info!(
                    "Countdown re-locked {} apps, {} categories",
                    set.applications.len(),
                    set.categories.len()
                );
                let _ = events.send(CountdownEvent::Relocked(set));
            }
            log_info!("Countdown finished");
            let _ = events.send(CountdownEvent::Finished);
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}

impl CountdownSnapshot {
    pub fn is_finished(&self) -> bool {
        self.state.status == CountdownStatus::Finished
    }
}
