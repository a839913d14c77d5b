use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::{ActivityName, MonitorEvent, MonitorRegistration};

use super::monitor::{MonitorAction, MonitorHandler};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// `None` for an end delivered without a registration, see
    /// [`MonitorDispatcher::dispatch_due`].
    pub registration_id: Option<String>,
    pub activity: ActivityName,
    pub event: MonitorEvent,
    pub action: MonitorAction,
}

/// Plays the platform's part in the monitor process: watches stored
/// registrations and hands each callback to the handler once it is due.
#[derive(Clone)]
pub struct MonitorDispatcher {
    db: Database,
    handler: MonitorHandler,
    poll_interval: Duration,
}

impl MonitorDispatcher {
    pub fn new(db: Database, handler: MonitorHandler, poll_interval: Duration) -> Self {
        Self {
            db,
            handler,
            poll_interval,
        }
    }

    /// Deliver every callback due at `now`, in start, warning, end order per
    /// registration. A registration is removed once its end was delivered.
    ///
    /// A failed callback is handed out again on the next pass; the other
    /// registrations are still served. An unlock whose end has passed with no
    /// registration left to end it is re-locked as if its end had arrived.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<Vec<Delivery>> {
        let mut delivered = Vec::new();
        for registration in self.db.list_registrations().await? {
            match self.deliver(&registration, now, &mut delivered).await {
                Ok(true) => {
                    self.db.delete_registration(&registration.id).await?;
                    log_info!("Registration {} finished", registration.id);
                }
                Ok(false) => {}
                Err(err) => log_error!(
                    "Callback for registration {} failed, retrying next pass: {err:#}",
                    registration.id
                ),
            }
        }

        self.relock_unguarded(now, &mut delivered).await?;
        Ok(delivered)
    }

    /// Returns whether this pass delivered the registration's end.
    async fn deliver(
        &self,
        registration: &MonitorRegistration,
        now: DateTime<Utc>,
        delivered: &mut Vec<Delivery>,
    ) -> Result<bool> {
        let mut ended = false;
        for event in due_events(registration, now) {
            // Another dispatcher may have taken it between list and claim.
            if !self.db.claim_delivery(&registration.id, event, now).await? {
                continue;
            }
            let action = match self.handler.handle(event, &registration.activity).await {
                Ok(action) => action,
                Err(err) => {
                    if let Err(release) = self.db.release_delivery(&registration.id, event).await {
                        log_error!("Failed to release {event} for {}: {release:#}", registration.id);
                    }
                    return Err(err.context(format!("{event} callback failed")));
                }
            };
            ended |= event == MonitorEvent::IntervalDidEnd;
            delivered.push(Delivery {
                registration_id: Some(registration.id.clone()),
                activity: registration.activity.clone(),
                event,
                action,
            });
        }
        Ok(ended)
    }

    /// The process that granted a fallback window may have exited before its
    /// timer fired. Once the persisted end has passed and no registration is
    /// still due to end the window, the monitor re-locks it.
    async fn relock_unguarded(&self, now: DateTime<Utc>, delivered: &mut Vec<Delivery>) -> Result<()> {
        let unlock = ActivityName::unlock();
        let already_ended = delivered
            .iter()
            .any(|d| d.activity == unlock && d.event == MonitorEvent::IntervalDidEnd);
        if already_ended {
            return Ok(());
        }

        let Some(ends_at) = self.db.unlock_end_time(&unlock).await? else {
            return Ok(());
        };
        if ends_at > now {
            return Ok(());
        }
        let pending = self
            .db
            .list_registrations()
            .await?
            .iter()
            .any(|r| r.activity == unlock && r.end_delivered_at.is_none());
        if pending {
            return Ok(());
        }

        log_warn!("Unlock ended at {ends_at} with no registration; re-locking");
        let action = self
            .handler
            .handle(MonitorEvent::IntervalDidEnd, &unlock)
            .await?;
        delivered.push(Delivery {
            registration_id: None,
            activity: unlock,
            event: MonitorEvent::IntervalDidEnd,
            action,
        });
        Ok(())
    }

    pub async fn run(&self, cancel: CancellationToken) {
        log_info!(
            "Monitor dispatcher polling every {}ms",
            self.poll_interval.as_millis()
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log_info!("Monitor dispatcher stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.dispatch_due(Utc::now()).await {
                        Ok(deliveries) => {
                            for delivery in deliveries {
                                log_info!(
                                    "Delivered {} for {} ({:?}): {:?}",
                                    delivery.event,
                                    delivery.activity,
                                    delivery.registration_id,
                                    delivery.action
                                );
                            }
                        }
                        Err(err) => log_error!("Monitor dispatch failed: {err:#}"),
                    }
                }
            }
        }
    }
}

fn due_events(registration: &MonitorRegistration, now: DateTime<Utc>) -> Vec<MonitorEvent> {
    let mut events = Vec::with_capacity(3);
    if registration.start_due(now) {
        events.push(MonitorEvent::IntervalDidStart);
    }
    if registration.warning_due(now) {
        events.push(MonitorEvent::IntervalWillEndWarning);
    }
    if registration.end_due(now) {
        events.push(MonitorEvent::IntervalDidEnd);
    }
    events
}
