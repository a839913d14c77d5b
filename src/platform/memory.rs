//! In-process platform doubles. Each records what it was asked to do.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};

use crate::error::ScheduleError;
use crate::models::{ActivityName, ApplicationToken, CategoryToken, DeviceActivitySchedule};

use super::{
    MonitorCenter, NotificationAuthorization, NotificationRequest, Notifier, ShieldConfig,
    ShieldSettings,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Default)]
pub struct MemoryShield {
    config: Arc<Mutex<ShieldConfig>>,
    writes: Arc<Mutex<usize>>,
    failing_writes: Arc<Mutex<usize>>,
}

impl MemoryShield {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ShieldConfig {
        lock(&self.config).clone()
    }

    pub fn write_count(&self) -> usize {
        *lock(&self.writes)
    }

    /// Refuse the next `count` writes, as a busy settings store would.
    pub fn fail_next_writes(&self, count: usize) {
        *lock(&self.failing_writes) = count;
    }

    fn refuse_write(&self) -> Result<()> {
        let mut failing = lock(&self.failing_writes);
        if *failing > 0 {
            *failing -= 1;
            bail!("shield store busy");
        }
        Ok(())
    }
}

impl ShieldSettings for MemoryShield {
    fn set_applications(&self, applications: Option<BTreeSet<ApplicationToken>>) -> Result<()> {
        self.refuse_write()?;
        lock(&self.config).applications = applications;
        *lock(&self.writes) += 1;
        Ok(())
    }

    fn set_categories(&self, categories: Option<BTreeSet<CategoryToken>>) -> Result<()> {
        self.refuse_write()?;
        lock(&self.config).categories = categories;
        *lock(&self.writes) += 1;
        Ok(())
    }

    fn current(&self) -> Result<ShieldConfig> {
        Ok(self.snapshot())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCall {
    Start(ActivityName, DeviceActivitySchedule),
    Stop(Vec<ActivityName>),
}

/// Monitor center that keeps registrations in memory and can be told to
/// refuse the next registrations.
#[derive(Clone, Default)]
pub struct MemoryMonitorCenter {
    registrations: Arc<Mutex<Vec<(ActivityName, DeviceActivitySchedule)>>>,
    calls: Arc<Mutex<Vec<MonitorCall>>>,
    failure: Arc<Mutex<Option<ScheduleError>>>,
}

impl MemoryMonitorCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(error: ScheduleError) -> Self {
        let center = Self::default();
        center.fail_with(Some(error));
        center
    }

    pub fn fail_with(&self, error: Option<ScheduleError>) {
        *lock(&self.failure) = error;
    }

    pub fn calls(&self) -> Vec<MonitorCall> {
        lock(&self.calls).clone()
    }

    pub fn registrations(&self) -> Vec<(ActivityName, DeviceActivitySchedule)> {
        lock(&self.registrations).clone()
    }
}

impl MonitorCenter for MemoryMonitorCenter {
    fn start_monitoring(
        &self,
        activity: &ActivityName,
        schedule: &DeviceActivitySchedule,
    ) -> Result<(), ScheduleError> {
        lock(&self.calls).push(MonitorCall::Start(activity.clone(), schedule.clone()));
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        lock(&self.registrations).push((activity.clone(), schedule.clone()));
        Ok(())
    }

    fn stop_monitoring(&self, activities: &[ActivityName]) {
        lock(&self.calls).push(MonitorCall::Stop(activities.to_vec()));
        lock(&self.registrations).retain(|(name, _)| !activities.contains(name));
    }

    fn activities(&self) -> Result<Vec<ActivityName>> {
        Ok(lock(&self.registrations)
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Notifier that only records requests.
#[derive(Clone)]
pub struct RecordingNotifier {
    authorization: Arc<Mutex<NotificationAuthorization>>,
    grant_on_request: bool,
    pending: Arc<Mutex<HashMap<String, NotificationRequest>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new(authorization: NotificationAuthorization, grant_on_request: bool) -> Self {
        Self {
            authorization: Arc::new(Mutex::new(authorization)),
            grant_on_request,
            pending: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn authorized() -> Self {
        Self::new(NotificationAuthorization::Authorized, true)
    }

    pub fn pending(&self) -> Vec<NotificationRequest> {
        lock(&self.pending).values().cloned().collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn authorization(&self) -> NotificationAuthorization {
        *lock(&self.authorization)
    }

    fn request_authorization(&self) -> bool {
        let granted = self.grant_on_request;
        *lock(&self.authorization) = if granted {
            NotificationAuthorization::Authorized
        } else {
            NotificationAuthorization::Denied
        };
        granted
    }

    fn schedule(&self, request: NotificationRequest) -> Result<()> {
        lock(&self.pending).insert(request.id.clone(), request);
        Ok(())
    }

    fn cancel(&self, id: &str) {
        lock(&self.pending).remove(id);
        lock(&self.cancelled).push(id.to_string());
    }
}
