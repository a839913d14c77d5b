//! Seams to the host platform.
//!
//! The core never talks to an OS facility directly; it goes through these
//! traits. `shared` implements them on top of the shared store so two
//! processes can play app and monitor extension; `memory` keeps everything in
//! process for tests and embedders. The crate-level `ffi` module wraps them
//! to forward to a native host.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
use crate::models::{ActivityName, ApplicationToken, CategoryToken, DeviceActivitySchedule};

pub mod memory;
pub mod notifications;
pub mod shared;

pub use notifications::TokioNotifier;
pub use shared::{MonitorLimits, SharedMonitorCenter, SharedShield};

/// Run a synchronous platform call on tokio's blocking pool.
pub(crate) async fn off_runtime<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .context("platform call did not complete")?
}

/// What the shield currently blocks. `None` means no restriction for that kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldConfig {
    pub applications: Option<BTreeSet<ApplicationToken>>,
    pub categories: Option<BTreeSet<CategoryToken>>,
}

impl ShieldConfig {
    pub fn is_clear(&self) -> bool {
        self.applications.is_none() && self.categories.is_none()
    }
}

/// Write side of the platform shield. Writes are last-write-wins.
pub trait ShieldSettings: Send + Sync {
    fn set_applications(&self, applications: Option<BTreeSet<ApplicationToken>>) -> Result<()>;

    /// `Some` blocks exactly these categories, `None` blocks none.
    fn set_categories(&self, categories: Option<BTreeSet<CategoryToken>>) -> Result<()>;

    fn current(&self) -> Result<ShieldConfig>;
}

/// Interval monitor registration. Callbacks are delivered elsewhere, in an
/// execution context that does not share memory with the registering process.
pub trait MonitorCenter: Send + Sync {
    fn start_monitoring(
        &self,
        activity: &ActivityName,
        schedule: &DeviceActivitySchedule,
    ) -> Result<(), ScheduleError>;

    /// Removes every registration under the given names. Never fails; the
    /// platform call has no error path.
    fn stop_monitoring(&self, activities: &[ActivityName]);

    fn activities(&self) -> Result<Vec<ActivityName>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationAuthorization {
    NotDetermined,
    Denied,
    Authorized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub id: String,
    pub title: String,
    pub body: String,
    pub fire_after: Duration,
}

/// Local user notifications.
pub trait Notifier: Send + Sync {
    fn authorization(&self) -> NotificationAuthorization;

    /// Ask the user; returns whether notifications are now allowed.
    fn request_authorization(&self) -> bool;

    /// Replaces any pending request with the same id.
    fn schedule(&self, request: NotificationRequest) -> Result<()>;

    fn cancel(&self, id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    NotDetermined,
    Denied,
    Approved,
}

/// Screen-time authorization for the individual user.
pub trait AuthorizationCenter: Send + Sync {
    fn status(&self) -> AuthorizationStatus;

    /// Prompt for authorization. `Err` when the user refuses.
    fn request(&self) -> Result<()>;
}

/// Authorization answered from a fixed status. Hosts without a permission
/// model run with `Approved`.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuthorization(pub AuthorizationStatus);

impl AuthorizationCenter for StaticAuthorization {
    fn status(&self) -> AuthorizationStatus {
        self.0
    }

    fn request(&self) -> Result<()> {
        match self.0 {
            AuthorizationStatus::Denied => anyhow::bail!("screen time access denied"),
            AuthorizationStatus::Approved | AuthorizationStatus::NotDetermined => Ok(()),
        }
    }
}
