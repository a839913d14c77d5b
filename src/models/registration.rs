use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityName, DeviceActivitySchedule};

/// A stored interval registration, as the monitor process sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRegistration {
    pub id: String,
    pub activity: ActivityName,
    pub schedule: DeviceActivitySchedule,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub warning_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub start_delivered_at: Option<DateTime<Utc>>,
    pub warning_delivered_at: Option<DateTime<Utc>>,
    pub end_delivered_at: Option<DateTime<Utc>>,
}

impl MonitorRegistration {
    pub fn start_due(&self, now: DateTime<Utc>) -> bool {
        self.start_delivered_at.is_none() && now >= self.interval_start
    }

    pub fn warning_due(&self, now: DateTime<Utc>) -> bool {
        self.warning_delivered_at.is_none()
            && self.warning_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn end_due(&self, now: DateTime<Utc>) -> bool {
        self.end_delivered_at.is_none() && now >= self.interval_end
    }
}

/// The three callbacks the interval monitor delivers for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MonitorEvent {
    IntervalDidStart,
    IntervalWillEndWarning,
    IntervalDidEnd,
}

impl MonitorEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorEvent::IntervalDidStart => "start",
            MonitorEvent::IntervalWillEndWarning => "warning",
            MonitorEvent::IntervalDidEnd => "end",
        }
    }
}

impl std::str::FromStr for MonitorEvent {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "start" | "intervaldidstart" => Ok(MonitorEvent::IntervalDidStart),
            "warning" | "intervalwillendwarning" => Ok(MonitorEvent::IntervalWillEndWarning),
            "end" | "intervaldidend" => Ok(MonitorEvent::IntervalDidEnd),
            other => Err(anyhow::anyhow!("unknown monitor event '{other}'")),
        }
    }
}

impl std::fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
