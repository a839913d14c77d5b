use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

pub const UNLOCK_ACTIVITY: &str = "unlock";
pub const DEFAULT_WARNING_LEAD: Duration = Duration::from_secs(30);

/// Identifier correlating a registered interval with its callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityName(String);

impl ActivityName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn unlock() -> Self {
        Self(UNLOCK_ACTIVITY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unlock(&self) -> bool {
        self.0 == UNLOCK_ACTIVITY
    }
}

impl fmt::Display for ActivityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which mechanism re-locks when a window runs out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RelockMode {
    /// The interval monitor re-locks from its end callback.
    #[default]
    Monitored,
    /// A timer inside the process that granted the window re-locks.
    InProcess,
}

/// One granted unlock. Only `ends_at` and its relock mode are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockWindow {
    pub activity: ActivityName,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub warning_lead: Duration,
}

impl UnlockWindow {
    pub fn starting_at(
        activity: ActivityName,
        starts_at: DateTime<Utc>,
        duration: Duration,
        warning_lead: Duration,
    ) -> Result<Self> {
        let span = chrono::Duration::from_std(duration)
            .map_err(|_| anyhow!("unlock duration {duration:?} is out of range"))?;
        let ends_at = starts_at
            .checked_add_signed(span)
            .ok_or_else(|| anyhow!("unlock end overflows the calendar"))?;
        Ok(Self {
            activity,
            starts_at,
            ends_at,
            warning_lead,
        })
    }

    pub fn duration(&self) -> Duration {
        (self.ends_at - self.starts_at).to_std().unwrap_or_default()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    pub fn remaining_secs_at(&self, now: DateTime<Utc>) -> u64 {
        remaining_secs(self.ends_at, now)
    }
}

/// Whole seconds left until `ends_at`, rounded up so a countdown never shows
/// zero while the window is still open.
pub fn remaining_secs(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (ends_at - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis as u64).div_ceil(1000)
    }
}

/// Hour/minute/second components, the only precision the monitor schedule takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub fn of<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            hour: at.hour(),
            minute: at.minute(),
            second: at.second(),
        }
    }

    fn to_naive(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

/// A monitoring schedule as the platform accepts it: wall-clock components,
/// a repeat flag and a warning lead before the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActivitySchedule {
    pub interval_start: TimeOfDay,
    pub interval_end: TimeOfDay,
    pub repeats: bool,
    pub warning_time: Duration,
}

/// A schedule pinned to absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInterval {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub warning_at: Option<DateTime<Utc>>,
}

impl ResolvedInterval {
    pub fn length(&self) -> Duration {
        (self.ends_at - self.starts_at).to_std().unwrap_or_default()
    }
}

impl DeviceActivitySchedule {
    /// Non-repeating schedule covering `window` in the device's local time.
    pub fn for_window(window: &UnlockWindow) -> Self {
        Self::for_window_in(window, &Local)
    }

    /// Whether this schedule ends when `window` does. Wall-clock components
    /// wrap at midnight, so a window of a day or more cannot be expressed.
    pub fn spans(&self, window: &UnlockWindow) -> bool {
        self.spans_in(window, &Local)
    }

    pub fn spans_in<Tz: TimeZone>(&self, window: &UnlockWindow, tz: &Tz) -> bool {
        match self.resolve(&window.starts_at.with_timezone(tz)) {
            Ok(resolved) => (resolved.ends_at - window.ends_at).num_milliseconds().abs() < 1000,
            Err(_) => false,
        }
    }

    pub fn for_window_in<Tz: TimeZone>(window: &UnlockWindow, tz: &Tz) -> Self {
        Self {
            interval_start: TimeOfDay::of(&window.starts_at.with_timezone(tz)),
            interval_end: TimeOfDay::of(&window.ends_at.with_timezone(tz)),
            repeats: false,
            warning_time: window.warning_lead,
        }
    }

    /// Pin the components to instants around `reference`.
    ///
    /// The start is the occurrence closest to `reference` (registration can
    /// land a moment after midnight rolled over); the end is the first
    /// occurrence after the start, so windows may cross midnight.
    pub fn resolve<Tz: TimeZone>(
        &self,
        reference: &DateTime<Tz>,
    ) -> Result<ResolvedInterval, ScheduleError> {
        let tz = reference.timezone();
        let start_time = self.interval_start.to_naive().ok_or_else(|| {
            ScheduleError::InvalidDateComponents(format!("start {}", self.interval_start))
        })?;
        let end_time = self.interval_end.to_naive().ok_or_else(|| {
            ScheduleError::InvalidDateComponents(format!("end {}", self.interval_end))
        })?;

        let reference_date = reference.date_naive();
        let mut start: Option<(i64, DateTime<Tz>)> = None;
        for offset in [-1i64, 0, 1] {
            let date = reference_date + chrono::Duration::days(offset);
            let Some(candidate) = tz.from_local_datetime(&date.and_time(start_time)).earliest()
            else {
                continue;
            };
            let distance = candidate
                .clone()
                .signed_duration_since(reference.clone())
                .num_milliseconds()
                .abs();
            if start.as_ref().map(|(best, _)| distance < *best).unwrap_or(true) {
                start = Some((distance, candidate));
            }
        }
        let (_, start) = start.ok_or_else(|| {
            ScheduleError::InvalidDateComponents(format!("start {}", self.interval_start))
        })?;

        let mut end_date = start.date_naive();
        let mut end = None;
        for _ in 0..3 {
            if let Some(candidate) = tz.from_local_datetime(&end_date.and_time(end_time)).earliest()
            {
                if candidate > start {
                    end = Some(candidate);
                    break;
                }
            }
            end_date = match end_date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        let end = end.ok_or_else(|| {
            ScheduleError::InvalidDateComponents(format!("end {}", self.interval_end))
        })?;

        let starts_at = start.with_timezone(&Utc);
        let ends_at = end.with_timezone(&Utc);
        let warning_at = chrono::Duration::from_std(self.warning_time)
            .ok()
            .filter(|lead| *lead > chrono::Duration::zero())
            .map(|lead| ends_at - lead);

        Ok(ResolvedInterval {
            starts_at,
            ends_at,
            warning_at,
        })
    }
}
