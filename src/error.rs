//! Domain errors the caller branches on.
//!
//! Storage and I/O failures travel as `anyhow::Error`; the enums here are the
//! outcomes a UI has to react to differently (fall back, show an alert, retry).

use std::time::Duration;

use thiserror::Error;

/// Why the interval monitor refused a registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval of {actual:?} is shorter than the minimum of {minimum:?}")]
    IntervalTooShort { actual: Duration, minimum: Duration },

    #[error("interval of {actual:?} is longer than the maximum of {maximum:?}")]
    IntervalTooLong { actual: Duration, maximum: Duration },

    #[error("too many monitored activities (limit {limit})")]
    ExcessiveActivities { limit: usize },

    #[error("warning time of {warning:?} does not fit inside an interval of {interval:?}")]
    WarningExceedsInterval { warning: Duration, interval: Duration },

    #[error("an unlock of {0:?} does not fit one day of schedule components")]
    WindowTooLong(Duration),

    #[error("schedule components do not resolve to a local time: {0}")]
    InvalidDateComponents(String),

    #[error("monitor registration could not be stored: {0}")]
    Unavailable(String),
}

/// Reasons an unlock request is refused before anything is scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnlockRequestError {
    #[error("Screen Time authorization is required to control app access. Please enable it in Settings.")]
    AuthorizationDenied,

    #[error("Please select apps to control before starting a timer.")]
    NoSelection,

    #[error("unlock duration must be at least one minute and under a day")]
    InvalidDuration,

    #[error("That doesn't look like a toilet. Try again.")]
    NotAToilet,
}

#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("classification did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("classification request failed: {0}")]
    Failed(#[source] anyhow::Error),
}
