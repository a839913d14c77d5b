use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::models::RelockMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CountdownStatus {
    #[default]
    Idle,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountdownState {
    pub status: CountdownStatus,
    pub relock: RelockMode,
    pub total_secs: u64,
    /// Local counter, decremented once per tick. `resume` resyncs it from the
    /// persisted end time.
    pub remaining_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl CountdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == CountdownStatus::Running
    }

    pub fn begin(
        &mut self,
        total_secs: u64,
        relock: RelockMode,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) {
        *self = Self {
            status: CountdownStatus::Running,
            relock,
            total_secs,
            remaining_secs: total_secs,
            started_at: Some(started_at),
            ends_at: Some(ends_at),
        };
    }

    /// One second passed. Returns what is left.
    pub fn tick(&mut self) -> u64 {
        if self.is_running() {
            self.remaining_secs = self.remaining_secs.saturating_sub(1);
        }
        self.remaining_secs
    }

    pub fn resync(&mut self, ends_at: DateTime<Utc>, remaining_secs: u64) {
        self.ends_at = Some(ends_at);
        self.remaining_secs = remaining_secs;
    }

    pub fn finish(&mut self) {
        self.status = CountdownStatus::Finished;
        self.remaining_secs = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `MM:SS`, minutes uncapped.
pub fn format_remaining(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_remaining(0), "00:00");
        assert_eq!(format_remaining(65), "01:05");
        assert_eq!(format_remaining(300), "05:00");
        assert_eq!(format_remaining(6000), "100:00");
    }

    #[test]
    fn tick_stops_at_zero() {
        let mut state = CountdownState::new();
        let now = Utc::now();
        state.begin(2, RelockMode::Monitored, now, now + chrono::Duration::seconds(2));
        assert_eq!(state.tick(), 1);
        assert_eq!(state.tick(), 0);
        assert_eq!(state.tick(), 0);
    }

    #[test]
    fn idle_state_does_not_count() {
        let mut state = CountdownState::new();
        state.remaining_secs = 5;
        assert_eq!(state.tick(), 5);
    }
}
