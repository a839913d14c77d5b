use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::platform::MonitorLimits;
use crate::unlock::SchedulerTimings;

pub const CONFIG_FILE: &str = "config.json";
pub const DATA_DIR_ENV: &str = "TOILETIME_DATA_DIR";
pub const DEBUG_ENV: &str = "TOILETIME_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Names the shared store; the app and its monitor must agree on it.
    pub app_group_id: String,
    pub settle_delay_ms: u64,
    pub warning_lead_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub max_activities: usize,
    pub dispatch_poll_ms: u64,
    pub classification_timeout_secs: u64,
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(skip)]
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_group_id: "group.com.kobemax.ToileTimeAI".into(),
            settle_delay_ms: 500,
            warning_lead_secs: 30,
            min_interval_secs: 0,
            max_interval_secs: 7 * 24 * 60 * 60,
            max_activities: 20,
            dispatch_poll_ms: 1000,
            classification_timeout_secs: 30,
            data_dir: PathBuf::from("."),
            debug: false,
        }
    }
}

impl AppConfig {
    /// Resolve the data directory, read `config.json` from it and apply the
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let data_dir = match env::var_os(DATA_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };
        let mut config = Self::load_from(&data_dir)?;
        config.debug = env::var(DEBUG_ENV)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(config)
    }

    /// Read `config.json` under `data_dir`. Missing fields take their
    /// defaults; an unreadable file is reported and ignored.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed {}: {err}", path.display());
                Self::default()
            })
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.data_dir.join(CONFIG_FILE);
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(&path, serialized)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite3", self.app_group_id))
    }

    pub fn scheduler_timings(&self) -> SchedulerTimings {
        SchedulerTimings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            warning_lead: Duration::from_secs(self.warning_lead_secs),
        }
    }

    pub fn monitor_limits(&self) -> MonitorLimits {
        MonitorLimits {
            min_interval: Duration::from_secs(self.min_interval_secs),
            max_interval: Duration::from_secs(self.max_interval_secs),
            max_activities: self.max_activities,
        }
    }

    pub fn dispatch_poll(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_ms.max(10))
    }

    pub fn classification_timeout(&self) -> Duration {
        Duration::from_secs(self.classification_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toiletime")
}
