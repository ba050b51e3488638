use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

use crate::sensor::protocol::DEFAULT_MONITOR_NAME_FRAGMENTS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
    pub sample_interval_ms: u64,
    pub cooldown_ms: u64,
    pub cooldown_checkpoint_ms: u64,
    /// Whether a 0 BPM reading may stand as a segment's representative
    /// reading. When false the representative is left empty instead.
    pub zero_counts_as_representative: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            sample_interval_ms: 1_000,
            cooldown_ms: 120_000,
            cooldown_checkpoint_ms: 60_000,
            zero_counts_as_representative: false,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn cooldown_checkpoint(&self) -> Duration {
        Duration::from_millis(self.cooldown_checkpoint_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub watchdog_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub zero_reading_threshold: u32,
    pub name_fragments: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: 20_000,
            reconnect_delay_ms: 2_000,
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 3,
            zero_reading_threshold: 5,
            name_fragments: DEFAULT_MONITOR_NAME_FRAGMENTS
                .iter()
                .map(|fragment| fragment.to_string())
                .collect(),
        }
    }
}

impl ConnectionConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub push_interval_ms: u64,
    pub pull_interval_ms: u64,
}

/// The relay accepts at most one push per second.
pub const MIN_PUSH_INTERVAL: Duration = Duration::from_secs(1);

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            push_interval_ms: 1_000,
            pull_interval_ms: 2_000,
        }
    }
}

impl RelayConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms).max(MIN_PUSH_INTERVAL)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub connection: ConnectionConfig,
    pub relay: RelayConfig,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AppConfig>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring unreadable settings at {}: {err}", path.display());
                AppConfig::default()
            })
        } else {
            AppConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn config(&self) -> AppConfig {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, apply: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
        self.persist(&guard)?;
        Ok(guard.clone())
    }

    pub fn reload(&self) -> Result<AppConfig> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: AppConfig = serde_json::from_str(&contents)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
        Ok(guard.clone())
    }

    fn persist(&self, data: &AppConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

/// `PULSETRACK_DEBUG=1` turns on per-tick logging.
pub fn debug_mode() -> bool {
    std::env::var("PULSETRACK_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
