use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reusable interval-workout template. Loaded from the preset store and
/// treated as read-only by the session once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerPreset {
    pub id: Uuid,
    pub name: String,
    pub work_ms: u64,
    pub rest_ms: u64,
    pub set_count: u32,
    pub include_cooldown: bool,
    pub play_sound: bool,
}

impl TimerPreset {
    pub fn new(name: impl Into<String>, work: Duration, rest: Duration, set_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            work_ms: work.as_millis() as u64,
            rest_ms: rest.as_millis() as u64,
            set_count,
            include_cooldown: false,
            play_sound: true,
        }
    }

    pub fn with_cooldown(mut self, include_cooldown: bool) -> Self {
        self.include_cooldown = include_cooldown;
        self
    }

    pub fn with_sound(mut self, play_sound: bool) -> Self {
        self.play_sound = play_sound;
        self
    }

    pub fn work_duration(&self) -> Duration {
        Duration::from_millis(self.work_ms)
    }

    pub fn rest_duration(&self) -> Duration {
        Duration::from_millis(self.rest_ms)
    }

    /// Nominal length of the whole preset, excluding cooldown.
    pub fn nominal_total(&self) -> Duration {
        let sets = self.set_count as u64;
        let rests = sets.saturating_sub(1);
        Duration::from_millis(self.work_ms * sets + self.rest_ms * rests)
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_ms == 0 {
            bail!("preset '{}' must have a work duration greater than zero", self.name);
        }
        if self.set_count == 0 {
            bail!("preset '{}' must have at least one set", self.name);
        }
        Ok(())
    }
}
