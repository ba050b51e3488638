use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::telemetry::SegmentStats;

use super::Reading;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SetKind {
    Work,
    Rest,
    Cooldown,
}

impl SetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetKind::Work => "Work",
            SetKind::Rest => "Rest",
            SetKind::Cooldown => "Cooldown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Work" => Some(SetKind::Work),
            "Rest" => Some(SetKind::Rest),
            "Cooldown" => Some(SetKind::Cooldown),
            _ => None,
        }
    }
}

/// A finalized segment of a workout. Records are never mutated once pushed
/// onto a session's record list.
#[derive(Debug, Clone, PartialEq)]
pub struct SetRecord {
    pub ordinal: u32,
    pub kind: SetKind,
    pub segment_duration: Duration,
    /// Session elapsed time at the moment this segment closed.
    pub cumulative_duration: Duration,
    pub representative_reading: Option<Reading>,
    /// For rest records, the work set this rest followed.
    pub associated_work_ordinal: Option<u32>,
    pub stats: SegmentStats,
}

impl SetRecord {
    /// Display label: `3` for work, `3R` for the rest after work set 3,
    /// `C1` for the first cooldown checkpoint.
    pub fn label(&self) -> String {
        match self.kind {
            SetKind::Work => self.ordinal.to_string(),
            SetKind::Rest => format!(
                "{}R",
                self.associated_work_ordinal.unwrap_or(self.ordinal)
            ),
            SetKind::Cooldown => format!("C{}", self.ordinal),
        }
    }

    pub fn representative_bpm(&self) -> Option<u16> {
        self.representative_reading.map(|reading| reading.value)
    }
}
