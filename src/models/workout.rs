//! Persisted workout history models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SetKind, SetRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSetRecord {
    pub ordinal: u32,
    pub kind: SetKind,
    pub segment_ms: u64,
    pub cumulative_ms: u64,
    pub representative_bpm: Option<u16>,
    pub associated_work_ordinal: Option<u32>,
    pub avg_bpm: Option<u16>,
    pub max_bpm: Option<u16>,
    pub min_bpm: Option<u16>,
}

impl From<&SetRecord> for StoredSetRecord {
    fn from(record: &SetRecord) -> Self {
        Self {
            ordinal: record.ordinal,
            kind: record.kind,
            segment_ms: record.segment_duration.as_millis() as u64,
            cumulative_ms: record.cumulative_duration.as_millis() as u64,
            representative_bpm: record.representative_bpm(),
            associated_work_ordinal: record.associated_work_ordinal,
            avg_bpm: record.stats.avg,
            max_bpm: record.stats.max,
            min_bpm: record.stats.min,
        }
    }
}

/// Completed workout as written to the history store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub preset_name: Option<String>,
    pub total_elapsed_ms: u64,
    pub heart_rate_recovery: Option<i32>,
    pub avg_bpm: Option<u16>,
    pub max_bpm: Option<u16>,
    pub min_bpm: Option<u16>,
    pub rmssd_ms: Option<f64>,
    pub records: Vec<StoredSetRecord>,
}
