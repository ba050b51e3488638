use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{parse_datetime, parse_set_kind, to_i64, to_u64},
    },
    models::{StoredSetRecord, WorkoutSummary},
};

fn row_to_set(row: &Row) -> Result<StoredSetRecord> {
    let kind: String = row.get("kind")?;
    let segment_ms: i64 = row.get("segment_ms")?;
    let cumulative_ms: i64 = row.get("cumulative_ms")?;

    Ok(StoredSetRecord {
        ordinal: row.get("ordinal")?,
        kind: parse_set_kind(&kind)?,
        segment_ms: to_u64(segment_ms, "segment_ms")?,
        cumulative_ms: to_u64(cumulative_ms, "cumulative_ms")?,
        representative_bpm: row.get("representative_bpm")?,
        associated_work_ordinal: row.get("associated_work_ordinal")?,
        avg_bpm: row.get("avg_bpm")?,
        max_bpm: row.get("max_bpm")?,
        min_bpm: row.get("min_bpm")?,
    })
}

fn row_to_workout(row: &Row) -> Result<WorkoutSummary> {
    let started_at: String = row.get("started_at")?;
    let completed_at: String = row.get("completed_at")?;
    let total_elapsed_ms: i64 = row.get("total_elapsed_ms")?;

    Ok(WorkoutSummary {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        completed_at: parse_datetime(&completed_at, "completed_at")?,
        preset_name: row.get("preset_name")?,
        total_elapsed_ms: to_u64(total_elapsed_ms, "total_elapsed_ms")?,
        heart_rate_recovery: row.get("heart_rate_recovery")?,
        avg_bpm: row.get("avg_bpm")?,
        max_bpm: row.get("max_bpm")?,
        min_bpm: row.get("min_bpm")?,
        rmssd_ms: row.get("rmssd_ms")?,
        records: Vec::new(),
    })
}

impl Database {
    /// Writes a completed workout and its set records in one transaction.
    pub async fn insert_workout(&self, summary: &WorkoutSummary) -> Result<()> {
        let workout = summary.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO workouts (id, started_at, completed_at, preset_name, total_elapsed_ms, heart_rate_recovery, avg_bpm, max_bpm, min_bpm, rmssd_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    workout.id,
                    workout.started_at.to_rfc3339(),
                    workout.completed_at.to_rfc3339(),
                    workout.preset_name,
                    to_i64(workout.total_elapsed_ms)?,
                    workout.heart_rate_recovery,
                    workout.avg_bpm,
                    workout.max_bpm,
                    workout.min_bpm,
                    workout.rmssd_ms,
                ],
            )
            .context("failed to insert workout")?;

            for (position, set) in workout.records.iter().enumerate() {
                tx.execute(
                    "INSERT INTO workout_sets (workout_id, position, ordinal, kind, segment_ms, cumulative_ms, representative_bpm, associated_work_ordinal, avg_bpm, max_bpm, min_bpm)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        workout.id,
                        position as i64,
                        set.ordinal,
                        set.kind.as_str(),
                        to_i64(set.segment_ms)?,
                        to_i64(set.cumulative_ms)?,
                        set.representative_bpm,
                        set.associated_work_ordinal,
                        set.avg_bpm,
                        set.max_bpm,
                        set.min_bpm,
                    ],
                )
                .context("failed to insert workout set")?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Most recent workouts first, each with its set records.
    pub async fn list_workouts(&self, limit: usize) -> Result<Vec<WorkoutSummary>> {
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut workouts = {
                let mut stmt = conn.prepare(
                    "SELECT id, started_at, completed_at, preset_name, total_elapsed_ms, heart_rate_recovery, avg_bpm, max_bpm, min_bpm, rmssd_ms
                     FROM workouts
                     ORDER BY started_at DESC
                     LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut workouts = Vec::new();
                while let Some(row) = rows.next()? {
                    workouts.push(row_to_workout(row)?);
                }
                workouts
            };

            let mut stmt = conn.prepare(
                "SELECT ordinal, kind, segment_ms, cumulative_ms, representative_bpm, associated_work_ordinal, avg_bpm, max_bpm, min_bpm
                 FROM workout_sets
                 WHERE workout_id = ?1
                 ORDER BY position ASC",
            )?;
            for workout in workouts.iter_mut() {
                let mut rows = stmt.query(params![workout.id])?;
                while let Some(row) = rows.next()? {
                    workout.records.push(row_to_set(row)?);
                }
            }

            Ok(workouts)
        })
        .await
    }
}
