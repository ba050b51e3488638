use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use crate::{
    db::{
        connection::Database,
        helpers::{parse_uuid, to_i64, to_u64},
    },
    models::TimerPreset,
};

fn row_to_preset(row: &Row) -> Result<TimerPreset> {
    let id: String = row.get("id")?;
    let work_ms: i64 = row.get("work_ms")?;
    let rest_ms: i64 = row.get("rest_ms")?;

    Ok(TimerPreset {
        id: parse_uuid(&id, "id")?,
        name: row.get("name")?,
        work_ms: to_u64(work_ms, "work_ms")?,
        rest_ms: to_u64(rest_ms, "rest_ms")?,
        set_count: row.get("set_count")?,
        include_cooldown: row.get("include_cooldown")?,
        play_sound: row.get("play_sound")?,
    })
}

impl Database {
    /// Inserts or replaces a preset. Invalid presets are rejected before
    /// reaching storage.
    pub async fn save_preset(&self, preset: &TimerPreset) -> Result<()> {
        preset.validate()?;
        let record = preset.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO presets (id, name, work_ms, rest_ms, set_count, include_cooldown, play_sound, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     work_ms = excluded.work_ms,
                     rest_ms = excluded.rest_ms,
                     set_count = excluded.set_count,
                     include_cooldown = excluded.include_cooldown,
                     play_sound = excluded.play_sound",
                params![
                    record.id.to_string(),
                    record.name,
                    to_i64(record.work_ms)?,
                    to_i64(record.rest_ms)?,
                    record.set_count,
                    record.include_cooldown,
                    record.play_sound,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to save preset")?;
            Ok(())
        })
        .await
    }

    pub async fn list_presets(&self) -> Result<Vec<TimerPreset>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, work_ms, rest_ms, set_count, include_cooldown, play_sound
                 FROM presets
                 ORDER BY created_at ASC, name ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut presets = Vec::new();
            while let Some(row) = rows.next()? {
                presets.push(row_to_preset(row)?);
            }
            Ok(presets)
        })
        .await
    }

    /// Returns whether a preset was removed.
    pub async fn delete_preset(&self, id: uuid::Uuid) -> Result<bool> {
        self.execute(move |conn| {
            let removed = conn.execute("DELETE FROM presets WHERE id = ?1", params![id.to_string()])?;
            Ok(removed > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn presets_round_trip_through_storage() {
        let db = Database::open_in_memory().unwrap();
        let preset = TimerPreset::new("hills", Duration::from_secs(40), Duration::from_secs(20), 8)
            .with_cooldown(true);
        db.save_preset(&preset).await.unwrap();

        let mut renamed = preset.clone();
        renamed.name = "hill repeats".into();
        db.save_preset(&renamed).await.unwrap();

        let stored = db.list_presets().await.unwrap();
        assert_eq!(stored, vec![renamed]);

        assert!(db.delete_preset(preset.id).await.unwrap());
        assert!(!db.delete_preset(preset.id).await.unwrap());
        assert!(db.list_presets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_preset_is_not_saved() {
        let db = Database::open_in_memory().unwrap();
        let preset = TimerPreset::new("broken", Duration::ZERO, Duration::from_secs(20), 8);
        assert!(db.save_preset(&preset).await.is_err());
        assert!(db.list_presets().await.unwrap().is_empty());
    }
}
