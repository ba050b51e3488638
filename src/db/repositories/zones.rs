use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::{db::connection::Database, zones::ZoneConfiguration};

impl Database {
    pub async fn save_zone_configuration(&self, config: &ZoneConfiguration) -> Result<()> {
        config.validate()?;
        let bands_json = serde_json::to_string(config)?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO zone_config (id, bands_json, updated_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                     bands_json = excluded.bands_json,
                     updated_at = excluded.updated_at",
                params![bands_json, Utc::now().to_rfc3339()],
            )
            .context("failed to save zone configuration")?;
            Ok(())
        })
        .await
    }

    /// Stored configuration, re-validated on load.
    pub async fn load_zone_configuration(&self) -> Result<Option<ZoneConfiguration>> {
        let raw = self
            .execute(|conn| {
                let raw = conn
                    .query_row("SELECT bands_json FROM zone_config WHERE id = 1", [], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?;
                Ok(raw)
            })
            .await?;

        raw.map(|json| {
            let config: ZoneConfiguration =
                serde_json::from_str(&json).context("failed to parse stored zone configuration")?;
            config.validate()?;
            Ok(config)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zone_configuration_replaces_previous() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_zone_configuration().await.unwrap().is_none());

        let first = ZoneConfiguration::from_max_heart_rate(190).unwrap();
        let second = ZoneConfiguration::from_max_heart_rate(176).unwrap();
        db.save_zone_configuration(&first).await.unwrap();
        db.save_zone_configuration(&second).await.unwrap();

        assert_eq!(db.load_zone_configuration().await.unwrap(), Some(second));
    }
}
