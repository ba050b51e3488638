pub mod config;
pub mod db;
pub mod models;
pub mod relay;
pub mod sensor;
pub mod session;
pub mod telemetry;
pub mod utils;
pub mod zones;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::{info, warn};

use config::SettingsStore;
use db::Database;
use sensor::{central::CentralEventReceiver, ConnectionController, SensorCentral};
use session::{CueSink, SessionController};

/// Everything a front end needs, wired together. Collaborators are passed in
/// explicitly; nothing here is global.
pub struct AppContext {
    pub settings: SettingsStore,
    pub db: Database,
    pub connection: ConnectionController,
    pub session: SessionController,
}

impl AppContext {
    /// Spawns the connection driver and points the session at the live
    /// sensor feed. Must be called from within a tokio runtime.
    pub async fn bootstrap(
        settings: SettingsStore,
        db: Database,
        central: Arc<dyn SensorCentral>,
        events: CentralEventReceiver,
        cue: Arc<dyn CueSink>,
    ) -> Result<Self> {
        let config = settings.config();
        let connection = ConnectionController::spawn(central, events, config.connection.clone());
        let session = SessionController::new(config.session.clone(), cue, Some(db.clone()));
        session.set_reading_source(connection.reading_source());

        match db.load_zone_configuration().await {
            Ok(zones) => session.load_zones(zones).await?,
            Err(err) => warn!("Ignoring stored zone configuration: {err:#}"),
        }

        info!("pulsetrack ready");
        Ok(Self {
            settings,
            db,
            connection,
            session,
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.session.shutdown().await;
        self.connection.shutdown().await
    }
}

/// Opens (creating if needed) the settings file and database under `data_dir`.
pub fn open_storage(data_dir: &Path) -> Result<(SettingsStore, Database)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let db = Database::new(data_dir.join("pulsetrack.sqlite3"))?;
    Ok((settings, db))
}

#[cfg(test)]
mod tests {
    use crate::{
        sensor::{central::central_channel, mock::MockCentral, ConnectionStatus},
        session::{RecordingCueSink, SessionStatus},
        zones::ZoneConfiguration,
    };

    use super::*;

    #[tokio::test]
    async fn bootstrap_loads_stored_zones_and_shuts_down() {
        let dir = std::env::temp_dir().join(format!("pulsetrack-ctx-{}", uuid::Uuid::new_v4()));
        let (settings, db) = open_storage(&dir).unwrap();
        db.save_zone_configuration(&ZoneConfiguration::from_max_heart_rate(190).unwrap())
            .await
            .unwrap();

        let (tx, rx) = central_channel();
        let central = Arc::new(MockCentral::responsive(tx));
        let ctx = AppContext::bootstrap(settings, db, central, rx, Arc::new(RecordingCueSink::default()))
            .await
            .unwrap();

        let snapshot = ctx.session.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert!(snapshot.time_in_zones.is_some());
        assert_eq!(ctx.connection.status(), ConnectionStatus::Idle);
        assert!(ctx.session.current_reading().is_none());

        ctx.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
