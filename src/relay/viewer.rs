use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    models::{Reading, ReadingSource},
};

use super::{RelayClient, RelayError, RelayPayload, ShareCode};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Polls the relay for someone else's shared session and exposes it as a
/// reading source.
pub struct RemoteViewer {
    code: ShareCode,
    payload_rx: watch::Receiver<Option<RelayPayload>>,
    reading_rx: watch::Receiver<Option<Reading>>,
    error_rx: watch::Receiver<Option<RelayError>>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteViewer {
    pub fn start(client: Arc<dyn RelayClient>, code: ShareCode, config: &RelayConfig) -> Self {
        let (payload_tx, payload_rx) = watch::channel(None);
        let (reading_tx, reading_rx) = watch::channel(None);
        let (error_tx, error_rx) = watch::channel(None);
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(pull_loop(
            client,
            code.clone(),
            config.pull_interval(),
            payload_tx,
            reading_tx,
            error_tx,
            cancel_token.clone(),
        ));
        log_info!("Viewing shared session {}", code);

        Self {
            code,
            payload_rx,
            reading_rx,
            error_rx,
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn code(&self) -> &ShareCode {
        &self.code
    }

    pub fn latest_payload(&self) -> Option<RelayPayload> {
        *self.payload_rx.borrow()
    }

    /// Last non-transient error, cleared by the next successful pull.
    pub fn last_error(&self) -> Option<RelayError> {
        self.error_rx.borrow().clone()
    }

    pub fn watch_payload(&self) -> watch::Receiver<Option<RelayPayload>> {
        self.payload_rx.clone()
    }

    /// Remote feed for the session.
    pub fn reading_source(&self) -> ReadingSource {
        let rx = self.reading_rx.clone();
        Arc::new(move || *rx.borrow())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.context("viewer task failed to join")?;
        }
        Ok(())
    }
}

async fn pull_loop(
    client: Arc<dyn RelayClient>,
    code: ShareCode,
    pull_interval: Duration,
    payload_tx: watch::Sender<Option<RelayPayload>>,
    reading_tx: watch::Sender<Option<Reading>>,
    error_tx: watch::Sender<Option<RelayError>>,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(pull_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let client = client.clone();
                let pull_code = code.clone();
                let result = tokio::task::spawn_blocking(move || client.pull(&pull_code))
                    .await
                    .unwrap_or_else(|err| Err(RelayError::Transport(err.to_string())));

                match result {
                    Ok(payload) => {
                        let now = time::Instant::now().into_std();
                        payload_tx.send_replace(Some(payload));
                        reading_tx.send_replace(Some(Reading::new(payload.latest_bpm, now)));
                        error_tx.send_replace(None);
                    }
                    Err(RelayError::Transport(reason)) => {
                        log_debug!("Relay pull failed: {reason}");
                    }
                    Err(err) => {
                        log_debug!("Relay pull for {} rejected: {err}", code);
                        reading_tx.send_replace(None);
                        error_tx.send_replace(Some(err));
                    }
                }
            }
        }
    }
}
