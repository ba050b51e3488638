use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::RelayConfig, session::SessionSnapshot};

use super::{RelayClient, RelayError, RelayPayload, ShareCode};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingStatus {
    Active,
    Stopped,
    /// The relay rejected our credentials; sharing has ended.
    Unauthorized,
}

/// Pushes the session's latest reading to the relay until stopped.
///
/// Transient push failures are dropped. An authorization failure ends the
/// session and is reported exactly once through [`SharingSession::take_failure`].
pub struct SharingSession {
    code: ShareCode,
    status_rx: watch::Receiver<SharingStatus>,
    failure: Arc<StdMutex<Option<RelayError>>>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SharingSession {
    pub fn start(
        client: Arc<dyn RelayClient>,
        code: ShareCode,
        snapshots: watch::Receiver<SessionSnapshot>,
        config: &RelayConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(SharingStatus::Active);
        let failure = Arc::new(StdMutex::new(None));
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(push_loop(
            client,
            code.clone(),
            snapshots,
            config.push_interval(),
            status_tx,
            failure.clone(),
            cancel_token.clone(),
        ));
        log_info!("Sharing session started with code {}", code);

        Self {
            code,
            status_rx,
            failure,
            cancel_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn code(&self) -> &ShareCode {
        &self.code
    }

    pub fn status(&self) -> SharingStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SharingStatus> {
        self.status_rx.clone()
    }

    /// The error that ended sharing, handed out once.
    pub fn take_failure(&self) -> Option<RelayError> {
        match self.failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.context("sharing task failed to join")?;
        }
        Ok(())
    }
}

async fn push_loop(
    client: Arc<dyn RelayClient>,
    code: ShareCode,
    snapshots: watch::Receiver<SessionSnapshot>,
    push_interval: std::time::Duration,
    status_tx: watch::Sender<SharingStatus>,
    failure: Arc<StdMutex<Option<RelayError>>>,
    cancel_token: CancellationToken,
) {
    let mut ticker = time::interval(push_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                status_tx.send_replace(SharingStatus::Stopped);
                break;
            }
            _ = ticker.tick() => {
                let Some(payload) = RelayPayload::from_snapshot(&snapshots.borrow()) else {
                    continue;
                };

                let client = client.clone();
                let push_code = code.clone();
                let result = tokio::task::spawn_blocking(move || client.push(&push_code, &payload))
                    .await
                    .unwrap_or_else(|err| Err(RelayError::Transport(err.to_string())));

                match result {
                    Ok(()) => {}
                    Err(RelayError::Unauthorized) => {
                        log_error!("Relay rejected sharing code {}; sharing ended", code);
                        match failure.lock() {
                            Ok(mut guard) => *guard = Some(RelayError::Unauthorized),
                            Err(poisoned) => *poisoned.into_inner() = Some(RelayError::Unauthorized),
                        }
                        status_tx.send_replace(SharingStatus::Unauthorized);
                        break;
                    }
                    Err(err) => {
                        log_debug!("Dropped relay push: {err}");
                    }
                }
            }
        }
    }
}
