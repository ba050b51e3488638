use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConnectionConfig,
    models::{Reading, ReadingSource},
    telemetry::{rmssd_from_rr, SampleStore},
};

use super::{
    central::{CentralEventReceiver, DeviceId, SensorCentral},
    machine::{
        ConnectionAction, ConnectionError, ConnectionMachine, ConnectionNotice, ConnectionStatus,
        TimerKind,
    },
    protocol::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// RR intervals kept for the rolling variability estimate.
const MAX_RECENT_RR: usize = 120;

enum Command {
    StartScan,
    StopScan,
    Connect {
        target: DeviceId,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect,
    EnterBackground,
    EnterForeground,
}

enum DriverInput {
    Command(Command),
    TimerFired { generation: u64, kind: TimerKind },
}

/// Handle to the connection driver task. Every mutation of the connection
/// machine and the sample store happens on that one task; Bluetooth
/// callbacks and API calls reach it through channels.
#[derive(Clone)]
pub struct ConnectionController {
    inputs: mpsc::UnboundedSender<DriverInput>,
    reading_rx: watch::Receiver<Option<Reading>>,
    status_rx: watch::Receiver<ConnectionStatus>,
    worn_rx: watch::Receiver<bool>,
    notices: broadcast::Sender<ConnectionNotice>,
    samples: Arc<StdMutex<SampleStore>>,
    recent_rr: Arc<StdMutex<VecDeque<f64>>>,
    cancel_token: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionController {
    pub fn spawn(
        central: Arc<dyn SensorCentral>,
        events: CentralEventReceiver,
        config: ConnectionConfig,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (reading_tx, reading_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let (worn_tx, worn_rx) = watch::channel(false);
        let (notices, _) = broadcast::channel(64);
        let samples = Arc::new(StdMutex::new(SampleStore::new()));
        let recent_rr = Arc::new(StdMutex::new(VecDeque::with_capacity(MAX_RECENT_RR)));
        let cancel_token = CancellationToken::new();

        let driver = Driver {
            machine: ConnectionMachine::new(config),
            central,
            self_tx: input_tx.clone(),
            reading_tx,
            status_tx,
            worn_tx,
            notices: notices.clone(),
            samples: samples.clone(),
            recent_rr: recent_rr.clone(),
            timer: None,
        };
        let handle = tokio::spawn(driver.run(events, input_rx, cancel_token.clone()));

        Self {
            inputs: input_tx,
            reading_rx,
            status_rx,
            worn_rx,
            notices,
            samples,
            recent_rr,
            cancel_token,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inputs
            .send(DriverInput::Command(command))
            .map_err(|_| anyhow!("connection driver has stopped"))
    }

    pub fn start_scan(&self) -> Result<()> {
        self.send(Command::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan)
    }

    /// Connects to a user-selected device. Fails with
    /// [`ConnectionError::DeviceBusy`] when the device is held elsewhere.
    pub async fn connect(&self, target: DeviceId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Connect { target, reply })?;
        reply_rx
            .await
            .context("connection driver dropped the connect request")?
            .map_err(anyhow::Error::new)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    pub fn enter_background(&self) -> Result<()> {
        self.send(Command::EnterBackground)
    }

    pub fn enter_foreground(&self) -> Result<()> {
        self.send(Command::EnterForeground)
    }

    pub fn current_reading(&self) -> Option<Reading> {
        *self.reading_rx.borrow()
    }

    /// Live-device feed for the session.
    pub fn reading_source(&self) -> ReadingSource {
        let rx = self.reading_rx.clone();
        Arc::new(move || *rx.borrow())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_worn(&self) -> bool {
        *self.worn_rx.borrow()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.notices.subscribe()
    }

    pub fn samples_since(&self, start: std::time::Instant) -> Vec<Reading> {
        match self.samples.lock() {
            Ok(store) => store.since(start).copied().collect(),
            Err(poisoned) => poisoned.into_inner().since(start).copied().collect(),
        }
    }

    /// RMSSD over the most recent RR intervals reported by the sensor.
    pub fn recent_rmssd(&self) -> Option<f64> {
        let rr = match self.recent_rr.lock() {
            Ok(rr) => rr.iter().copied().collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        };
        rmssd_from_rr(&rr)
    }

    /// Stops the driver: tears down any link and cancels its timers.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .await
                .context("connection driver task failed to join")?;
        }
        Ok(())
    }
}

struct Driver {
    machine: ConnectionMachine,
    central: Arc<dyn SensorCentral>,
    self_tx: mpsc::UnboundedSender<DriverInput>,
    reading_tx: watch::Sender<Option<Reading>>,
    status_tx: watch::Sender<ConnectionStatus>,
    worn_tx: watch::Sender<bool>,
    notices: broadcast::Sender<ConnectionNotice>,
    samples: Arc<StdMutex<SampleStore>>,
    recent_rr: Arc<StdMutex<VecDeque<f64>>>,
    timer: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: CentralEventReceiver,
        mut inputs: mpsc::UnboundedReceiver<DriverInput>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    log_info!("connection driver shutting down");
                    break;
                }
                Some(event) = events.recv() => {
                    log_debug!("central event: {event:?}");
                    let actions = self.machine.handle_event(event, Instant::now().into_std());
                    self.apply(actions);
                }
                Some(input) = inputs.recv() => self.handle_input(input),
            }
        }

        let actions = self.machine.disconnect();
        self.apply(actions);
        self.abort_timer();
    }

    fn handle_input(&mut self, input: DriverInput) {
        let actions = match input {
            DriverInput::TimerFired { generation, kind } => {
                self.timer = None;
                self.machine.handle_timer(generation, kind)
            }
            DriverInput::Command(Command::StartScan) => self.machine.start_scan(),
            DriverInput::Command(Command::StopScan) => self.machine.stop_scan(),
            DriverInput::Command(Command::Disconnect) => self.machine.disconnect(),
            DriverInput::Command(Command::EnterBackground) => self.machine.enter_background(),
            DriverInput::Command(Command::EnterForeground) => self.machine.enter_foreground(),
            DriverInput::Command(Command::Connect { target, reply }) => {
                let busy = self.central.is_connected_elsewhere(&target);
                match self.machine.connect(target, busy) {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        actions
                    }
                    Err(err) => {
                        log_warn!("connect rejected: {err}");
                        let _ = self.notices.send(ConnectionNotice::Failed(err.clone()));
                        let _ = reply.send(Err(err));
                        Vec::new()
                    }
                }
            }
        };
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::StartScan => self.central.start_scan(),
                ConnectionAction::StopScan => self.central.stop_scan(),
                ConnectionAction::Connect(device) => self.central.connect(&device),
                ConnectionAction::CancelConnection(device) => {
                    self.central.cancel_connection(&device)
                }
                ConnectionAction::DiscoverServices(device) => {
                    self.central.discover_services(&device, &[HEART_RATE_SERVICE])
                }
                ConnectionAction::DiscoverCharacteristics(device) => self
                    .central
                    .discover_characteristics(&device, HEART_RATE_SERVICE, &[HEART_RATE_MEASUREMENT]),
                ConnectionAction::Subscribe(device) => {
                    self.central.subscribe(&device, HEART_RATE_MEASUREMENT)
                }
                ConnectionAction::ArmTimer {
                    generation,
                    kind,
                    after,
                } => self.arm_timer(generation, kind, after),
                ConnectionAction::CancelTimer => self.abort_timer(),
                ConnectionAction::EmitSample(sample) => {
                    match self.samples.lock() {
                        Ok(mut store) => {
                            store.push(sample.reading);
                        }
                        Err(poisoned) => {
                            poisoned.into_inner().push(sample.reading);
                        }
                    }
                    if !sample.rr_intervals_ms.is_empty() {
                        let mut rr = match self.recent_rr.lock() {
                            Ok(rr) => rr,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        for value in sample.rr_intervals_ms {
                            if rr.len() == MAX_RECENT_RR {
                                rr.pop_front();
                            }
                            rr.push_back(value);
                        }
                    }
                    self.reading_tx.send_replace(Some(sample.reading));
                }
                ConnectionAction::ClearReading => {
                    self.reading_tx.send_replace(None);
                }
                ConnectionAction::Notify(notice) => {
                    match &notice {
                        ConnectionNotice::StatusChanged(status) => {
                            log_info!("connection status: {status:?}");
                            self.status_tx.send_replace(*status);
                        }
                        ConnectionNotice::Failed(err) if err.is_terminal() => {
                            log_warn!("{err}");
                        }
                        _ => {}
                    }
                    let _ = self.notices.send(notice);
                }
            }
        }
        self.worn_tx.send_if_modified(|worn| {
            let current = self.machine.is_worn();
            let changed = *worn != current;
            *worn = current;
            changed
        });
    }

    fn arm_timer(&mut self, generation: u64, kind: TimerKind, after: Duration) {
        self.abort_timer();
        let tx = self.self_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(DriverInput::TimerFired { generation, kind });
        }));
    }

    fn abort_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{
        central::{central_channel, Advertisement, CentralEvent},
        mock::{MockCall, MockCentral},
    };

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn polar() -> DeviceId {
        DeviceId::new("polar")
    }

    async fn connected_controller(config: ConnectionConfig) -> (ConnectionController, Arc<MockCentral>) {
        let (tx, rx) = central_channel();
        let central = Arc::new(MockCentral::responsive(tx));
        let controller = ConnectionController::spawn(central.clone(), rx, config);

        controller.start_scan().unwrap();
        settle().await;
        central.advertise(Advertisement {
            device: polar(),
            name: Some("Polar H10".into()),
            services: vec![HEART_RATE_SERVICE],
            rssi: Some(-55),
        });
        settle().await;
        controller.connect(polar()).await.unwrap();
        settle().await;
        (controller, central)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_decoded_readings() {
        let (controller, central) = connected_controller(ConnectionConfig::default()).await;
        assert_eq!(controller.status(), ConnectionStatus::Connected);
        assert!(central.calls().contains(&MockCall::Subscribe(polar())));

        let source = controller.reading_source();
        central.notify(&polar(), 128, &[468.75]);
        settle().await;

        assert_eq!(source().map(|r| r.value), Some(128));
        assert_eq!(controller.samples_since(std::time::Instant::now() - Duration::from_secs(5)).len(), 1);
        controller.shutdown().await.unwrap();
        assert!(central.calls().contains(&MockCall::CancelConnection(polar())));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_device_is_reported() {
        let (tx, rx) = central_channel();
        let central = Arc::new(MockCentral::responsive(tx));
        central.set_busy(&polar(), true);
        let controller = ConnectionController::spawn(central.clone(), rx, ConnectionConfig::default());
        let mut notices = controller.subscribe_notices();

        let err = controller.connect(polar()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConnectionError>(),
            Some(&ConnectionError::DeviceBusy(polar()))
        );
        assert_eq!(
            notices.recv().await.unwrap(),
            ConnectionNotice::Failed(ConnectionError::DeviceBusy(polar()))
        );
        assert!(!central.calls().contains(&MockCall::Connect(polar())));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_restarts_discovery_when_sensor_goes_quiet() {
        let config = ConnectionConfig::default();
        let watchdog = config.watchdog_timeout();
        let (controller, central) = connected_controller(config).await;
        central.notify(&polar(), 90, &[]);
        settle().await;

        tokio::time::sleep(watchdog - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(controller.status(), ConnectionStatus::Connected);

        // Auto-reconnect on rediscovery is disabled so the scan state sticks.
        central.set_responsive(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(controller.status(), ConnectionStatus::Scanning);
        assert_eq!(controller.current_reading(), None);
        let calls = central.calls();
        assert!(calls.contains(&MockCall::CancelConnection(polar())));
        assert_eq!(calls.iter().filter(|c| **c == MockCall::StartScan).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_loss_reconnects_after_delay() {
        let config = ConnectionConfig::default();
        let delay = config.reconnect_delay();
        let (controller, central) = connected_controller(config).await;
        central.notify(&polar(), 100, &[]);
        settle().await;

        central.drop_link(&polar());
        settle().await;
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);

        tokio::time::sleep(delay + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(controller.status(), ConnectionStatus::Connected);
        let connects = central
            .calls()
            .iter()
            .filter(|call| **call == MockCall::Connect(polar()))
            .count();
        assert_eq!(connects, 2);

        central.emit(CentralEvent::Notification {
            device: polar(),
            characteristic: HEART_RATE_MEASUREMENT,
            value: vec![0x00, 77],
        });
        settle().await;
        assert_eq!(controller.current_reading().map(|r| r.value), Some(77));
    }
}
