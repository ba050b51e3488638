//! Connection state machine.
//!
//! Pure transition logic: every input returns the list of
//! [`ConnectionAction`]s the driver must perform (calls into the central,
//! timers to arm, samples to publish). Nothing here touches I/O or clocks, so
//! the whole retry policy runs in tests with synthetic instants.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{config::ConnectionConfig, models::Reading};

use super::{
    central::{Advertisement, CentralEvent, DeviceId},
    protocol::{
        decode_measurement, looks_like_heart_rate_monitor, HEART_RATE_MEASUREMENT,
        HEART_RATE_SERVICE,
    },
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("{0} is already connected to another device")]
    DeviceBusy(DeviceId),
    #[error("{0} does not expose the heart rate service")]
    ServiceMissing(DeviceId),
    #[error("{0} does not expose the heart rate measurement characteristic")]
    CharacteristicMissing(DeviceId),
    #[error("link to {device} failed: {reason}")]
    LinkFailed { device: DeviceId, reason: String },
    #[error("gave up reconnecting to {device} after {attempts} attempts")]
    ReconnectExhausted { device: DeviceId, attempts: u32 },
}

impl ConnectionError {
    /// Only an exhausted reconnect budget needs the user to step in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionError::ReconnectExhausted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStage {
    DiscoveringServices,
    DiscoveringCharacteristics,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting { target: DeviceId },
    Connected { target: DeviceId, stage: LinkStage },
    Disconnected { target: DeviceId },
    Reconnecting { target: DeviceId, attempt: u32 },
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Idle => ConnectionStatus::Idle,
            ConnectionState::Scanning => ConnectionStatus::Scanning,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Disconnected { .. } => ConnectionStatus::Disconnected,
            ConnectionState::Reconnecting { .. } => ConnectionStatus::Reconnecting,
        }
    }

    pub fn target(&self) -> Option<&DeviceId> {
        match self {
            ConnectionState::Idle | ConnectionState::Scanning => None,
            ConnectionState::Connecting { target }
            | ConnectionState::Connected { target, .. }
            | ConnectionState::Disconnected { target }
            | ConnectionState::Reconnecting { target, .. } => Some(target),
        }
    }

    fn is_linking(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Watchdog, reconnect delay and connect timeout share one slot: arming any
/// of them replaces whichever was armed before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Watchdog,
    ReconnectDelay,
    ConnectTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub reading: Reading,
    pub rr_intervals_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotice {
    CandidateFound(Advertisement),
    StatusChanged(ConnectionStatus),
    WornChanged(bool),
    Failed(ConnectionError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    StartScan,
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId),
    Subscribe(DeviceId),
    ArmTimer {
        generation: u64,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimer,
    EmitSample(Sample),
    ClearReading,
    Notify(ConnectionNotice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub identity: DeviceId,
    pub last_known_good: Option<Instant>,
    pub consecutive_zero_readings: u32,
    pub reconnect_attempts: u32,
}

impl ConnectionRecord {
    fn new(identity: DeviceId) -> Self {
        Self {
            identity,
            last_known_good: None,
            consecutive_zero_readings: 0,
            reconnect_attempts: 0,
        }
    }
}

type Actions = Vec<ConnectionAction>;

pub struct ConnectionMachine {
    config: ConnectionConfig,
    state: ConnectionState,
    record: Option<ConnectionRecord>,
    /// Device most recently chosen by the user.
    selected: Option<DeviceId>,
    timer: Option<(u64, TimerKind)>,
    next_generation: u64,
    /// Link we tore down ourselves; its disconnect callback is not a loss.
    expected_disconnect: Option<DeviceId>,
    worn: bool,
    backgrounded: bool,
    resume_scan: bool,
    candidates: Vec<Advertisement>,
}

impl ConnectionMachine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            record: None,
            selected: None,
            timer: None,
            next_generation: 0,
            expected_disconnect: None,
            worn: false,
            backgrounded: false,
            resume_scan: false,
            candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn record(&self) -> Option<&ConnectionRecord> {
        self.record.as_ref()
    }

    pub fn selected(&self) -> Option<&DeviceId> {
        self.selected.as_ref()
    }

    pub fn is_worn(&self) -> bool {
        self.worn
    }

    pub fn candidates(&self) -> &[Advertisement] {
        &self.candidates
    }

    pub fn is_candidate(&self, adv: &Advertisement) -> bool {
        adv.services.contains(&HEART_RATE_SERVICE)
            || adv
                .name
                .as_deref()
                .is_some_and(|name| looks_like_heart_rate_monitor(name, self.config.name_fragments.as_slice()))
    }

    pub fn start_scan(&mut self) -> Actions {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Idle => {
                self.candidates.clear();
                self.begin_scanning(&mut actions);
            }
            ConnectionState::Scanning => {}
            _ => debug!("scan request ignored while {:?}", self.state.status()),
        }
        actions
    }

    pub fn stop_scan(&mut self) -> Actions {
        let mut actions = Vec::new();
        self.resume_scan = false;
        if self.state == ConnectionState::Scanning {
            actions.push(ConnectionAction::StopScan);
            self.transition(ConnectionState::Idle, &mut actions);
        }
        actions
    }

    /// User-selected connect. `busy_elsewhere` is the result of the link-state
    /// probe taken just before this call.
    pub fn connect(
        &mut self,
        target: DeviceId,
        busy_elsewhere: bool,
    ) -> Result<Actions, ConnectionError> {
        if busy_elsewhere {
            return Err(ConnectionError::DeviceBusy(target));
        }

        let mut actions = Vec::new();
        if let Some(current) = self.state.target().cloned() {
            if current != target {
                self.tear_down_link(&current, &mut actions);
            }
        }

        self.selected = Some(target.clone());
        self.record = Some(ConnectionRecord::new(target.clone()));
        self.issue_connect(target, None, &mut actions);
        Ok(actions)
    }

    /// User-initiated disconnect: no reconnection, counters cleared.
    pub fn disconnect(&mut self) -> Actions {
        let mut actions = Vec::new();
        self.cancel_timer(&mut actions);
        if let Some(target) = self.state.target().cloned() {
            if !matches!(self.state, ConnectionState::Disconnected { .. }) {
                actions.push(ConnectionAction::CancelConnection(target.clone()));
                self.expected_disconnect = Some(target);
            }
        }
        if self.state == ConnectionState::Scanning {
            actions.push(ConnectionAction::StopScan);
        }
        self.selected = None;
        self.record = None;
        self.worn = false;
        self.resume_scan = false;
        actions.push(ConnectionAction::ClearReading);
        self.transition(ConnectionState::Idle, &mut actions);
        actions
    }

    pub fn enter_background(&mut self) -> Actions {
        let mut actions = Vec::new();
        self.backgrounded = true;
        if self.state == ConnectionState::Scanning {
            actions.push(ConnectionAction::StopScan);
            self.resume_scan = true;
            self.transition(ConnectionState::Idle, &mut actions);
        }
        actions
    }

    pub fn enter_foreground(&mut self) -> Actions {
        let mut actions = Vec::new();
        self.backgrounded = false;
        if std::mem::take(&mut self.resume_scan) && self.state == ConnectionState::Idle {
            self.begin_scanning(&mut actions);
        }
        actions
    }

    pub fn handle_event(&mut self, event: CentralEvent, now: Instant) -> Actions {
        let mut actions = Vec::new();
        match event {
            CentralEvent::Discovered(adv) => self.on_discovered(adv, &mut actions),
            CentralEvent::Connected(device) => self.on_connected(device, &mut actions),
            CentralEvent::ConnectFailed { device, reason } => {
                if self.state.is_linking() && self.state.target() == Some(&device) {
                    warn!("connect to {device} failed: {reason}");
                    self.notify_failure(
                        ConnectionError::LinkFailed {
                            device: device.clone(),
                            reason,
                        },
                        &mut actions,
                    );
                    self.schedule_reconnect(device, &mut actions);
                }
            }
            CentralEvent::Disconnected { device, reason } => {
                self.on_disconnected(device, reason, &mut actions)
            }
            CentralEvent::ServicesDiscovered { device, services } => {
                if self.stage_of(&device) == Some(LinkStage::DiscoveringServices) {
                    if services.contains(&HEART_RATE_SERVICE) {
                        self.set_stage(LinkStage::DiscoveringCharacteristics);
                        actions.push(ConnectionAction::DiscoverCharacteristics(device));
                    } else {
                        self.reject_device(ConnectionError::ServiceMissing(device), &mut actions);
                    }
                }
            }
            CentralEvent::CharacteristicsDiscovered {
                device,
                service,
                characteristics,
            } => {
                if self.stage_of(&device) == Some(LinkStage::DiscoveringCharacteristics) {
                    if service == HEART_RATE_SERVICE
                        && characteristics.contains(&HEART_RATE_MEASUREMENT)
                    {
                        actions.push(ConnectionAction::Subscribe(device.clone()));
                        self.set_stage(LinkStage::Streaming);
                        self.worn = true;
                        self.arm_timer(
                            TimerKind::Watchdog,
                            self.config.watchdog_timeout(),
                            &mut actions,
                        );
                        info!("streaming heart rate from {device}");
                    } else {
                        self.reject_device(
                            ConnectionError::CharacteristicMissing(device),
                            &mut actions,
                        );
                    }
                }
            }
            CentralEvent::Notification {
                device,
                characteristic,
                value,
            } => {
                if characteristic == HEART_RATE_MEASUREMENT
                    && self.stage_of(&device) == Some(LinkStage::Streaming)
                {
                    self.on_measurement(&value, now, &mut actions);
                }
            }
        }
        actions
    }

    /// Timer expiry. Fires belonging to a replaced or cancelled timer are
    /// ignored.
    pub fn handle_timer(&mut self, generation: u64, kind: TimerKind) -> Actions {
        let mut actions = Vec::new();
        if self.timer != Some((generation, kind)) {
            debug!("dropping stale {kind:?} timer #{generation}");
            return actions;
        }
        self.timer = None;

        match (kind, self.state.clone()) {
            (TimerKind::Watchdog, ConnectionState::Connected { target, .. }) => {
                warn!(
                    "no heart rate from {target} within {:?}; restarting discovery",
                    self.config.watchdog_timeout()
                );
                self.tear_down_link(&target, &mut actions);
                if let Some(record) = self.record.as_mut() {
                    record.consecutive_zero_readings = 0;
                }
                self.notify_failure(
                    ConnectionError::LinkFailed {
                        device: target,
                        reason: "sensor stopped transmitting".into(),
                    },
                    &mut actions,
                );
                self.begin_scanning(&mut actions);
            }
            (TimerKind::ReconnectDelay, ConnectionState::Disconnected { target }) => {
                if self.selected.as_ref() != Some(&target) {
                    debug!("discarding reconnect to {target}; selection has moved on");
                    self.transition(ConnectionState::Idle, &mut actions);
                    self.begin_scanning(&mut actions);
                    return actions;
                }
                let attempt = match self.record.as_mut() {
                    Some(record) => {
                        record.reconnect_attempts += 1;
                        record.reconnect_attempts
                    }
                    None => return actions,
                };
                info!(
                    "reconnect attempt {attempt}/{} to {target}",
                    self.config.max_reconnect_attempts
                );
                self.issue_connect(target, Some(attempt), &mut actions);
            }
            (TimerKind::ConnectTimeout, state) if state.is_linking() => {
                if let Some(target) = state.target().cloned() {
                    warn!("connect to {target} timed out");
                    actions.push(ConnectionAction::CancelConnection(target.clone()));
                    self.expected_disconnect = Some(target.clone());
                    self.notify_failure(
                        ConnectionError::LinkFailed {
                            device: target.clone(),
                            reason: "connect timed out".into(),
                        },
                        &mut actions,
                    );
                    self.schedule_reconnect(target, &mut actions);
                }
            }
            (kind, state) => debug!("{kind:?} timer fired in {:?}; nothing to do", state.status()),
        }
        actions
    }

    fn on_discovered(&mut self, adv: Advertisement, actions: &mut Actions) {
        if !self.is_candidate(&adv) {
            return;
        }
        match self.candidates.iter_mut().find(|c| c.device == adv.device) {
            Some(existing) => *existing = adv.clone(),
            None => {
                self.candidates.push(adv.clone());
                actions.push(ConnectionAction::Notify(ConnectionNotice::CandidateFound(
                    adv.clone(),
                )));
            }
        }

        // Rediscovered the device the user picked (after a watchdog teardown).
        if self.state == ConnectionState::Scanning && self.selected.as_ref() == Some(&adv.device) {
            info!("rediscovered {}; reconnecting", adv.device);
            self.issue_connect(adv.device, None, actions);
        }
    }

    fn on_connected(&mut self, device: DeviceId, actions: &mut Actions) {
        if self.state.is_linking() && self.state.target() == Some(&device) {
            self.cancel_timer(actions);
            // A cancelled attempt on this device may never report its
            // disconnect. Once the new link is up, the next loss is real.
            if self.expected_disconnect.as_ref() == Some(&device) {
                self.expected_disconnect = None;
            }
            if let Some(record) = self.record.as_mut() {
                record.consecutive_zero_readings = 0;
            }
            self.transition(
                ConnectionState::Connected {
                    target: device.clone(),
                    stage: LinkStage::DiscoveringServices,
                },
                actions,
            );
            actions.push(ConnectionAction::DiscoverServices(device));
        } else {
            debug!("unsolicited link to {device}; cancelling");
            actions.push(ConnectionAction::CancelConnection(device.clone()));
            self.expected_disconnect = Some(device);
        }
    }

    fn on_disconnected(&mut self, device: DeviceId, reason: Option<String>, actions: &mut Actions) {
        if self.expected_disconnect.as_ref() == Some(&device) {
            self.expected_disconnect = None;
            return;
        }
        let ours = matches!(
            self.state,
            ConnectionState::Connected { .. }
                | ConnectionState::Connecting { .. }
                | ConnectionState::Reconnecting { .. }
        ) && self.state.target() == Some(&device);
        if !ours {
            return;
        }

        let reason = reason.unwrap_or_else(|| "link lost".into());
        warn!("lost link to {device}: {reason}");
        actions.push(ConnectionAction::ClearReading);
        self.notify_failure(
            ConnectionError::LinkFailed {
                device: device.clone(),
                reason,
            },
            actions,
        );
        self.schedule_reconnect(device, actions);
    }

    fn on_measurement(&mut self, frame: &[u8], now: Instant, actions: &mut Actions) {
        let measurement = match decode_measurement(frame) {
            Ok(measurement) => measurement,
            Err(err) => {
                warn!("dropping heart rate frame {frame:02x?}: {err}");
                return;
            }
        };

        let has_pulse = measurement.bpm > 0;
        let zeros = {
            let Some(record) = self.record.as_mut() else {
                return;
            };
            if has_pulse {
                record.consecutive_zero_readings = 0;
                record.last_known_good = Some(now);
                record.reconnect_attempts = 0;
            } else {
                record.consecutive_zero_readings += 1;
            }
            record.consecutive_zero_readings
        };

        if has_pulse {
            if !self.worn {
                self.worn = true;
                actions.push(ConnectionAction::Notify(ConnectionNotice::WornChanged(true)));
            }
            self.arm_timer(TimerKind::Watchdog, self.config.watchdog_timeout(), actions);
        } else if self.worn && zeros >= self.config.zero_reading_threshold {
            info!("{zeros} zero readings in a row; sensor not worn");
            self.worn = false;
            actions.push(ConnectionAction::Notify(ConnectionNotice::WornChanged(false)));
        }

        actions.push(ConnectionAction::EmitSample(Sample {
            reading: Reading::new(measurement.bpm, now),
            rr_intervals_ms: measurement.rr_intervals_ms,
        }));
    }

    fn issue_connect(&mut self, target: DeviceId, attempt: Option<u32>, actions: &mut Actions) {
        if self.state == ConnectionState::Scanning {
            actions.push(ConnectionAction::StopScan);
        }
        actions.push(ConnectionAction::Connect(target.clone()));
        let next = match attempt {
            Some(attempt) => ConnectionState::Reconnecting { target, attempt },
            None => ConnectionState::Connecting { target },
        };
        self.transition(next, actions);
        self.arm_timer(TimerKind::ConnectTimeout, self.config.connect_timeout(), actions);
    }

    /// Counts a failed link against the reconnect budget and either schedules
    /// the next attempt or gives up and returns to open scanning.
    fn schedule_reconnect(&mut self, target: DeviceId, actions: &mut Actions) {
        self.worn = false;
        let attempts = self
            .record
            .as_ref()
            .map(|record| record.reconnect_attempts)
            .unwrap_or(0);

        if attempts >= self.config.max_reconnect_attempts || self.selected.as_ref() != Some(&target) {
            self.cancel_timer(actions);
            self.record = None;
            self.selected = None;
            if attempts >= self.config.max_reconnect_attempts {
                warn!("reconnect budget exhausted for {target} after {attempts} attempts");
                self.notify_failure(
                    ConnectionError::ReconnectExhausted {
                        device: target,
                        attempts,
                    },
                    actions,
                );
            }
            self.transition(ConnectionState::Idle, actions);
            self.begin_scanning(actions);
            return;
        }

        self.transition(ConnectionState::Disconnected { target }, actions);
        self.arm_timer(TimerKind::ReconnectDelay, self.config.reconnect_delay(), actions);
    }

    /// Disconnects a device that turned out not to be a heart-rate source.
    fn reject_device(&mut self, error: ConnectionError, actions: &mut Actions) {
        if let Some(target) = self.state.target().cloned() {
            warn!("{error}; disconnecting");
            self.tear_down_link(&target, actions);
        }
        self.selected = None;
        self.record = None;
        self.notify_failure(error, actions);
        self.begin_scanning(actions);
    }

    fn tear_down_link(&mut self, target: &DeviceId, actions: &mut Actions) {
        self.cancel_timer(actions);
        actions.push(ConnectionAction::CancelConnection(target.clone()));
        actions.push(ConnectionAction::ClearReading);
        self.expected_disconnect = Some(target.clone());
        self.worn = false;
        self.transition(ConnectionState::Idle, actions);
    }

    fn begin_scanning(&mut self, actions: &mut Actions) {
        if self.backgrounded {
            self.resume_scan = true;
            self.transition(ConnectionState::Idle, actions);
            return;
        }
        if self.state != ConnectionState::Scanning {
            actions.push(ConnectionAction::StartScan);
            self.transition(ConnectionState::Scanning, actions);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, after: Duration, actions: &mut Actions) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.timer = Some((generation, kind));
        actions.push(ConnectionAction::ArmTimer {
            generation,
            kind,
            after,
        });
    }

    fn cancel_timer(&mut self, actions: &mut Actions) {
        if self.timer.take().is_some() {
            actions.push(ConnectionAction::CancelTimer);
        }
    }

    fn stage_of(&self, device: &DeviceId) -> Option<LinkStage> {
        match &self.state {
            ConnectionState::Connected { target, stage } if target == device => Some(*stage),
            _ => None,
        }
    }

    fn set_stage(&mut self, next: LinkStage) {
        if let ConnectionState::Connected { stage, .. } = &mut self.state {
            *stage = next;
        }
    }

    fn notify_failure(&self, error: ConnectionError, actions: &mut Actions) {
        actions.push(ConnectionAction::Notify(ConnectionNotice::Failed(error)));
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Actions) {
        let before = self.state.status();
        self.state = next;
        let after = self.state.status();
        if before != after {
            actions.push(ConnectionAction::Notify(ConnectionNotice::StatusChanged(after)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::protocol::{encode_measurement, HeartRateMeasurement};

    fn device() -> DeviceId {
        DeviceId::new("polar-h10")
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: 3,
            zero_reading_threshold: 3,
            ..ConnectionConfig::default()
        }
    }

    fn armed(actions: &[ConnectionAction]) -> Option<(u64, TimerKind)> {
        actions.iter().rev().find_map(|action| match action {
            ConnectionAction::ArmTimer {
                generation, kind, ..
            } => Some((*generation, *kind)),
            _ => None,
        })
    }

    fn frame(bpm: u16) -> CentralEvent {
        CentralEvent::Notification {
            device: device(),
            characteristic: HEART_RATE_MEASUREMENT,
            value: encode_measurement(&HeartRateMeasurement::new(bpm)),
        }
    }

    fn samples(actions: &[ConnectionAction]) -> Vec<u16> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConnectionAction::EmitSample(sample) => Some(sample.reading.value),
                _ => None,
            })
            .collect()
    }

    /// Drives a machine through connect → services → characteristic.
    fn streaming_machine(now: Instant) -> (ConnectionMachine, Option<(u64, TimerKind)>) {
        let mut machine = ConnectionMachine::new(config());
        machine.start_scan();
        machine.connect(device(), false).unwrap();
        machine.handle_event(CentralEvent::Connected(device()), now);
        machine.handle_event(
            CentralEvent::ServicesDiscovered {
                device: device(),
                services: vec![HEART_RATE_SERVICE],
            },
            now,
        );
        let actions = machine.handle_event(
            CentralEvent::CharacteristicsDiscovered {
                device: device(),
                service: HEART_RATE_SERVICE,
                characteristics: vec![HEART_RATE_MEASUREMENT],
            },
            now,
        );
        assert!(actions.contains(&ConnectionAction::Subscribe(device())));
        let timer = armed(&actions);
        (machine, timer)
    }

    #[test]
    fn discovery_accepts_service_or_name_match() {
        let mut machine = ConnectionMachine::new(config());
        machine.start_scan();

        let by_service = Advertisement {
            device: DeviceId::new("a"),
            name: None,
            services: vec![HEART_RATE_SERVICE],
            rssi: Some(-60),
        };
        let by_name = Advertisement {
            device: DeviceId::new("b"),
            name: Some("Wahoo TICKR".into()),
            services: vec![],
            rssi: None,
        };
        let unrelated = Advertisement {
            device: DeviceId::new("c"),
            name: Some("Soundbar".into()),
            services: vec![],
            rssi: None,
        };

        let now = Instant::now();
        for adv in [by_service, by_name, unrelated] {
            machine.handle_event(CentralEvent::Discovered(adv), now);
        }
        let ids: Vec<&str> = machine.candidates().iter().map(|c| c.device.0.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn busy_device_is_rejected_before_connecting() {
        let mut machine = ConnectionMachine::new(config());
        machine.start_scan();
        let err = machine.connect(device(), true).unwrap_err();
        assert_eq!(err, ConnectionError::DeviceBusy(device()));
        assert_eq!(machine.status(), ConnectionStatus::Scanning);
    }

    #[test]
    fn missing_service_disconnects_and_rescans() {
        let mut machine = ConnectionMachine::new(config());
        let now = Instant::now();
        machine.connect(device(), false).unwrap();
        machine.handle_event(CentralEvent::Connected(device()), now);
        let actions = machine.handle_event(
            CentralEvent::ServicesDiscovered {
                device: device(),
                services: vec![],
            },
            now,
        );
        assert!(actions.contains(&ConnectionAction::CancelConnection(device())));
        assert!(actions.contains(&ConnectionAction::StartScan));
        assert!(actions.contains(&ConnectionAction::Notify(ConnectionNotice::Failed(
            ConnectionError::ServiceMissing(device())
        ))));
        assert_eq!(machine.status(), ConnectionStatus::Scanning);

        // The disconnect callback for our own teardown is not a link loss.
        let actions = machine.handle_event(
            CentralEvent::Disconnected {
                device: device(),
                reason: None,
            },
            now,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let now = Instant::now();
        let (mut machine, _) = streaming_machine(now);
        let actions = machine.handle_event(
            CentralEvent::Notification {
                device: device(),
                characteristic: HEART_RATE_MEASUREMENT,
                value: vec![0x01, 0x48],
            },
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn non_zero_samples_rearm_watchdog() {
        let now = Instant::now();
        let (mut machine, first) = streaming_machine(now);
        let actions = machine.handle_event(frame(72), now);
        assert_eq!(samples(&actions), vec![72]);
        let second = armed(&actions).unwrap();
        assert_eq!(second.1, TimerKind::Watchdog);
        assert_ne!(Some(second), first);

        // The replaced watchdog is stale.
        let (generation, kind) = first.unwrap();
        assert!(machine.handle_timer(generation, kind).is_empty());

        let actions = machine.handle_event(frame(0), now);
        assert_eq!(samples(&actions), vec![0]);
        assert_eq!(armed(&actions), None);
    }

    #[test]
    fn watchdog_tears_down_and_rediscovers() {
        let now = Instant::now();
        let (mut machine, timer) = streaming_machine(now);
        let (generation, kind) = timer.unwrap();
        let actions = machine.handle_timer(generation, kind);
        assert!(actions.contains(&ConnectionAction::CancelConnection(device())));
        assert!(actions.contains(&ConnectionAction::StartScan));
        assert_eq!(machine.status(), ConnectionStatus::Scanning);

        let actions = machine.handle_event(
            CentralEvent::Discovered(Advertisement {
                device: device(),
                name: Some("Polar H10".into()),
                services: vec![],
                rssi: None,
            }),
            now,
        );
        assert!(actions.contains(&ConnectionAction::Connect(device())));
    }

    #[test]
    fn consecutive_zeros_mark_sensor_not_worn_without_disconnect() {
        let now = Instant::now();
        let (mut machine, _) = streaming_machine(now);
        let mut notices = Vec::new();
        for bpm in [0, 0, 0, 0, 80] {
            for action in machine.handle_event(frame(bpm), now) {
                if let ConnectionAction::Notify(ConnectionNotice::WornChanged(worn)) = action {
                    notices.push(worn);
                }
            }
        }
        assert_eq!(notices, vec![false, true]);
        assert_eq!(machine.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn reconnect_gives_up_after_max_attempts() {
        let now = Instant::now();
        let (mut machine, _) = streaming_machine(now);
        let mut actions = machine.handle_event(
            CentralEvent::Disconnected {
                device: device(),
                reason: Some("out of range".into()),
            },
            now,
        );
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);

        let mut connects = 0;
        loop {
            let Some((generation, kind)) = armed(&actions) else {
                break;
            };
            assert_eq!(kind, TimerKind::ReconnectDelay);
            actions = machine.handle_timer(generation, kind);
            if actions.contains(&ConnectionAction::Connect(device())) {
                connects += 1;
            }
            actions = machine.handle_event(
                CentralEvent::ConnectFailed {
                    device: device(),
                    reason: "unreachable".into(),
                },
                now,
            );
            assert!(connects <= 3, "scheduled more attempts than the budget");
        }

        assert_eq!(connects, 3);
        assert_eq!(machine.status(), ConnectionStatus::Scanning);
        assert!(machine.record().is_none());
        assert!(actions.iter().any(|action| matches!(
            action,
            ConnectionAction::Notify(ConnectionNotice::Failed(err)) if err.is_terminal()
        )));
    }

    #[test]
    fn stale_reconnect_for_other_target_is_discarded() {
        let now = Instant::now();
        let (mut machine, _) = streaming_machine(now);
        let actions = machine.handle_event(
            CentralEvent::Disconnected {
                device: device(),
                reason: None,
            },
            now,
        );
        let (generation, kind) = armed(&actions).unwrap();
        assert_eq!(kind, TimerKind::ReconnectDelay);

        let other = DeviceId::new("wahoo-tickr");
        let actions = machine.connect(other.clone(), false).unwrap();
        assert!(actions.contains(&ConnectionAction::Connect(other.clone())));
        assert_eq!(machine.selected(), Some(&other));

        let actions = machine.handle_timer(generation, kind);
        assert!(actions.is_empty());
        assert_eq!(
            machine.state(),
            &ConnectionState::Connecting { target: other }
        );
    }

    #[test]
    fn link_loss_after_timed_out_attempt_still_reconnects() {
        let now = Instant::now();
        let mut machine = ConnectionMachine::new(config());
        let actions = machine.connect(device(), false).unwrap();
        let (generation, kind) = armed(&actions).unwrap();

        // The cancelled attempt never reports a disconnect.
        let actions = machine.handle_timer(generation, kind);
        let (generation, kind) = armed(&actions).unwrap();
        let actions = machine.handle_timer(generation, kind);
        assert!(actions.contains(&ConnectionAction::Connect(device())));

        machine.handle_event(CentralEvent::Connected(device()), now);
        machine.handle_event(
            CentralEvent::ServicesDiscovered {
                device: device(),
                services: vec![HEART_RATE_SERVICE],
            },
            now,
        );
        machine.handle_event(
            CentralEvent::CharacteristicsDiscovered {
                device: device(),
                service: HEART_RATE_SERVICE,
                characteristics: vec![HEART_RATE_MEASUREMENT],
            },
            now,
        );
        assert_eq!(samples(&machine.handle_event(frame(80), now)), vec![80]);

        let actions = machine.handle_event(
            CentralEvent::Disconnected {
                device: device(),
                reason: Some("out of range".into()),
            },
            now,
        );
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            armed(&actions).map(|(_, kind)| kind),
            Some(TimerKind::ReconnectDelay)
        );
    }

    #[test]
    fn user_disconnect_skips_reconnection() {
        let now = Instant::now();
        let (mut machine, _) = streaming_machine(now);
        let actions = machine.disconnect();
        assert!(actions.contains(&ConnectionAction::CancelConnection(device())));
        assert!(actions.contains(&ConnectionAction::CancelTimer));
        assert!(machine.record().is_none());
        assert_eq!(machine.status(), ConnectionStatus::Idle);

        let actions = machine.handle_event(
            CentralEvent::Disconnected {
                device: device(),
                reason: None,
            },
            now,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn connect_timeout_counts_against_budget() {
        let mut machine = ConnectionMachine::new(config());
        let actions = machine.connect(device(), false).unwrap();
        let (generation, kind) = armed(&actions).unwrap();
        assert_eq!(kind, TimerKind::ConnectTimeout);

        let actions = machine.handle_timer(generation, kind);
        assert!(actions.contains(&ConnectionAction::CancelConnection(device())));
        assert_eq!(armed(&actions).map(|(_, kind)| kind), Some(TimerKind::ReconnectDelay));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn background_pauses_and_resumes_scanning() {
        let mut machine = ConnectionMachine::new(config());
        machine.start_scan();
        let actions = machine.enter_background();
        assert!(actions.contains(&ConnectionAction::StopScan));
        assert_eq!(machine.status(), ConnectionStatus::Idle);

        let actions = machine.enter_foreground();
        assert!(actions.contains(&ConnectionAction::StartScan));
        assert_eq!(machine.status(), ConnectionStatus::Scanning);
    }
}
