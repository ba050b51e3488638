//! In-memory [`SensorCentral`] for tests and offline development.
//!
//! In responsive mode every request is answered immediately with the event a
//! well-behaved heart-rate strap would produce.

use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
};

use uuid::Uuid;

use super::{
    central::{Advertisement, CentralEvent, CentralEventSender, DeviceId, SensorCentral},
    protocol::{encode_measurement, HeartRateMeasurement, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartScan,
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId),
    Subscribe(DeviceId),
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    advertisements: Vec<Advertisement>,
    busy: HashSet<DeviceId>,
    responsive: bool,
    services: Option<Vec<Uuid>>,
}

pub struct MockCentral {
    events: CentralEventSender,
    state: Mutex<MockState>,
}

impl MockCentral {
    /// Records calls but never answers them.
    pub fn silent(events: CentralEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn responsive(events: CentralEventSender) -> Self {
        let central = Self::silent(events);
        central.set_responsive(true);
        central
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.state().responsive = responsive;
    }

    pub fn set_busy(&self, device: &DeviceId, busy: bool) {
        let mut state = self.state();
        if busy {
            state.busy.insert(device.clone());
        } else {
            state.busy.remove(device);
        }
    }

    /// Services reported on discovery; defaults to the heart rate service.
    pub fn set_services(&self, services: Vec<Uuid>) {
        self.state().services = Some(services);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    pub fn advertise(&self, adv: Advertisement) {
        self.state().advertisements.push(adv.clone());
        self.emit(CentralEvent::Discovered(adv));
    }

    pub fn notify(&self, device: &DeviceId, bpm: u16, rr_intervals_ms: &[f64]) {
        let mut measurement = HeartRateMeasurement::new(bpm);
        measurement.rr_intervals_ms = rr_intervals_ms.to_vec();
        self.emit(CentralEvent::Notification {
            device: device.clone(),
            characteristic: HEART_RATE_MEASUREMENT,
            value: encode_measurement(&measurement),
        });
    }

    pub fn drop_link(&self, device: &DeviceId) {
        self.emit(CentralEvent::Disconnected {
            device: device.clone(),
            reason: Some("connection timed out".into()),
        });
    }

    fn record(&self, call: MockCall) -> bool {
        let mut state = self.state();
        state.calls.push(call);
        state.responsive
    }
}

impl SensorCentral for MockCentral {
    fn start_scan(&self) {
        if self.record(MockCall::StartScan) {
            let advertisements = self.state().advertisements.clone();
            for adv in advertisements {
                self.emit(CentralEvent::Discovered(adv));
            }
        }
    }

    fn stop_scan(&self) {
        self.record(MockCall::StopScan);
    }

    fn is_connected_elsewhere(&self, device: &DeviceId) -> bool {
        self.state().busy.contains(device)
    }

    fn connect(&self, device: &DeviceId) {
        if self.record(MockCall::Connect(device.clone())) {
            self.emit(CentralEvent::Connected(device.clone()));
        }
    }

    fn cancel_connection(&self, device: &DeviceId) {
        if self.record(MockCall::CancelConnection(device.clone())) {
            self.emit(CentralEvent::Disconnected {
                device: device.clone(),
                reason: None,
            });
        }
    }

    fn discover_services(&self, device: &DeviceId, _services: &[Uuid]) {
        if self.record(MockCall::DiscoverServices(device.clone())) {
            let services = self
                .state()
                .services
                .clone()
                .unwrap_or_else(|| vec![HEART_RATE_SERVICE]);
            self.emit(CentralEvent::ServicesDiscovered {
                device: device.clone(),
                services,
            });
        }
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, _characteristics: &[Uuid]) {
        if self.record(MockCall::DiscoverCharacteristics(device.clone())) {
            self.emit(CentralEvent::CharacteristicsDiscovered {
                device: device.clone(),
                service,
                characteristics: vec![HEART_RATE_MEASUREMENT],
            });
        }
    }

    fn subscribe(&self, device: &DeviceId, _characteristic: Uuid) {
        self.record(MockCall::Subscribe(device.clone()));
    }
}
