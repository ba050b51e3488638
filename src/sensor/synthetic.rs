//! Non-hardware heart-rate source.
//!
//! Behaves like a single strap in range: answers discovery and connection
//! requests, then streams encoded 0x2A37 frames (with RR intervals) at 1 Hz
//! from a bounded random walk, so the whole decode path is exercised.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    central::{Advertisement, CentralEvent, CentralEventSender, DeviceId, SensorCentral},
    protocol::{encode_measurement, HeartRateMeasurement, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE},
};

const FRAME_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct SyntheticProfile {
    pub resting_bpm: u16,
    pub peak_bpm: u16,
    /// Largest per-frame change in BPM.
    pub max_step: u16,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            resting_bpm: 62,
            peak_bpm: 178,
            max_step: 4,
        }
    }
}

pub struct SyntheticCentral {
    device: DeviceId,
    profile: SyntheticProfile,
    events: CentralEventSender,
    runtime: Handle,
    streams: Mutex<HashMap<DeviceId, CancellationToken>>,
}

impl SyntheticCentral {
    /// Must be called from within a tokio runtime.
    pub fn new(events: CentralEventSender, profile: SyntheticProfile) -> Self {
        Self {
            device: DeviceId::new(Uuid::new_v4().to_string()),
            profile,
            events,
            runtime: Handle::current(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<DeviceId, CancellationToken>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }
}

/// Next value of the bounded random walk, biased back toward the middle of
/// the profile's range.
fn next_bpm<R: Rng>(rng: &mut R, current: u16, profile: &SyntheticProfile) -> u16 {
    let mid = (profile.resting_bpm + profile.peak_bpm) / 2;
    let step = profile.max_step as i32;
    let bias = if current < mid { 1 } else { -1 };
    let delta = rng.gen_range(-step..=step) + bias;
    (current as i32 + delta).clamp(profile.resting_bpm as i32, profile.peak_bpm as i32) as u16
}

fn rr_for<R: Rng>(rng: &mut R, bpm: u16) -> Vec<f64> {
    let base = 60_000.0 / bpm.max(1) as f64;
    vec![base + rng.gen_range(-25.0..25.0)]
}

impl SensorCentral for SyntheticCentral {
    fn start_scan(&self) {
        self.emit(CentralEvent::Discovered(Advertisement {
            device: self.device.clone(),
            name: Some("Synthetic HRM".into()),
            services: vec![HEART_RATE_SERVICE],
            rssi: Some(-50),
        }));
    }

    fn stop_scan(&self) {}

    fn is_connected_elsewhere(&self, _device: &DeviceId) -> bool {
        false
    }

    fn connect(&self, device: &DeviceId) {
        if *device == self.device {
            self.emit(CentralEvent::Connected(device.clone()));
        } else {
            self.emit(CentralEvent::ConnectFailed {
                device: device.clone(),
                reason: "unknown peripheral".into(),
            });
        }
    }

    fn cancel_connection(&self, device: &DeviceId) {
        if let Some(token) = self.streams().remove(device) {
            token.cancel();
        }
        self.emit(CentralEvent::Disconnected {
            device: device.clone(),
            reason: None,
        });
    }

    fn discover_services(&self, device: &DeviceId, _services: &[Uuid]) {
        self.emit(CentralEvent::ServicesDiscovered {
            device: device.clone(),
            services: vec![HEART_RATE_SERVICE],
        });
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, _characteristics: &[Uuid]) {
        self.emit(CentralEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service,
            characteristics: vec![HEART_RATE_MEASUREMENT],
        });
    }

    fn subscribe(&self, device: &DeviceId, characteristic: Uuid) {
        let token = CancellationToken::new();
        if let Some(previous) = self.streams().insert(device.clone(), token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        let device = device.clone();
        let profile = self.profile;
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            let mut bpm = profile.resting_bpm + 10;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = {
                            let mut rng = rand::thread_rng();
                            bpm = next_bpm(&mut rng, bpm, &profile);
                            let mut measurement = HeartRateMeasurement::new(bpm);
                            measurement.sensor_contact = Some(true);
                            measurement.rr_intervals_ms = rr_for(&mut rng, bpm);
                            encode_measurement(&measurement)
                        };
                        let event = CentralEvent::Notification {
                            device: device.clone(),
                            characteristic,
                            value: frame,
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }
}
