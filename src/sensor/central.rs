//! Boundary between the connection state machine and a Bluetooth stack.
//!
//! Requests go out through [`SensorCentral`] and return immediately; results
//! come back later as [`CentralEvent`]s on the channel the central was built
//! with, whatever thread the stack calls back on.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub device: DeviceId,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    Discovered(Advertisement),
    Connected(DeviceId),
    ConnectFailed {
        device: DeviceId,
        reason: String,
    },
    Disconnected {
        device: DeviceId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        device: DeviceId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        device: DeviceId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Notification {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl CentralEvent {
    pub fn device(&self) -> &DeviceId {
        match self {
            CentralEvent::Discovered(adv) => &adv.device,
            CentralEvent::Connected(device) => device,
            CentralEvent::ConnectFailed { device, .. }
            | CentralEvent::Disconnected { device, .. }
            | CentralEvent::ServicesDiscovered { device, .. }
            | CentralEvent::CharacteristicsDiscovered { device, .. }
            | CentralEvent::Notification { device, .. } => device,
        }
    }
}

pub type CentralEventSender = mpsc::UnboundedSender<CentralEvent>;
pub type CentralEventReceiver = mpsc::UnboundedReceiver<CentralEvent>;

pub fn central_channel() -> (CentralEventSender, CentralEventReceiver) {
    mpsc::unbounded_channel()
}

pub trait SensorCentral: Send + Sync {
    fn start_scan(&self);
    fn stop_scan(&self);
    /// Link-state probe: true when the peripheral is held by another
    /// controller and cannot be connected from here.
    fn is_connected_elsewhere(&self, device: &DeviceId) -> bool;
    fn connect(&self, device: &DeviceId);
    fn cancel_connection(&self, device: &DeviceId);
    fn discover_services(&self, device: &DeviceId, services: &[Uuid]);
    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, characteristics: &[Uuid]);
    fn subscribe(&self, device: &DeviceId, characteristic: Uuid);
}
