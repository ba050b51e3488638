pub mod central;
pub mod controller;
pub mod machine;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod synthetic;

pub use central::{Advertisement, CentralEvent, DeviceId, SensorCentral};
pub use controller::ConnectionController;
pub use machine::{
    ConnectionError, ConnectionMachine, ConnectionNotice, ConnectionState, ConnectionStatus,
};
pub use protocol::{decode_measurement, DecodeError, HeartRateMeasurement};
pub use synthetic::{SyntheticCentral, SyntheticProfile};
