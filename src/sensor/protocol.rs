//! GATT Heart Rate Service wire format.
//!
//! Measurement frame layout (characteristic 0x2A37):
//!
//! | byte(s) | field                                                   |
//! |---------|---------------------------------------------------------|
//! | 0       | flags                                                   |
//! | 1 or 1-2| heart rate, u8 or u16 LE (flags bit 0)                  |
//! | +2      | energy expended, u16 LE, present when flags bit 3 is set|
//! | +2n     | RR intervals, u16 LE in 1/1024 s, when flags bit 4 is set|

use thiserror::Error;
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

pub const HEART_RATE_SERVICE: Uuid = short_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = short_uuid(0x2A37);

const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty heart-rate measurement frame")]
    Empty,
    #[error("frame truncated in {field}: need {needed} bytes, got {actual}")]
    Truncated {
        field: &'static str,
        needed: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    /// `None` when the sensor does not report skin contact.
    pub sensor_contact: Option<bool>,
    pub energy_expended: Option<u16>,
    pub rr_intervals_ms: Vec<f64>,
}

impl HeartRateMeasurement {
    pub fn new(bpm: u16) -> Self {
        Self {
            bpm,
            sensor_contact: None,
            energy_expended: None,
            rr_intervals_ms: Vec::new(),
        }
    }
}

pub fn rr_units_to_ms(units: u16) -> f64 {
    units as f64 / 1024.0 * 1000.0
}

fn ms_to_rr_units(ms: f64) -> u16 {
    (ms / 1000.0 * 1024.0).round().clamp(0.0, u16::MAX as f64) as u16
}

fn read_u16(frame: &[u8], offset: usize, field: &'static str) -> Result<u16, DecodeError> {
    match frame.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(DecodeError::Truncated {
            field,
            needed: offset + 2,
            actual: frame.len(),
        }),
    }
}

pub fn decode_measurement(frame: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let (&flags, _) = frame.split_first().ok_or(DecodeError::Empty)?;
    let mut offset = 1;

    let bpm = if flags & FLAG_HR_U16 != 0 {
        let value = read_u16(frame, offset, "heart_rate")?;
        offset += 2;
        value
    } else {
        let value = *frame.get(offset).ok_or(DecodeError::Truncated {
            field: "heart_rate",
            needed: offset + 1,
            actual: frame.len(),
        })?;
        offset += 1;
        value as u16
    };

    let sensor_contact = (flags & FLAG_CONTACT_SUPPORTED != 0)
        .then_some(flags & FLAG_CONTACT_DETECTED != 0);

    let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
        let value = read_u16(frame, offset, "energy_expended")?;
        offset += 2;
        Some(value)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & FLAG_RR_INTERVALS != 0 {
        while offset < frame.len() {
            let units = read_u16(frame, offset, "rr_interval")?;
            rr_intervals_ms.push(rr_units_to_ms(units));
            offset += 2;
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact,
        energy_expended,
        rr_intervals_ms,
    })
}

/// Inverse of [`decode_measurement`]; picks the 16-bit format only when the
/// rate does not fit in a byte.
pub fn encode_measurement(measurement: &HeartRateMeasurement) -> Vec<u8> {
    let mut flags = 0u8;
    let mut body = Vec::with_capacity(8);

    if measurement.bpm > u8::MAX as u16 {
        flags |= FLAG_HR_U16;
        body.extend_from_slice(&measurement.bpm.to_le_bytes());
    } else {
        body.push(measurement.bpm as u8);
    }

    if let Some(contact) = measurement.sensor_contact {
        flags |= FLAG_CONTACT_SUPPORTED;
        if contact {
            flags |= FLAG_CONTACT_DETECTED;
        }
    }

    if let Some(energy) = measurement.energy_expended {
        flags |= FLAG_ENERGY_EXPENDED;
        body.extend_from_slice(&energy.to_le_bytes());
    }

    if !measurement.rr_intervals_ms.is_empty() {
        flags |= FLAG_RR_INTERVALS;
        for &ms in &measurement.rr_intervals_ms {
            body.extend_from_slice(&ms_to_rr_units(ms).to_le_bytes());
        }
    }

    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(flags);
    frame.extend_from_slice(&body);
    frame
}

/// Vendor name fragments of monitors that only expose 0x180D after connecting.
pub const DEFAULT_MONITOR_NAME_FRAGMENTS: &[&str] = &[
    "polar", "wahoo", "tickr", "garmin", "hrm", "heart", "coospo", "moofit", "magene", "scosche",
    "rhythm", "suunto", "whoop",
];

pub fn looks_like_heart_rate_monitor<S: AsRef<str>>(name: &str, fragments: &[S]) -> bool {
    let lowered = name.to_lowercase();
    fragments
        .iter()
        .any(|fragment| lowered.contains(&fragment.as_ref().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_expand_against_bluetooth_base() {
        assert_eq!(
            HEART_RATE_SERVICE.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn decodes_8bit_rate() {
        let m = decode_measurement(&[0x00, 72]).unwrap();
        assert_eq!(m.bpm, 72);
        assert_eq!(m.sensor_contact, None);
        assert!(m.rr_intervals_ms.is_empty());
    }

    #[test]
    fn decodes_16bit_little_endian_rate() {
        let m = decode_measurement(&[0x01, 0x2C, 0x01]).unwrap();
        assert_eq!(m.bpm, 300);
    }

    #[test]
    fn decodes_rr_intervals_in_1024ths() {
        // contact supported + detected, rr present: 1024 units = 1000 ms, 512 = 500 ms
        let frame = [0x16, 60, 0x00, 0x04, 0x00, 0x02];
        let m = decode_measurement(&frame).unwrap();
        assert_eq!(m.bpm, 60);
        assert_eq!(m.sensor_contact, Some(true));
        assert_eq!(m.rr_intervals_ms, vec![1000.0, 500.0]);
    }

    #[test]
    fn skips_energy_expended_before_rr() {
        let frame = [0x18, 90, 0x10, 0x27, 0x00, 0x04];
        let m = decode_measurement(&frame).unwrap();
        assert_eq!(m.energy_expended, Some(10_000));
        assert_eq!(m.rr_intervals_ms, vec![1000.0]);
    }

    #[test]
    fn short_frames_fail() {
        assert_eq!(decode_measurement(&[]), Err(DecodeError::Empty));
        assert!(matches!(
            decode_measurement(&[0x00]),
            Err(DecodeError::Truncated { field: "heart_rate", .. })
        ));
        assert!(matches!(
            decode_measurement(&[0x01, 0x50]),
            Err(DecodeError::Truncated { field: "heart_rate", .. })
        ));
        assert!(matches!(
            decode_measurement(&[0x10, 70, 0x00]),
            Err(DecodeError::Truncated { field: "rr_interval", .. })
        ));
    }

    #[test]
    fn encoder_output_decodes_back() {
        let mut original = HeartRateMeasurement::new(301);
        original.sensor_contact = Some(false);
        original.rr_intervals_ms = vec![1000.0];
        let decoded = decode_measurement(&encode_measurement(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn name_heuristic_is_case_insensitive() {
        assert!(looks_like_heart_rate_monitor("Polar H10 8C4F", DEFAULT_MONITOR_NAME_FRAGMENTS));
        assert!(looks_like_heart_rate_monitor("TICKR X 1A2B", DEFAULT_MONITOR_NAME_FRAGMENTS));
        assert!(!looks_like_heart_rate_monitor("Kitchen Speaker", DEFAULT_MONITOR_NAME_FRAGMENTS));
    }
}
