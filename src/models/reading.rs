//! Heart-rate reading data model.
//!
//! A reading is a single decoded BPM value stamped with the monotonic instant it
//! arrived. A value of 0 means the sensor reported no detectable pulse, which is
//! not the same as having no reading at all (`None`).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub value: u16,
    pub timestamp: Instant,
    pub received_at: DateTime<Utc>,
    pub session_relative_time: Option<Duration>,
}

impl Reading {
    pub fn new(value: u16, timestamp: Instant) -> Self {
        Self {
            value,
            timestamp,
            received_at: Utc::now(),
            session_relative_time: None,
        }
    }

    /// True when the sensor detected a pulse.
    pub fn has_pulse(&self) -> bool {
        self.value > 0
    }

    pub fn at_session_time(mut self, offset: Duration) -> Self {
        self.session_relative_time = Some(offset);
        self
    }

    pub fn restamped(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Capability returning whatever reading is current for the active feed
/// (local sensor or a remote shared session).
pub type ReadingSource = Arc<dyn Fn() -> Option<Reading> + Send + Sync>;

pub fn no_reading_source() -> ReadingSource {
    Arc::new(|| None)
}

pub fn fixed_reading_source(value: u16) -> ReadingSource {
    Arc::new(move || Some(Reading::new(value, Instant::now())))
}
