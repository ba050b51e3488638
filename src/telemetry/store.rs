use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::models::Reading;

/// Readings older than this (relative to the newest reading) are evicted.
pub const RETENTION_HORIZON: Duration = Duration::from_secs(60 * 60);

/// Append-only, time-ordered buffer of readings with a rolling retention
/// window.
#[derive(Debug, Clone)]
pub struct SampleStore {
    samples: VecDeque<Reading>,
    retention: Duration,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore {
    pub fn new() -> Self {
        Self::with_retention(RETENTION_HORIZON)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    /// Appends a reading. Readings stamped earlier than the newest stored one
    /// are rejected so the buffer stays ordered; returns whether it was kept.
    pub fn push(&mut self, reading: Reading) -> bool {
        if let Some(last) = self.samples.back() {
            if reading.timestamp < last.timestamp {
                return false;
            }
        }
        self.samples.push_back(reading);
        self.evict_before(reading.timestamp);
        true
    }

    /// Drops everything older than the retention horizon measured from `now`.
    pub fn evict_before(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|reading| reading.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.samples.back()
    }

    /// Readings with `start <= timestamp <= end`.
    pub fn window(&self, start: Instant, end: Instant) -> impl Iterator<Item = &Reading> + '_ {
        let lo = self.samples.partition_point(|r| r.timestamp < start);
        let hi = self.samples.partition_point(|r| r.timestamp <= end).max(lo);
        self.samples.range(lo..hi)
    }

    pub fn since(&self, start: Instant) -> impl Iterator<Item = &Reading> + '_ {
        let lo = self.samples.partition_point(|r| r.timestamp < start);
        self.samples.range(lo..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> + '_ {
        self.samples.iter()
    }

    pub fn values(&self) -> Vec<u16> {
        self.samples.iter().map(|r| r.value).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: u64, value: u16) -> Reading {
        Reading::new(value, base + Duration::from_secs(secs))
    }

    #[test]
    fn window_is_inclusive_on_both_ends() {
        let base = Instant::now();
        let mut store = SampleStore::new();
        for secs in 0..10 {
            store.push(at(base, secs, 100 + secs as u16));
        }

        let values: Vec<u16> = store
            .window(base + Duration::from_secs(3), base + Duration::from_secs(5))
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![103, 104, 105]);
    }

    #[test]
    fn evicts_readings_past_retention() {
        let base = Instant::now();
        let mut store = SampleStore::with_retention(Duration::from_secs(5));
        for secs in 0..10 {
            store.push(at(base, secs, 120));
        }
        assert_eq!(store.len(), 6);
        assert_eq!(
            store.iter().next().map(|r| r.timestamp),
            Some(base + Duration::from_secs(4))
        );
    }

    #[test]
    fn rejects_out_of_order_readings() {
        let base = Instant::now();
        let mut store = SampleStore::new();
        assert!(store.push(at(base, 5, 90)));
        assert!(!store.push(at(base, 4, 91)));
        assert!(store.push(at(base, 5, 92)));
        assert_eq!(store.values(), vec![90, 92]);
    }
}
