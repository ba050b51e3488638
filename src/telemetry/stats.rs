//! Segment heart-rate aggregates and the RMSSD variability statistic.

use serde::{Deserialize, Serialize};

use crate::models::Reading;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentStats {
    pub avg: Option<u16>,
    pub max: Option<u16>,
    pub min: Option<u16>,
}

impl SegmentStats {
    pub fn is_empty(&self) -> bool {
        self.avg.is_none() && self.max.is_none() && self.min.is_none()
    }
}

/// Aggregates the readings of one segment window.
///
/// Zero readings (no detectable pulse) never contribute. When the window holds
/// no readings at all, every field falls back to `fallback` (the reading taken
/// when the segment closed). When it holds only zeros, avg/min are empty and
/// max uses the fallback.
pub fn segment_stats<'a, I>(samples: I, fallback: Option<&Reading>) -> SegmentStats
where
    I: IntoIterator<Item = &'a Reading>,
{
    let fallback_bpm = fallback.filter(|r| r.has_pulse()).map(|r| r.value);

    let mut seen = 0usize;
    let mut count = 0u64;
    let mut sum = 0u64;
    let mut max: Option<u16> = None;
    let mut min: Option<u16> = None;

    for reading in samples {
        seen += 1;
        if !reading.has_pulse() {
            continue;
        }
        count += 1;
        sum += reading.value as u64;
        max = Some(max.map_or(reading.value, |m| m.max(reading.value)));
        min = Some(min.map_or(reading.value, |m| m.min(reading.value)));
    }

    if seen == 0 {
        return SegmentStats {
            avg: fallback_bpm,
            max: fallback_bpm,
            min: fallback_bpm,
        };
    }

    if count == 0 {
        return SegmentStats {
            avg: None,
            max: fallback_bpm,
            min: None,
        };
    }

    SegmentStats {
        avg: Some(((sum as f64) / (count as f64)).round() as u16),
        max,
        min,
    }
}

/// Root-mean-square of successive differences over RR intervals in ms.
/// Defined only for two or more intervals.
pub fn rmssd_from_rr(rr_ms: &[f64]) -> Option<f64> {
    if rr_ms.len() < 2 {
        return None;
    }

    let sum_sq: f64 = rr_ms
        .windows(2)
        .map(|pair| {
            let diff = pair[1] - pair[0];
            diff * diff
        })
        .sum();

    Some((sum_sq / (rr_ms.len() - 1) as f64).sqrt())
}

/// RMSSD over a BPM series, using the implied RR interval `60000 / bpm` for
/// each non-zero sample.
pub fn rmssd_from_bpm(bpm: &[u16]) -> Option<f64> {
    let rr: Vec<f64> = bpm
        .iter()
        .filter(|&&value| value > 0)
        .map(|&value| 60_000.0 / value as f64)
        .collect();
    rmssd_from_rr(&rr)
}

/// Heart-rate recovery: BPM drop from `start` to `end`.
pub fn heart_rate_recovery(start: Option<&Reading>, end: Option<&Reading>) -> Option<i32> {
    let start = start.filter(|r| r.has_pulse())?;
    let end = end.filter(|r| r.has_pulse())?;
    Some(start.value as i32 - end.value as i32)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn readings(values: &[u16]) -> Vec<Reading> {
        let base = Instant::now();
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Reading::new(v, base + Duration::from_secs(i as u64)))
            .collect()
    }

    #[test]
    fn rmssd_of_constant_rate_is_zero() {
        assert_eq!(rmssd_from_bpm(&[60, 60, 60]), Some(0.0));
    }

    #[test]
    fn rmssd_of_doubling_rate() {
        let value = rmssd_from_bpm(&[60, 120]).unwrap();
        assert!((value - 500.0).abs() < 1e-9);
    }

    #[test]
    fn rmssd_needs_two_samples() {
        assert_eq!(rmssd_from_bpm(&[72]), None);
        assert_eq!(rmssd_from_bpm(&[0, 72]), None);
        assert_eq!(rmssd_from_rr(&[]), None);
    }

    #[test]
    fn zeros_are_excluded_from_average_and_min() {
        let samples = readings(&[0, 120, 0, 140, 130]);
        let stats = segment_stats(&samples, None);
        assert_eq!(stats.avg, Some(130));
        assert_eq!(stats.min, Some(120));
        assert_eq!(stats.max, Some(140));
    }

    #[test]
    fn all_zero_window_keeps_only_fallback_max() {
        let samples = readings(&[0, 0, 0]);
        let fallback = Reading::new(101, Instant::now());
        let stats = segment_stats(&samples, Some(&fallback));
        assert_eq!(stats.avg, None);
        assert_eq!(stats.min, None);
        assert_eq!(stats.max, Some(101));

        let stats = segment_stats(&samples, None);
        assert!(stats.is_empty());
    }

    #[test]
    fn empty_window_falls_back_to_closing_reading() {
        let fallback = Reading::new(88, Instant::now());
        let stats = segment_stats(std::iter::empty(), Some(&fallback));
        assert_eq!(
            stats,
            SegmentStats {
                avg: Some(88),
                max: Some(88),
                min: Some(88)
            }
        );

        let zero = Reading::new(0, Instant::now());
        assert!(segment_stats(std::iter::empty(), Some(&zero)).is_empty());
    }

    #[test]
    fn recovery_is_start_minus_end() {
        let now = Instant::now();
        let start = Reading::new(170, now);
        let end = Reading::new(122, now);
        assert_eq!(heart_rate_recovery(Some(&start), Some(&end)), Some(48));
        assert_eq!(heart_rate_recovery(Some(&start), None), None);
    }
}
