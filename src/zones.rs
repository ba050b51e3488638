//! Heart-rate zone classification.
//!
//! A zone configuration is five contiguous integer BPM bands. It is loaded once
//! and never changes while in use.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::models::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Zone {
    Zone1,
    Zone2,
    Zone3,
    Zone4,
    Zone5,
}

impl Zone {
    pub const ALL: [Zone; 5] = [Zone::Zone1, Zone::Zone2, Zone::Zone3, Zone::Zone4, Zone::Zone5];

    pub fn number(&self) -> u8 {
        *self as u8 + 1
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBand {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfiguration {
    bands: [ZoneBand; 5],
}

/// Fraction of max heart rate where each zone starts.
const ZONE_FLOOR_PERCENT: [u32; 5] = [50, 60, 70, 80, 90];

impl ZoneConfiguration {
    pub fn new(bands: [ZoneBand; 5]) -> Result<Self> {
        let config = Self { bands };
        config.validate()?;
        Ok(config)
    }

    /// Standard percentage-of-max bands.
    pub fn from_max_heart_rate(max_heart_rate: u16) -> Result<Self> {
        let max = max_heart_rate as u32;
        let floor = |percent: u32| ((max * percent) / 100) as u16;

        let mut bands = [ZoneBand { min: 0, max: 0 }; 5];
        for (i, percent) in ZONE_FLOOR_PERCENT.iter().enumerate() {
            let upper = ZONE_FLOOR_PERCENT
                .get(i + 1)
                .map(|next| floor(*next))
                .unwrap_or(max_heart_rate);
            bands[i] = ZoneBand {
                min: floor(*percent),
                max: upper,
            };
        }
        Self::new(bands)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, band) in self.bands.iter().enumerate() {
            if band.min >= band.max {
                bail!("zone {} min {} must be below max {}", i + 1, band.min, band.max);
            }
            if let Some(next) = self.bands.get(i + 1) {
                if band.max > next.min {
                    bail!(
                        "zone {} max {} overlaps zone {} min {}",
                        i + 1,
                        band.max,
                        i + 2,
                        next.min
                    );
                }
            }
        }
        Ok(())
    }

    pub fn band(&self, zone: Zone) -> ZoneBand {
        self.bands[zone.index()]
    }

    pub fn max_heart_rate(&self) -> u16 {
        self.bands[4].max
    }

    /// Highest zone whose floor is at or below `bpm`. Readings under zone 1
    /// (including 0) have no zone; readings above max count as zone 5.
    pub fn classify(&self, bpm: u16) -> Option<Zone> {
        if bpm == 0 {
            return None;
        }
        Zone::ALL
            .iter()
            .rev()
            .find(|zone| self.bands[zone.index()].min <= bpm)
            .copied()
    }

    pub fn classify_reading(&self, reading: &Reading) -> Option<Zone> {
        self.classify(reading.value)
    }

    /// Time spent in each zone, crediting every sample with `sample_interval`.
    pub fn time_in_zones<'a, I>(&self, samples: I, sample_interval: Duration) -> [Duration; 5]
    where
        I: IntoIterator<Item = &'a Reading>,
    {
        let mut totals = [Duration::ZERO; 5];
        for reading in samples {
            if let Some(zone) = self.classify_reading(reading) {
                totals[zone.index()] += sample_interval;
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn percentage_bands_are_contiguous() {
        let config = ZoneConfiguration::from_max_heart_rate(190).unwrap();
        assert_eq!(config.band(Zone::Zone1), ZoneBand { min: 95, max: 114 });
        assert_eq!(config.band(Zone::Zone5), ZoneBand { min: 171, max: 190 });
        assert_eq!(config.max_heart_rate(), 190);
    }

    #[test]
    fn classifies_boundaries_into_upper_zone() {
        let config = ZoneConfiguration::from_max_heart_rate(200).unwrap();
        assert_eq!(config.classify(0), None);
        assert_eq!(config.classify(99), None);
        assert_eq!(config.classify(100), Some(Zone::Zone1));
        assert_eq!(config.classify(120), Some(Zone::Zone2));
        assert_eq!(config.classify(179), Some(Zone::Zone4));
        assert_eq!(config.classify(230), Some(Zone::Zone5));
    }

    #[test]
    fn rejects_overlapping_bands() {
        let mut bands = [
            ZoneBand { min: 100, max: 120 },
            ZoneBand { min: 120, max: 140 },
            ZoneBand { min: 140, max: 160 },
            ZoneBand { min: 160, max: 180 },
            ZoneBand { min: 180, max: 200 },
        ];
        assert!(ZoneConfiguration::new(bands).is_ok());

        bands[2].max = 165;
        assert!(ZoneConfiguration::new(bands).is_err());

        bands[2].max = 140;
        bands[3] = ZoneBand { min: 170, max: 170 };
        assert!(ZoneConfiguration::new(bands).is_err());
    }

    #[test]
    fn accumulates_time_in_zones() {
        let config = ZoneConfiguration::from_max_heart_rate(200).unwrap();
        let now = Instant::now();
        let samples: Vec<Reading> = [0, 105, 110, 150, 195]
            .iter()
            .map(|&bpm| Reading::new(bpm, now))
            .collect();

        let totals = config.time_in_zones(&samples, Duration::from_secs(1));
        assert_eq!(totals[0], Duration::from_secs(2));
        assert_eq!(totals[2], Duration::from_secs(1));
        assert_eq!(totals[4], Duration::from_secs(1));
        assert_eq!(totals.iter().sum::<Duration>(), Duration::from_secs(4));
    }
}
