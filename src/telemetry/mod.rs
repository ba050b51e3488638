pub mod stats;
pub mod store;

pub use stats::{heart_rate_recovery, rmssd_from_bpm, rmssd_from_rr, segment_stats, SegmentStats};
pub use store::{SampleStore, RETENTION_HORIZON};
