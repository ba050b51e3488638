pub mod preset;
pub mod reading;
pub mod set_record;
pub mod workout;

pub use preset::TimerPreset;
pub use reading::{fixed_reading_source, no_reading_source, Reading, ReadingSource};
pub use set_record::{SetKind, SetRecord};
pub use workout::{StoredSetRecord, WorkoutSummary};
