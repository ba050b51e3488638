pub mod controller;
pub mod cue;
pub mod state;

pub use controller::SessionController;
pub use cue::{CueSink, LogCueSink, RecordingCueSink};
pub use state::{PresetPhase, SessionEvent, SessionSnapshot, SessionState, SessionStatus};
