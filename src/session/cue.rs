use std::sync::Mutex;

use log::info;

/// Receives the one-shot cue fired when a preset work set finishes.
pub trait CueSink: Send + Sync {
    fn cue(&self, set_index: u32, audible: bool);
}

/// Writes cues to the log. Used when no audio/haptic output is attached.
#[derive(Debug, Default)]
pub struct LogCueSink;

impl CueSink for LogCueSink {
    fn cue(&self, set_index: u32, audible: bool) {
        if audible {
            info!("cue: work set {set_index} finished");
        }
    }
}

/// Keeps every cue it receives.
#[derive(Debug, Default)]
pub struct RecordingCueSink {
    cues: Mutex<Vec<(u32, bool)>>,
}

impl RecordingCueSink {
    pub fn cues(&self) -> Vec<(u32, bool)> {
        match self.cues.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CueSink for RecordingCueSink {
    fn cue(&self, set_index: u32, audible: bool) {
        let mut guard = match self.cues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((set_index, audible));
    }
}
