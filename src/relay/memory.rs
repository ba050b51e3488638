use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use super::{decode_response, RelayClient, RelayError, RelayPayload, ShareCode};

#[derive(Default)]
struct MemoryRelayState {
    bodies: HashMap<ShareCode, Vec<u8>>,
    revoked: HashSet<ShareCode>,
    failures_remaining: u32,
    pushes: u32,
}

/// In-process relay keyed by share code. Responses go through the same
/// status mapping as a networked relay.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<MemoryRelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryRelayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pushes for this code are answered with 401 from now on.
    pub fn revoke(&self, code: &ShareCode) {
        self.state().revoked.insert(code.clone());
    }

    /// The next `count` calls fail with a 503.
    pub fn fail_next(&self, count: u32) {
        self.state().failures_remaining = count;
    }

    /// Successful pushes so far.
    pub fn push_count(&self) -> u32 {
        self.state().pushes
    }

    fn respond(&self, status: u16, body: &[u8]) -> Result<RelayPayload, RelayError> {
        decode_response(status, body)
    }
}

impl RelayClient for MemoryRelay {
    fn push(&self, code: &ShareCode, payload: &RelayPayload) -> Result<(), RelayError> {
        let mut state = self.state();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            drop(state);
            return self.respond(503, b"").map(|_| ());
        }
        if state.revoked.contains(code) {
            drop(state);
            return self.respond(401, b"").map(|_| ());
        }
        let body = serde_json::to_vec(payload)
            .map_err(|err| RelayError::Transport(err.to_string()))?;
        state.bodies.insert(code.clone(), body);
        state.pushes += 1;
        Ok(())
    }

    fn pull(&self, code: &ShareCode) -> Result<RelayPayload, RelayError> {
        let mut state = self.state();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            drop(state);
            return self.respond(503, b"");
        }
        let response = match state.bodies.get(code) {
            Some(body) => (200, body.clone()),
            None => (404, Vec::new()),
        };
        drop(state);
        self.respond(response.0, &response.1)
    }
}
