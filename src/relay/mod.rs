//! Remote sharing through a code-keyed relay.
//!
//! The relay stores the latest payload per 6-character share code. A sharer
//! pushes at most once per second; a viewer polls by code and feeds the
//! result into a session as its reading source.

pub mod memory;
pub mod sharing;
pub mod viewer;

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSnapshot;

pub use memory::MemoryRelay;
pub use sharing::{SharingSession, SharingStatus};
pub use viewer::RemoteViewer;

pub const SHARE_CODE_LEN: usize = 6;

/// Characters used for generated codes. Look-alikes (0/O, 1/I) are left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("no shared session for that code")]
    NotFound,
    #[error("relay rejected the sharing credentials")]
    Unauthorized,
    #[error("relay transport failure: {0}")]
    Transport(String),
    #[error("invalid share code '{0}'")]
    InvalidCode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareCode(String);

impl ShareCode {
    /// Accepts exactly six ASCII letters or digits, case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let trimmed = raw.trim();
        if trimmed.len() != SHARE_CODE_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RelayError::InvalidCode(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..SHARE_CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayPayload {
    pub latest_bpm: u16,
    pub max: Option<u16>,
    pub avg: Option<u16>,
    pub min: Option<u16>,
}

impl RelayPayload {
    /// Payload for the current reading and open segment. `None` until the
    /// session has a reading to share.
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        let latest_bpm = snapshot.current_bpm?;
        Some(Self {
            latest_bpm,
            max: snapshot.segment_stats.max,
            avg: snapshot.segment_stats.avg,
            min: snapshot.segment_stats.min,
        })
    }
}

/// Maps a relay HTTP-style response onto a payload or a classified error.
pub fn decode_response(status: u16, body: &[u8]) -> Result<RelayPayload, RelayError> {
    match status {
        200 => serde_json::from_slice(body)
            .map_err(|err| RelayError::Transport(format!("malformed payload: {err}"))),
        404 => Err(RelayError::NotFound),
        401 => Err(RelayError::Unauthorized),
        other => Err(RelayError::Transport(format!("unexpected status {other}"))),
    }
}

/// Blocking relay transport. Called from `spawn_blocking`.
pub trait RelayClient: Send + Sync + 'static {
    fn push(&self, code: &ShareCode, payload: &RelayPayload) -> Result<(), RelayError>;
    fn pull(&self, code: &ShareCode) -> Result<RelayPayload, RelayError>;
}
