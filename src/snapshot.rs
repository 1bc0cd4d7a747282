use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Sentinel title used while nothing is playing.
pub const NOT_PLAYING: &str = "Not Playing";

/// The authoritative "now playing" state.
///
/// Owned by the decode pipeline; consumers always receive a clone taken under
/// the lock, never a reference into shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowPlayingSnapshot {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Path of the persisted artwork file, once one has been written.
    pub artwork_ref: Option<PathBuf>,
    /// Recorded on behalf of the UI layer; the decoder never derives it.
    pub background_color: Option<String>,
    pub volume_percent: Option<f32>,
    pub progress_fraction: Option<f32>,
    /// Wall-clock time of the last accepted metadata item.
    pub last_update: Option<SystemTime>,
}

impl Default for NowPlayingSnapshot {
    fn default() -> Self {
        Self {
            title: NOT_PLAYING.to_string(),
            artist: None,
            album: None,
            artwork_ref: None,
            background_color: None,
            volume_percent: None,
            progress_fraction: None,
            last_update: None,
        }
    }
}

/// Diagnostic counters for the decode pipeline. Recoverable errors land here
/// instead of propagating to snapshot readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecoderStats {
    pub parse_failures: u64,
    pub field_failures: u64,
    pub artwork_failures: u64,
    pub transport_retries: u64,
    pub last_transport_error: Option<String>,
}
