use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::artwork::ArtworkStore;
use crate::config::Config;
use crate::error::DecoderError;
use crate::parser::{FrameParser, MetadataItem};
use crate::process::ProcessProbe;
use crate::snapshot::{DecoderStats, NowPlayingSnapshot, NOT_PLAYING};
use crate::transport::FrameReader;

/// Everything behind the lock: the snapshot itself, the monotonic freshness
/// clock, and the diagnostic counters.
struct Shared {
    snapshot: NowPlayingSnapshot,
    last_instant: Option<Instant>,
    stats: DecoderStats,
}

impl Shared {
    fn new() -> Self {
        Self {
            snapshot: NowPlayingSnapshot::default(),
            last_instant: None,
            stats: DecoderStats::default(),
        }
    }

    fn touch(&mut self, at: Instant) {
        self.last_instant = Some(at);
        self.snapshot.last_update = Some(SystemTime::now());
    }
}

/// Owns the decode pipeline: one background thread reading the transport,
/// parsing items and updating the snapshot, plus the read-side accessors.
///
/// Cloning shares the same pipeline, so a clone handed to a signal handler
/// controls the same worker.
#[derive(Clone)]
pub struct NowPlayingService {
    config: Config,
    probe: Arc<dyn ProcessProbe>,
    shared: Arc<RwLock<Shared>>,
    stop: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl NowPlayingService {
    pub fn new(config: Config, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            config,
            probe,
            shared: Arc::new(RwLock::new(Shared::new())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background decode loop. A second call while running is a
    /// no-op. Fails only on a fatal misconfiguration (transport path exists
    /// but is the wrong kind of file); a merely missing transport is retried
    /// from inside the loop.
    pub fn start(&self) -> Result<(), DecoderError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let mut reader = FrameReader::new(&self.config);
        match reader.open() {
            Ok(()) => {}
            Err(e @ DecoderError::Configuration(_)) => return Err(e),
            Err(e) => log::warn!("Transport not ready yet, will retry: {}", e),
        }

        self.stop.store(false, Ordering::Relaxed);
        let config = self.config.clone();
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        *worker = Some(std::thread::spawn(move || {
            run_pipeline(reader, config, shared, stop);
        }));
        Ok(())
    }

    /// Stop the background loop and wait for it to exit. A no-op when the
    /// loop is not running.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            self.stop.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                log::error!("Decode loop panicked");
            }
        }
    }

    /// Immutable copy of the current state. Never blocks on I/O and never fails.
    pub fn get_snapshot(&self) -> NowPlayingSnapshot {
        self.shared.read().snapshot.clone()
    }

    /// Diagnostic counters; recoverable pipeline errors surface here.
    pub fn stats(&self) -> DecoderStats {
        self.shared.read().stats.clone()
    }

    /// True iff the source process is running, the last accepted item is
    /// within the freshness window, and the snapshot carries real track
    /// identity (non-sentinel title plus artist or album). All three are
    /// required; a running process with stale metadata does not count.
    pub fn is_playing(&self) -> bool {
        if !self.probe.is_running(&self.config.source_process) {
            return false;
        }
        let guard = self.shared.read();
        let fresh = guard
            .last_instant
            .map(|t| t.elapsed() < self.config.freshness_window)
            .unwrap_or(false);
        fresh
            && guard.snapshot.title != NOT_PLAYING
            && (guard.snapshot.artist.is_some() || guard.snapshot.album.is_some())
    }

    /// Apply fields from a secondary recognition source. Refused while the
    /// primary AirPlay feed is playing, so the pipeline thread stays the
    /// single producer of truth whenever it has anything to say. Does not
    /// advance the freshness clock. Returns whether the fields were applied.
    pub fn submit_fallback(
        &self,
        title: &str,
        artist: Option<&str>,
        album: Option<&str>,
    ) -> bool {
        if self.is_playing() {
            log::debug!("Primary source active, ignoring fallback metadata");
            return false;
        }
        let mut guard = self.shared.write();
        if !title.trim().is_empty() {
            guard.snapshot.title = title.trim().to_string();
        }
        if let Some(artist) = artist.map(str::trim).filter(|s| !s.is_empty()) {
            guard.snapshot.artist = Some(artist.to_string());
        }
        if let Some(album) = album.map(str::trim).filter(|s| !s.is_empty()) {
            guard.snapshot.album = Some(album.to_string());
        }
        true
    }

    /// Record a background color derived externally from the artwork.
    pub fn set_background_color(&self, color: &str) {
        self.shared.write().snapshot.background_color = Some(color.to_string());
    }

    /// Return the snapshot to its defaults, e.g. after observing that the
    /// streaming process has exited.
    pub fn reset(&self) {
        let mut guard = self.shared.write();
        guard.snapshot = NowPlayingSnapshot::default();
        guard.last_instant = None;
        log::info!("Snapshot reset to defaults");
    }
}

/// The pipeline thread: read, parse, apply, check the stop flag, repeat.
/// Every wait is bounded by the configured poll timeout.
fn run_pipeline(
    mut reader: FrameReader,
    config: Config,
    shared: Arc<RwLock<Shared>>,
    stop: Arc<AtomicBool>,
) {
    log::info!("Metadata decode loop started");
    let mut parser = FrameParser::new(config.framing);
    let artwork = ArtworkStore::new(&config.artwork_dir);

    while !stop.load(Ordering::Relaxed) {
        if let Some(chunk) = reader.poll_chunk(config.poll_timeout) {
            for item in parser.push(&chunk.bytes) {
                apply_item(&shared, &artwork, item, chunk.captured_at);
            }
        }
        sync_stats(&shared, &reader, parser.failures());
    }
    log::info!("Metadata decode loop stopped");
}

/// Copy reader/parser counters into the shared stats when they moved.
fn sync_stats(shared: &RwLock<Shared>, reader: &FrameReader, parse_failures: u64) {
    {
        let guard = shared.read();
        if guard.stats.parse_failures == parse_failures
            && guard.stats.transport_retries == reader.retries()
        {
            return;
        }
    }
    let mut guard = shared.write();
    guard.stats.parse_failures = parse_failures;
    guard.stats.transport_retries = reader.retries();
    guard.stats.last_transport_error = reader.last_error().map(str::to_string);
}

/// Apply one decoded item to the snapshot. A field is only overwritten when
/// the new value is non-empty and parseable; anything else leaves the
/// previous value in place and, where it indicates a real decode problem,
/// bumps a counter.
fn apply_item(shared: &RwLock<Shared>, artwork: &ArtworkStore, item: MetadataItem, at: Instant) {
    match &item.code {
        b"minm" | b"asar" | b"asal" => apply_text(shared, &item, at),
        b"PICT" => apply_artwork(shared, artwork, &item, at),
        b"pvol" => match decode_volume(&item.payload) {
            Ok(Some(volume)) => {
                let mut guard = shared.write();
                guard.snapshot.volume_percent = Some(volume);
                guard.touch(at);
            }
            Ok(None) => {
                // Zero denominator means "unknown", not an error; the item
                // still counts as activity.
                shared.write().touch(at);
            }
            Err(e) => note_field_failure(shared, e),
        },
        b"prgr" => match decode_progress(&item.payload) {
            Ok(Some(progress)) => {
                let mut guard = shared.write();
                guard.snapshot.progress_fraction = Some(progress);
                guard.touch(at);
            }
            Ok(None) => {
                shared.write().touch(at);
            }
            Err(e) => note_field_failure(shared, e),
        },
        _ => {
            log::debug!(
                "Ignoring unrecognized code '{}' ({} bytes)",
                item.code_str(),
                item.payload.len()
            );
        }
    }
}

fn apply_text(shared: &RwLock<Shared>, item: &MetadataItem, at: Instant) {
    // Invalid UTF-8 sequences are replaced rather than rejected.
    let text = String::from_utf8_lossy(&item.payload);
    let text = text.trim();
    if text.is_empty() {
        log::debug!("Empty payload for '{}', keeping previous value", item.code_str());
        return;
    }
    let mut guard = shared.write();
    match &item.code {
        b"minm" => guard.snapshot.title = text.to_string(),
        b"asar" => guard.snapshot.artist = Some(text.to_string()),
        b"asal" => guard.snapshot.album = Some(text.to_string()),
        _ => unreachable!("caller matched the code"),
    }
    guard.touch(at);
}

fn apply_artwork(shared: &RwLock<Shared>, artwork: &ArtworkStore, item: &MetadataItem, at: Instant) {
    if item.payload.is_empty() {
        return;
    }
    // Derive the key and write the file before taking the write lock, so
    // snapshot readers are never blocked on disk I/O.
    let key = {
        let guard = shared.read();
        format!(
            "{}_{}_{}",
            guard.snapshot.artist.as_deref().unwrap_or("unknown"),
            guard.snapshot.album.as_deref().unwrap_or("unknown"),
            guard.snapshot.title
        )
    };
    match artwork.save(&key, &item.payload) {
        Ok(path) => {
            let mut guard = shared.write();
            guard.snapshot.artwork_ref = Some(path);
            guard.touch(at);
        }
        Err(e) => {
            log::error!("{}", e);
            shared.write().stats.artwork_failures += 1;
        }
    }
}

fn note_field_failure(shared: &RwLock<Shared>, e: DecoderError) {
    log::warn!("{}", e);
    shared.write().stats.field_failures += 1;
}

/// `pvol`: first byte is the denominator, the next three a big-endian
/// numerator; the volume is `numerator * 100 / (denominator * 0x1000000)`,
/// clamped to [0, 100]. A zero denominator decodes to "unknown".
fn decode_volume(payload: &[u8]) -> Result<Option<f32>, DecoderError> {
    if payload.len() < 4 {
        return Err(DecoderError::FieldDecode {
            code: "pvol".to_string(),
            reason: format!("expected 4 bytes, got {}", payload.len()),
        });
    }
    if payload[0] == 0 {
        return Ok(None);
    }
    let denominator = payload[0] as f64;
    let numerator = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]) as f64;
    let volume = numerator * 100.0 / (denominator * 16_777_216.0);
    Ok(Some(volume.clamp(0.0, 100.0) as f32))
}

/// `prgr`: three big-endian u32s (start, current, end); the fraction is
/// `(current - start) / (end - start)`, clamped to [0, 1]. A zero span
/// decodes to "unknown".
fn decode_progress(payload: &[u8]) -> Result<Option<f32>, DecoderError> {
    if payload.len() < 12 {
        return Err(DecoderError::FieldDecode {
            code: "prgr".to_string(),
            reason: format!("expected 12 bytes, got {}", payload.len()),
        });
    }
    let word = |i: usize| u32::from_be_bytes(payload[i..i + 4].try_into().unwrap());
    let (start, current, end) = (word(0), word(4), word(8));
    if end == start {
        return Ok(None);
    }
    let fraction = (current as f64 - start as f64) / (end as f64 - start as f64);
    Ok(Some(fraction.clamp(0.0, 1.0) as f32))
}
