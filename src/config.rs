use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Which transport the metadata stream arrives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Named pipe written by shairport-sync (the default).
    Fifo,
    /// Multicast UDP fallback; each datagram carries whole frames.
    Multicast,
}

/// How records are delimited within the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Probe the first bytes at startup: `<` means text, anything else binary.
    Auto,
    /// Fixed-header binary records.
    Binary,
    /// `<item>`-delimited text records.
    Text,
}

/// Decoder configuration, built once at startup and passed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the metadata FIFO.
    pub pipe_path: PathBuf,
    pub transport: TransportKind,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub framing: FramingMode,
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
    /// Delay before retrying a missing or inaccessible transport.
    pub retry_backoff: Duration,
    /// Delay before reopening the FIFO after the writer closed it.
    pub reopen_delay: Duration,
    /// Maximum age of the last accepted item before playback counts as inactive.
    pub freshness_window: Duration,
    /// Directory artwork payloads are written into.
    pub artwork_dir: PathBuf,
    /// Process name checked (via pgrep) for the is-playing decision.
    pub source_process: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipe_path: PathBuf::from("/tmp/shairport-sync-metadata"),
            transport: TransportKind::Fifo,
            multicast_group: Ipv4Addr::new(226, 0, 0, 154),
            multicast_port: 5555,
            framing: FramingMode::Auto,
            poll_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            reopen_delay: Duration::from_millis(250),
            freshness_window: Duration::from_secs(10),
            artwork_dir: PathBuf::from("static/artwork"),
            source_process: "shairport-sync".to_string(),
        }
    }
}

impl Config {
    /// Build a config from `AIRPIPE_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("AIRPIPE_PIPE") {
            config.pipe_path = PathBuf::from(path);
        }
        if let Ok(transport) = std::env::var("AIRPIPE_TRANSPORT") {
            match transport.as_str() {
                "fifo" => config.transport = TransportKind::Fifo,
                "multicast" => config.transport = TransportKind::Multicast,
                other => log::warn!("Unknown AIRPIPE_TRANSPORT '{}', using fifo", other),
            }
        }
        if let Ok(group) = std::env::var("AIRPIPE_GROUP") {
            match group.parse() {
                Ok(addr) => config.multicast_group = addr,
                Err(e) => log::warn!("Bad AIRPIPE_GROUP '{}': {}", group, e),
            }
        }
        if let Ok(port) = std::env::var("AIRPIPE_PORT") {
            match port.parse() {
                Ok(port) => config.multicast_port = port,
                Err(e) => log::warn!("Bad AIRPIPE_PORT '{}': {}", port, e),
            }
        }
        if let Ok(framing) = std::env::var("AIRPIPE_FRAMING") {
            match framing.as_str() {
                "auto" => config.framing = FramingMode::Auto,
                "binary" => config.framing = FramingMode::Binary,
                "text" => config.framing = FramingMode::Text,
                other => log::warn!("Unknown AIRPIPE_FRAMING '{}', using auto", other),
            }
        }
        if let Ok(secs) = std::env::var("AIRPIPE_FRESHNESS_SECS") {
            match secs.parse() {
                Ok(secs) => config.freshness_window = Duration::from_secs(secs),
                Err(e) => log::warn!("Bad AIRPIPE_FRESHNESS_SECS '{}': {}", secs, e),
            }
        }
        if let Ok(dir) = std::env::var("AIRPIPE_ARTWORK_DIR") {
            config.artwork_dir = PathBuf::from(dir);
        }
        if let Ok(name) = std::env::var("AIRPIPE_PROCESS") {
            config.source_process = name;
        }

        config
    }
}
