//! Decoder for the shairport-sync AirPlay metadata stream.
//!
//! A [`FrameReader`](transport::FrameReader) supplies bytes from the metadata
//! FIFO (or a UDP multicast fallback), a [`FrameParser`](parser::FrameParser)
//! reassembles them into discrete items across either framing convention, and
//! [`NowPlayingService`] runs both on a background thread, maintaining the
//! mutex-guarded "now playing" snapshot that consumers poll.

pub mod artwork;
pub mod config;
pub mod decoder;
pub mod error;
pub mod parser;
pub mod process;
pub mod snapshot;
pub mod transport;

pub use config::{Config, FramingMode, TransportKind};
pub use decoder::NowPlayingService;
pub use error::DecoderError;
pub use process::{FixedProbe, PgrepProbe, ProcessProbe};
pub use snapshot::{DecoderStats, NowPlayingSnapshot, NOT_PLAYING};
