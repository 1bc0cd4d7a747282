use thiserror::Error;

/// Errors raised inside the decode pipeline.
///
/// Everything except `Configuration` is recoverable: the pipeline absorbs it
/// locally with a log line and a counter bump, and callers of the snapshot
/// accessors never see it. `Configuration` is fatal at startup only.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Pipe or socket missing or inaccessible; retried with backoff.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Malformed header or undecodable item boundaries; the item is dropped.
    #[error("malformed frame: {0}")]
    FrameParse(String),

    /// A known code carried a payload that would not decode; the snapshot
    /// field keeps its previous value.
    #[error("could not decode field for code '{code}': {reason}")]
    FieldDecode { code: String, reason: String },

    /// Artwork bytes could not be persisted; artwork_ref keeps its previous value.
    #[error("artwork write failed: {0}")]
    ArtworkWrite(#[source] std::io::Error),

    /// The transport path exists but is the wrong kind of file. The decoder
    /// refuses to start rather than silently degrade.
    #[error("bad configuration: {0}")]
    Configuration(String),
}
