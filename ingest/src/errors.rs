use std::time::Duration;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T, E = IngestError> = std::result::Result<T, E>;

/// Errors that can occur while setting up or tearing down the proxy
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("setup step '{step}' failed after {attempts} attempts: {source}")]
    SetupFailed {
        step: &'static str,
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig { key: &'static str, message: String },

    #[error("failed to initialize self-reporting: {0}")]
    SelfReporting(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(String),

    #[error("data sink error: {0}")]
    Sink(#[from] SinkError),
}

/// A parse or validation failure for an incoming request body.
///
/// The message is returned verbatim as the HTTP 400 body.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("unable to read request body: {0}")]
    Body(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Errors surfaced by the async multi-token sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// Close was called; no further submissions are accepted.
    #[error("data sink is closed")]
    Closed,

    /// The queue stayed full until the producer gave up waiting.
    #[error("data sink queue is full")]
    QueueFull,

    #[error("sink workers still draining after {timeout:?}; {remaining} queued items discarded")]
    ShutdownTimeout { timeout: Duration, remaining: usize },
}
