//! Error types for every stage of the ingest pipeline.
//!
//! Only [`ConfigurationError`] is allowed to stop the listener from starting. Everything else is
//! contained either at the connection handler (framing/parse, answered with a negative ack) or at
//! the emitter loop (sink writes, logged and dropped).

use thiserror::Error;

/// Problems with the MLLP envelope around a message.  These are local to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A new start block arrived before the previous frame saw its end block.
    #[error("start block received before the end of the previous frame ({discarded} bytes discarded)")]
    UnexpectedStartBlock { discarded: usize },

    /// The end block byte was not followed by a carriage return.
    #[error("expected carriage return after end block, got 0x{found:02X}")]
    MissingCarriageReturn { found: u8 },

    /// The frame body grew past the configured limit.
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },

    /// The peer closed the connection part way through a frame.
    #[error("connection closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Malformed HL7 grammar.  Always answered with a negative acknowledgment, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message is empty")]
    Empty,

    #[error("message payload is not valid UTF-8")]
    InvalidEncoding,

    #[error("message does not start with an MSH segment")]
    MissingHeader,

    #[error("MSH segment does not declare a field separator")]
    MissingFieldSeparator,

    #[error("MSH segment declares invalid encoding characters '{0}'")]
    InvalidEncodingCharacters(String),

    #[error("MSH segment is truncated, missing {0}")]
    MissingField(&'static str),

    #[error("invalid segment name '{name}' on segment {index}")]
    InvalidSegmentName { index: usize, name: String },

    #[error("segment {0} is empty")]
    EmptySegment(usize),
}

/// Fatal to starting an instance; reported before any socket is opened.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("invalid field path '{0}' in fields_to_remove")]
    InvalidFieldPath(String),

    #[error("failed to read configuration from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Downstream write failure.  The entry is dropped; the consumer carries on.
#[derive(Debug, Error)]
pub enum SinkWriteError {
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink lock was poisoned by a panicking writer")]
    Poisoned,
}

/// The ingestion queue has been closed and accepts no more entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ingestion queue is closed")]
pub struct QueueClosed;

/// Crate level error, mostly for the host binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    SinkWrite(#[from] SinkWriteError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
