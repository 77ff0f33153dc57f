//! Error types for pgwire-lite.

use thiserror::Error;

use crate::protocol::ErrorFields;

/// The main error type for connection, framing, and handshake failures.
#[derive(Debug, Error)]
pub enum PgError {
    /// Transport failure reported by the socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the stream.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// The transport did not deliver anything in time.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// A frame declared a length smaller than its own length field.
    #[error("Invalid frame length {len} for tag '{tag}'")]
    InvalidFrameLength { tag: char, len: i32 },

    /// A frame declared a length beyond the configured bound.
    #[error("Frame '{tag}' of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { tag: char, len: usize, max: usize },

    /// A frame payload could not be decoded.
    #[error("Decode error in '{tag}' frame: {message}")]
    Decode { tag: char, message: String },

    /// The authentication handshake failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server reported an error.
    #[error("Server error: {0}")]
    Server(ErrorFields),

    /// A message arrived out of sequence.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command was submitted while the server was busy.
    #[error("Connection is not ready for a new command")]
    NotReady,

    /// Command text the protocol cannot carry.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The session was closed or has failed; no further frames are processed.
    #[error("Session is closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// Create a decode error for the given frame tag.
    pub fn decode(tag: u8, message: impl Into<String>) -> Self {
        Self::Decode {
            tag: tag as char,
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Whether the error ends the connection.
    ///
    /// Server-reported errors and result decoding errors are recoverable;
    /// everything else tears the session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PgError::Server(_)
                | PgError::Decode { .. }
                | PgError::NotReady
                | PgError::InvalidCommand(_)
        )
    }
}

/// Result type alias for pgwire-lite operations.
pub type PgResult<T> = Result<T, PgError>;
