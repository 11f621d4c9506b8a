//! Error types shared across the tunnel.

use std::io;

use thiserror::Error;

/// Result type alias for snell operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure on an underlying socket
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// AEAD tag mismatch; the stream is poisoned afterwards
    #[error("authentication failed")]
    AuthFailure,

    /// Zero-length AEAD chunk, the v2 end-of-request marker.
    ///
    /// Not a failure: callers watching for request boundaries match on it
    /// with [`Error::is_zero_chunk`].
    #[error("zero-length chunk")]
    ZeroChunk,

    /// Error reported by the server in an ERROR reply
    #[error("server error: {message}")]
    App {
        /// errno carried on the wire (0 when unknown)
        errno: u8,
        /// server-provided message, at most 250 bytes
        message: String,
    },

    /// Malformed or unexpected wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Cryptographic primitive failure (key derivation, cipher setup)
    #[error("cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new cryptographic error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Convert into an `io::Error` so layered streams can surface crate
    /// errors through `AsyncRead`/`AsyncWrite`.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Network(e) => e,
            Error::AuthFailure => io::Error::new(io::ErrorKind::InvalidData, self),
            Error::Protocol(_) => io::Error::new(io::ErrorKind::InvalidData, self),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }

    /// Whether `err` carries the zero-chunk end-of-request marker.
    pub fn is_zero_chunk(err: &io::Error) -> bool {
        matches!(
            err.get_ref().and_then(|e| e.downcast_ref::<Error>()),
            Some(Error::ZeroChunk)
        )
    }

    /// The server-reported message if `err` carries an app error.
    pub fn app_message(err: &io::Error) -> Option<&str> {
        match err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            Some(Error::App { message, .. }) => Some(message),
            _ => None,
        }
    }
}
