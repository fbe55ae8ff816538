//! Error types for fastgate.

use thiserror::Error;

/// Main error type for all fastgate operations.
#[derive(Debug, Error)]
pub enum FastgateError {
    /// I/O error on the transport or a response pipe.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not dial the FastCGI application.
    #[error("connect to {address}: {source}")]
    Connect {
        /// `network!address` of the attempted endpoint.
        address: String,
        /// Underlying dial error.
        #[source]
        source: std::io::Error,
    },

    /// The request is malformed (e.g. filter role without a data stream).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol error (bad record, bad CGI headers, over-long header line).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed, locally or by the application.
    #[error("connection closed")]
    ConnectionClosed,

    /// The caller-supplied cancellation signal fired.
    #[error("request canceled")]
    Cancelled,

    /// A file referenced by the request could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias using FastgateError.
pub type Result<T> = std::result::Result<T, FastgateError>;
