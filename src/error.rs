use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RudpError>;

/// Errors surfaced by the RUDP transport.
#[derive(Error, Debug)]
pub enum RudpError {
    /// A profile parameter is outside its allowed range.
    #[error("invalid profile parameter {field}: {value} (allowed {min}..={max})")]
    Config {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// A segment could not be parsed.
    #[error("malformed segment: {0}")]
    Malformed(&'static str),

    /// The socket is closed, or the peer closed or reset the connection.
    #[error("socket is closed")]
    Closed,

    /// `accept` exceeded the configured timeout.
    #[error("accept timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying datagram send/receive failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
