//! Our error types for the RD60xx bridge.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Custom error type for RD60xx PSU communications and command handling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Modbus protocol error: {0}")]
    ModbusError(rmodbus::ErrorKind),
    #[error("Communication timeout")]
    Timeout,
    #[error("Session closed")]
    SessionClosed,
    #[error("Invalid response received")]
    InvalidResponse,
    #[error("Expected {expected} registers, received {actual}")]
    RegisterCount { expected: usize, actual: usize },
    #[error("Invalid range")]
    InvalidRange,
    #[error("Malformed command: {0}")]
    MalformedCommand(String),
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure means the session can no longer be used.
    ///
    /// Anything else is a per-request failure: a poll publishes nothing, a set
    /// command is discarded, and the connection carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::SessionClosed)
    }
}

impl From<rmodbus::ErrorKind> for Error {
    fn from(err: rmodbus::ErrorKind) -> Self {
        Error::ModbusError(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedCommand(err.to_string())
    }
}
