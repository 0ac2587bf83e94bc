//! Top-level error types for pipeline construction and I/O.

use std::{
    fmt,
    io::Error as IoError,
    net::AddrParseError,
};

/// Convenience alias for crate-level results.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or running a transport pipeline.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An OS-level socket or file operation failed.
    Io(IoError),
    /// A `host:port` string could not be parsed.
    IllegalAddress(AddrParseError),
    /// The requested payload type is not present in the format map.
    UnknownPayloadType(u8),
    /// Configuration values are inconsistent (e.g. `min_latency` above
    /// `target_latency`).
    IllegalConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o failure: {e}"),
            Error::IllegalAddress(e) => write!(f, "illegal address: {e}"),
            Error::UnknownPayloadType(pt) => write!(f, "unknown payload type: {pt}"),
            Error::IllegalConfig(why) => write!(f, "illegal configuration: {why}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::IllegalAddress(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::IllegalAddress(e)
    }
}
