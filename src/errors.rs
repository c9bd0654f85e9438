use std::io;

use thiserror::Error;

/// All errors that can occur while serving a session.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested local address is already bound by someone else.
    #[error("address already in use: {0}")]
    AddressInUse(String),
    /// The bind address could not be resolved or is not usable locally.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// A blocking call was interrupted through the cancel token.
    #[error("operation cancelled")]
    Cancelled,
    /// Any transport read/write error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// A frame declared a payload larger than the configured buffer size.
    ///
    /// This is fatal for the connection it was seen on.
    #[error("frame too large: len={len}, max={max}")]
    FrameTooLarge {
        /// declared payload length
        len: usize,
        /// configured maximum payload length
        max: usize,
    },
    /// The peer sent something that is not a valid frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A read or query was attempted after the session ended.
    #[error("session closed")]
    SessionClosed,
    /// The peer did not answer a query within the configured timeout.
    #[error("the peer was unable to answer the query within some time")]
    Timeout,
    /// The operation is not valid in the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Unknown property name or an out of range property value.
    #[error("invalid property: {0}")]
    InvalidProperty(String),
    /// The property can be read but never written.
    #[error("property `{0}` is read-only")]
    ReadOnlyProperty(String),
    /// Failed to (un)marshal a query payload.
    #[error("marshal err: {0}")]
    Marshal(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// classify a socket level error raised while binding
    pub(crate) fn from_bind(err: io::Error, addr: &str) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(addr.to_owned()),
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                Error::InvalidAddress(format!("{addr}: {err}"))
            }
            _ => Error::Io(err),
        }
    }

    /// true for the errors that only mean "interrupted", not "failed"
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
