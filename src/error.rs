//! Error codes reported by the TCP stack.
//!
//! The variants follow the stack's own error taxonomy so that a status can
//! travel unchanged between the transport and the sessions built on top of it.

use std::io;
use thiserror::Error;

/// Status of a transport operation or notification.
pub type Status = Result<(), TransportError>;

/// Errors produced by (or reported to) the transport layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Out of memory; also returned when the send buffer cannot take the data.
    #[error("out of memory")]
    OutOfMemory,

    #[error("buffer error")]
    Buffer,

    #[error("timeout")]
    Timeout,

    #[error("routing problem")]
    Routing,

    #[error("operation in progress")]
    InProgress,

    #[error("illegal value")]
    InvalidArgument,

    #[error("operation would block")]
    WouldBlock,

    #[error("address in use")]
    AddressInUse,

    #[error("already connecting")]
    AlreadyConnecting,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("low-level netif error")]
    Interface,

    /// Connection aborted; the handle is no longer valid.
    #[error("connection aborted")]
    Abort,

    /// Connection reset by the peer; the handle is no longer valid.
    #[error("connection reset")]
    Reset,

    #[error("connection closed")]
    Closed,

    #[error("i/o error: {0:?}")]
    Io(io::ErrorKind),
}

impl TransportError {
    /// Whether the error means the handle has already been discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Abort | TransportError::Reset | TransportError::Closed
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::OutOfMemory => TransportError::OutOfMemory,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::WouldBlock => TransportError::WouldBlock,
            io::ErrorKind::InvalidInput => TransportError::InvalidArgument,
            io::ErrorKind::AddrInUse => TransportError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => TransportError::Routing,
            io::ErrorKind::NotConnected => TransportError::NotConnected,
            io::ErrorKind::ConnectionAborted => TransportError::Abort,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
                TransportError::Reset
            }
            io::ErrorKind::BrokenPipe => TransportError::Closed,
            kind => TransportError::Io(kind),
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(kind) => kind.into(),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
