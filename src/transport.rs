//! Callback-driven TCP transport seam.
//!
//! The echo components never own sockets. They talk to a TCP stack through
//! two traits:
//! - [`Transport`]: calls the components make on the stack (acknowledge,
//!   enqueue, flush, close, ...).
//! - [`Application`]: notifications the stack delivers back (accept,
//!   connect complete, data arrived, sent, poll tick, error).
//!
//! All notifications for a handle are delivered in order on a single thread
//! and each one runs to completion before the stack continues.

use crate::error::{Status, TransportError};
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Opaque handle for one transport-level connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub usize);

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per-connection notification hooks.
    ///
    /// The stack only delivers a notification whose hook is set. Connect
    /// completion and accept are answers to requests and are always delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Hooks: u8 {
        /// Data arrived (or the peer half-closed).
        const RECV = 0b0001;
        /// Bytes left the send buffer.
        const SENT = 0b0010;
        /// Periodic slow-timer tick.
        const POLL = 0b0100;
        /// Fatal error; the handle is gone.
        const ERR  = 0b1000;
    }
}

/// Operations the echo components perform on the TCP stack.
pub trait Transport {
    /// Replace the set of hooks registered on `conn`.
    fn set_hooks(&mut self, conn: ConnId, hooks: Hooks);

    /// Deliver a poll notification every `ticks` slow-timer ticks (0 disables).
    fn set_poll_interval(&mut self, conn: ConnId, ticks: u8);

    /// Acknowledge `len` received bytes, reopening the receive window.
    fn recved(&mut self, conn: ConnId, len: usize);

    /// Enqueue `data` for transmission. The stack copies the bytes.
    ///
    /// Fails with [`TransportError::OutOfMemory`] when the send buffer
    /// cannot take all of `data`; nothing is enqueued in that case.
    fn write(&mut self, conn: ConnId, data: &[u8]) -> Status;

    /// Push enqueued data out now instead of waiting for the timer.
    fn output(&mut self, conn: ConnId) -> Status;

    /// Gracefully close `conn`. Enqueued data is still sent.
    fn close(&mut self, conn: ConnId) -> Status;

    /// Abort `conn` with a reset. No notification follows.
    fn abort(&mut self, conn: ConnId);

    /// Bind and listen on `addr`, delivering inbound connections to
    /// [`Application::accepted`].
    fn listen(&mut self, addr: SocketAddr) -> Status;

    /// Allocate a handle and start a non-blocking connect to `addr`.
    ///
    /// Completion is reported through [`Application::connected`].
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnId, TransportError>;
}

/// Notifications delivered by the TCP stack.
///
/// Returning an error from `accepted` or `connected` tells the stack the
/// handle must not be kept alive.
pub trait Application {
    /// A new inbound connection is ready.
    fn accepted(&mut self, tx: &mut dyn Transport, conn: ConnId) -> Status;

    /// An outbound connect finished with `status`.
    fn connected(&mut self, tx: &mut dyn Transport, conn: ConnId, status: Status) -> Status;

    /// Data arrived on `conn`. `None` with an `Ok` status means the peer
    /// sent FIN.
    fn received(
        &mut self,
        tx: &mut dyn Transport,
        conn: ConnId,
        data: Option<Bytes>,
        status: Status,
    ) -> Status;

    /// `len` bytes left the send buffer of `conn`.
    fn sent(&mut self, tx: &mut dyn Transport, conn: ConnId, len: usize) -> Status;

    /// Slow-timer tick for `conn`.
    fn poll(&mut self, tx: &mut dyn Transport, conn: ConnId) -> Status;

    /// The stack discarded `conn` because of `err`. The handle must not be
    /// used again, so no transport is passed.
    fn errored(&mut self, conn: ConnId, err: TransportError);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_detach() {
        let mut hooks = Hooks::RECV | Hooks::ERR | Hooks::POLL;
        assert!(hooks.contains(Hooks::RECV));
        assert!(!hooks.contains(Hooks::SENT));

        hooks = Hooks::empty();
        assert!(hooks.is_empty());
        assert_eq!(Hooks::default(), Hooks::empty());
    }

    #[test]
    fn test_conn_id_display() {
        assert_eq!(ConnId(3).to_string(), "#3");
        assert_eq!(format!("{:?}", ConnId(12)), "#12");
    }
}
