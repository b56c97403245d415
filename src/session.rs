//! Session capability interface and the bounded session registry.
//!
//! A session owns the state of one live connection. The stack's notifications
//! are routed to it by [`ConnId`]; the session answers with a [`Verdict`] and
//! its owner (acceptor or initiator) carries out teardown, so a session never
//! frees itself from inside its own callback.

use crate::error::{Status, TransportError};
use crate::transport::{ConnId, Hooks, Transport};
use bytes::Bytes;
use std::collections::HashMap;

/// What the owner should do with a session after a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the connection open.
    Keep,
    /// Tear the connection down (detach hooks, close, release state).
    Close,
}

/// Per-connection notification handlers.
pub trait Session {
    /// Handle of the connection this session services.
    fn conn(&self) -> ConnId;

    /// Data arrived, or the peer half-closed when `data` is `None`.
    fn on_recv(&mut self, tx: &mut dyn Transport, data: Option<Bytes>, status: Status) -> Verdict;

    /// `len` bytes left the send buffer.
    fn on_sent(&mut self, tx: &mut dyn Transport, len: usize) -> Verdict;

    /// Slow-timer tick.
    fn on_poll(&mut self, tx: &mut dyn Transport) -> Verdict;

    /// The transport already discarded the handle; only bookkeeping is left.
    fn on_error(&mut self, err: TransportError);
}

/// Remove every hook from `conn` so no further notification reaches it.
///
/// Safe to repeat.
pub fn detach(tx: &mut dyn Transport, conn: ConnId) {
    tx.set_hooks(conn, Hooks::empty());
    tx.set_poll_interval(conn, 0);
}

/// Registry of live sessions keyed by connection handle.
///
/// Admission is bounded by `max_sessions`; the echo server runs with a single
/// slot.
pub struct SessionRegistry<S> {
    sessions: HashMap<ConnId, S>,
    max_sessions: usize,
}

impl<S: Session> SessionRegistry<S> {
    /// Create a registry admitting at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::with_capacity(max_sessions),
            max_sessions,
        }
    }

    /// Whether another session can be admitted.
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    /// Insert a session under its own handle.
    ///
    /// Hands the session back if the registry is at capacity.
    pub fn insert(&mut self, session: S) -> Result<(), S> {
        if self.is_full() {
            return Err(session);
        }
        self.sessions.insert(session.conn(), session);
        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, conn: ConnId) -> Option<&S> {
        self.sessions.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut S> {
        self.sessions.get_mut(&conn)
    }

    /// Remove a session, releasing its slot.
    pub fn remove(&mut self, conn: ConnId) -> Option<S> {
        self.sessions.remove(&conn)
    }

    #[cfg(test)]
    pub fn contains(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    /// Maximum number of sessions admitted.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}
