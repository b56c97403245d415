//! TCP echo server.
//!
//! Admits one client at a time, copies each delivery into a fixed-size
//! session buffer and echoes it straight back. A second client arriving while
//! a session is live is refused without allocating any state.

use crate::config::ServerSettings;
use crate::error::{Status, TransportError};
use crate::session::{detach, Session, SessionRegistry, Verdict};
use crate::transport::{Application, ConnId, Hooks, Transport};
use bytes::Bytes;
use tracing::{debug, info, trace, warn};

/// State of one accepted connection.
#[derive(Debug)]
pub struct ServerSession {
    conn: ConnId,
    /// Echo buffer; its length is the number of valid bytes.
    buffer: Vec<u8>,
    capacity: usize,
    /// The buffered bytes could not be enqueued yet.
    pending: bool,
}

impl ServerSession {
    /// Allocate a session with an echo buffer of `capacity` bytes.
    pub fn try_new(conn: ConnId, capacity: usize) -> Result<Self, TransportError> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| TransportError::OutOfMemory)?;

        Ok(Self {
            conn,
            buffer,
            capacity,
            pending: false,
        })
    }

    #[cfg(test)]
    /// Valid bytes currently held in the echo buffer.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    /// Whether an echo is waiting for send buffer space.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Enqueue the buffered bytes and flush them out immediately.
    fn send(&mut self, tx: &mut dyn Transport) {
        match tx.write(self.conn, &self.buffer) {
            Ok(()) => {
                self.pending = false;
                if let Err(e) = tx.output(self.conn) {
                    trace!(conn = ?self.conn, error = %e, "Output deferred");
                }
            }
            Err(TransportError::OutOfMemory) => {
                self.pending = true;
                debug!(conn = ?self.conn, len = self.buffer.len(), "Send buffer full, echo deferred");
            }
            Err(e) => {
                self.pending = false;
                debug!(conn = ?self.conn, error = %e, "Echo dropped");
            }
        }
    }
}

impl Session for ServerSession {
    fn conn(&self) -> ConnId {
        self.conn
    }

    fn on_recv(&mut self, tx: &mut dyn Transport, data: Option<Bytes>, status: Status) -> Verdict {
        match (status, data) {
            (Ok(()), Some(data)) if !data.is_empty() => {
                // Restore the receive window whatever happens to the bytes.
                tx.recved(self.conn, data.len());

                if self.pending {
                    self.send(tx);
                }

                if self.pending {
                    debug!(conn = ?self.conn, len = data.len(), "Echo still deferred, payload dropped");
                } else if data.len() <= self.capacity {
                    self.buffer.clear();
                    self.buffer.extend_from_slice(&data);
                    trace!(conn = ?self.conn, len = data.len(), "Echoing");
                    self.send(tx);
                } else {
                    debug!(
                        conn = ?self.conn,
                        len = data.len(),
                        capacity = self.capacity,
                        "Payload exceeds echo buffer, dropped"
                    );
                }
                Verdict::Keep
            }
            (Ok(()), _) => {
                debug!(conn = ?self.conn, "Connection closed by client");
                Verdict::Close
            }
            (Err(e), _) => {
                debug!(conn = ?self.conn, error = %e, "Ignoring receive with error status");
                Verdict::Keep
            }
        }
    }

    fn on_sent(&mut self, _tx: &mut dyn Transport, len: usize) -> Verdict {
        trace!(conn = ?self.conn, len, "Sent");
        Verdict::Keep
    }

    fn on_poll(&mut self, tx: &mut dyn Transport) -> Verdict {
        if self.pending {
            trace!(conn = ?self.conn, "Retrying deferred echo");
            self.send(tx);
        }
        Verdict::Keep
    }

    fn on_error(&mut self, err: TransportError) {
        debug!(conn = ?self.conn, error = %err, "Connection lost");
    }
}

/// Echo server: the listening endpoint plus its session registry.
pub struct EchoServer {
    settings: ServerSettings,
    sessions: SessionRegistry<ServerSession>,
}

impl EchoServer {
    /// Create a server instance
    pub fn new(settings: ServerSettings) -> Self {
        let sessions = SessionRegistry::new(settings.max_sessions);
        Self { settings, sessions }
    }

    /// Bind the listening endpoint.
    ///
    /// A bind failure is returned as-is; the endpoint is released by the
    /// transport and not retried here.
    pub fn start(&mut self, tx: &mut dyn Transport) -> Status {
        match tx.listen(self.settings.listen) {
            Ok(()) => {
                info!(
                    address = %self.settings.listen,
                    buffer_size = self.settings.buffer_size,
                    max_sessions = self.settings.max_sessions,
                    "Echo server listening"
                );
                Ok(())
            }
            Err(e) => {
                warn!(address = %self.settings.listen, error = %e, "Failed to bind echo server");
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionRegistry<ServerSession> {
        &self.sessions
    }

    /// Detach hooks, close the handle and release its session, if any.
    fn close_connection(&mut self, tx: &mut dyn Transport, conn: ConnId) {
        detach(tx, conn);
        if let Err(e) = tx.close(conn) {
            debug!(?conn, error = %e, "Close failed");
        }
        if self.sessions.remove(conn).is_some() {
            debug!(?conn, idle = self.sessions.is_empty(), "Session released");
        }
    }

    fn apply(&mut self, tx: &mut dyn Transport, conn: ConnId, verdict: Verdict) {
        if verdict == Verdict::Close {
            self.close_connection(tx, conn);
        }
    }
}

impl Application for EchoServer {
    fn accepted(&mut self, tx: &mut dyn Transport, conn: ConnId) -> Status {
        if self.sessions.is_full() {
            debug!(?conn, active = self.sessions.len(), "Session slot taken, rejecting connection");
            detach(tx, conn);
            tx.abort(conn);
            return Err(TransportError::Abort);
        }

        let session = ServerSession::try_new(conn, self.settings.buffer_size)?;
        if self.sessions.insert(session).is_err() {
            return Err(TransportError::OutOfMemory);
        }

        tx.set_hooks(conn, Hooks::RECV | Hooks::ERR | Hooks::POLL);
        tx.set_poll_interval(conn, self.settings.poll_ticks);

        debug!(?conn, "Accepted connection");
        Ok(())
    }

    fn connected(&mut self, _tx: &mut dyn Transport, conn: ConnId, _status: Status) -> Status {
        warn!(?conn, "Unexpected connect completion on echo server");
        Err(TransportError::InvalidArgument)
    }

    fn received(
        &mut self,
        tx: &mut dyn Transport,
        conn: ConnId,
        data: Option<Bytes>,
        status: Status,
    ) -> Status {
        let verdict = match self.sessions.get_mut(conn) {
            Some(session) => session.on_recv(tx, data, status),
            None => {
                trace!(?conn, "Receive for unknown connection");
                return Ok(());
            }
        };
        self.apply(tx, conn, verdict);
        Ok(())
    }

    fn sent(&mut self, tx: &mut dyn Transport, conn: ConnId, len: usize) -> Status {
        if let Some(session) = self.sessions.get_mut(conn) {
            let verdict = session.on_sent(tx, len);
            self.apply(tx, conn, verdict);
        }
        Ok(())
    }

    fn poll(&mut self, tx: &mut dyn Transport, conn: ConnId) -> Status {
        if let Some(session) = self.sessions.get_mut(conn) {
            let verdict = session.on_poll(tx);
            self.apply(tx, conn, verdict);
        }
        Ok(())
    }

    fn errored(&mut self, conn: ConnId, err: TransportError) {
        if let Some(mut session) = self.sessions.remove(conn) {
            session.on_error(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingTransport};

    const A: ConnId = ConnId(1);
    const B: ConnId = ConnId(2);

    fn settings() -> ServerSettings {
        ServerSettings {
            listen: "127.0.0.1:7".parse().unwrap(),
            buffer_size: 256,
            max_sessions: 1,
            poll_ticks: 2,
        }
    }

    fn server_with(conn: ConnId) -> (EchoServer, RecordingTransport) {
        let mut server = EchoServer::new(settings());
        let mut tx = RecordingTransport::new();
        server.accepted(&mut tx, conn).unwrap();
        tx.calls.clear();
        (server, tx)
    }

    #[test]
    fn test_accept_registers_hooks() {
        let mut server = EchoServer::new(settings());
        let mut tx = RecordingTransport::new();

        assert_eq!(server.accepted(&mut tx, A), Ok(()));
        assert_eq!(tx.hooks(A), Hooks::RECV | Hooks::ERR | Hooks::POLL);
        assert!(tx.calls.contains(&Call::SetPollInterval(A, 2)));

        let session = server.sessions().get(A).unwrap();
        assert!(session.buffered().is_empty());
        assert_eq!(session.capacity(), 256);
    }

    #[test]
    fn test_second_connection_rejected() {
        let (mut server, mut tx) = server_with(A);

        assert_eq!(server.accepted(&mut tx, B), Err(TransportError::Abort));

        // B torn down without registering anything; A untouched.
        assert_eq!(tx.hooks(B), Hooks::empty());
        assert_eq!(tx.calls.last(), Some(&Call::Abort(B)));
        assert_eq!(tx.count(|c| matches!(c, Call::Close(_))), 0);
        assert_eq!(server.sessions().len(), 1);
        assert!(server.sessions().contains(A));
        assert!(!server.sessions().contains(B));
        assert_eq!(tx.count(|c| matches!(c, Call::Close(conn) if *conn == A)), 0);
    }

    #[test]
    fn test_echo_ten_bytes() {
        let (mut server, mut tx) = server_with(A);

        let payload = Bytes::from_static(b"0123456789");
        server.received(&mut tx, A, Some(payload), Ok(())).unwrap();

        assert_eq!(server.sessions().get(A).unwrap().buffered().len(), 10);
        assert_eq!(
            tx.calls,
            vec![
                Call::Recved(A, 10),
                Call::Write(A, b"0123456789".to_vec()),
                Call::Output(A),
            ]
        );
    }

    #[test]
    fn test_echo_preserves_bytes_up_to_capacity() {
        let (mut server, mut tx) = server_with(A);

        for len in [1usize, 255, 256] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            server
                .received(&mut tx, A, Some(Bytes::from(payload.clone())), Ok(()))
                .unwrap();
            assert_eq!(tx.written(A).last(), Some(&payload));
        }
        assert_eq!(tx.written(A).len(), 3);
    }

    #[test]
    fn test_oversized_payload_acked_not_echoed() {
        let (mut server, mut tx) = server_with(A);

        let payload = Bytes::from(vec![7u8; 257]);
        server.received(&mut tx, A, Some(payload), Ok(())).unwrap();

        assert_eq!(tx.calls, vec![Call::Recved(A, 257)]);
        assert!(server.sessions().contains(A));
    }

    #[test]
    fn test_fin_tears_down_session() {
        let (mut server, mut tx) = server_with(A);

        server.received(&mut tx, A, None, Ok(())).unwrap();

        assert!(server.sessions().is_empty());
        assert_eq!(tx.hooks(A), Hooks::empty());
        assert_eq!(
            tx.calls,
            vec![
                Call::SetHooks(A, Hooks::empty()),
                Call::SetPollInterval(A, 0),
                Call::Close(A),
            ]
        );

        // Slot is free again.
        assert_eq!(server.accepted(&mut tx, B), Ok(()));
    }

    #[test]
    fn test_empty_payload_is_half_close() {
        let (mut server, mut tx) = server_with(A);

        server.received(&mut tx, A, Some(Bytes::new()), Ok(())).unwrap();

        assert!(server.sessions().is_empty());
        assert!(tx.calls.contains(&Call::Close(A)));
        assert_eq!(tx.count(|c| matches!(c, Call::Write(..))), 0);
    }

    #[test]
    fn test_error_releases_without_close() {
        let (mut server, mut tx) = server_with(A);

        server.errored(A, TransportError::Reset);

        assert!(server.sessions().is_empty());
        assert!(tx.calls.is_empty());

        // A late notification for the dead handle is ignored.
        server
            .received(&mut tx, A, Some(Bytes::from_static(b"late")), Ok(()))
            .unwrap();
        assert!(tx.calls.is_empty());
    }

    #[test]
    fn test_teardown_twice_is_harmless() {
        let (mut server, mut tx) = server_with(A);

        server.close_connection(&mut tx, A);
        server.close_connection(&mut tx, A);
        server.errored(A, TransportError::Abort);

        assert!(server.sessions().is_empty());
        assert_eq!(tx.count(|c| matches!(c, Call::Close(_))), 2);
    }

    #[test]
    fn test_other_status_keeps_connection() {
        let (mut server, mut tx) = server_with(A);

        let payload = Bytes::from_static(b"abc");
        server
            .received(&mut tx, A, Some(payload), Err(TransportError::Buffer))
            .unwrap();

        assert!(tx.calls.is_empty());
        assert!(server.sessions().contains(A));
    }

    #[test]
    fn test_full_send_buffer_retried_on_poll() {
        let (mut server, mut tx) = server_with(A);
        tx.write_error = Some(TransportError::OutOfMemory);

        server
            .received(&mut tx, A, Some(Bytes::from_static(b"hello")), Ok(()))
            .unwrap();
        assert!(server.sessions().get(A).unwrap().is_pending());
        assert!(tx.written(A).is_empty());

        // Still full: nothing changes.
        server.poll(&mut tx, A).unwrap();
        assert!(server.sessions().get(A).unwrap().is_pending());

        tx.write_error = None;
        server.poll(&mut tx, A).unwrap();
        assert!(!server.sessions().get(A).unwrap().is_pending());
        assert_eq!(tx.written(A), vec![b"hello".to_vec()]);
        assert_eq!(tx.calls.last(), Some(&Call::Output(A)));
    }

    #[test]
    fn test_payload_dropped_while_echo_deferred() {
        let (mut server, mut tx) = server_with(A);
        tx.write_error = Some(TransportError::OutOfMemory);

        server
            .received(&mut tx, A, Some(Bytes::from_static(b"first")), Ok(()))
            .unwrap();
        server
            .received(&mut tx, A, Some(Bytes::from_static(b"second")), Ok(()))
            .unwrap();

        // Both deliveries acknowledged, deferred bytes kept.
        assert_eq!(tx.count(|c| matches!(c, Call::Recved(..))), 2);
        assert_eq!(server.sessions().get(A).unwrap().buffered(), b"first");
    }

    #[test]
    fn test_other_write_failure_drops_echo() {
        let (mut server, mut tx) = server_with(A);
        tx.write_error = Some(TransportError::NotConnected);

        server
            .received(&mut tx, A, Some(Bytes::from_static(b"gone")), Ok(()))
            .unwrap();

        assert!(!server.sessions().get(A).unwrap().is_pending());
        assert_eq!(tx.count(|c| matches!(c, Call::Output(_))), 0);
    }

    #[test]
    fn test_allocation_failure_reports_out_of_memory() {
        let mut server = EchoServer::new(ServerSettings {
            buffer_size: usize::MAX,
            ..settings()
        });
        let mut tx = RecordingTransport::new();

        assert_eq!(server.accepted(&mut tx, A), Err(TransportError::OutOfMemory));
        assert!(server.sessions().is_empty());
        assert!(tx.calls.is_empty());
    }

    #[test]
    fn test_start_listens_on_configured_address() {
        let mut server = EchoServer::new(settings());
        let mut tx = RecordingTransport::new();

        assert_eq!(server.start(&mut tx), Ok(()));
        assert_eq!(tx.calls, vec![Call::Listen("127.0.0.1:7".parse().unwrap())]);

        tx.listen_error = Some(TransportError::AddressInUse);
        assert_eq!(server.start(&mut tx), Err(TransportError::AddressInUse));
    }
}
