//! TCP echo client.
//!
//! Opens one outbound connection, sends a greeting once it is up and then
//! echoes back whatever the server sends.

use crate::config::ClientSettings;
use crate::error::{Status, TransportError};
use crate::session::{detach, Session, Verdict};
use crate::transport::{Application, ConnId, Hooks, Transport};
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

/// State of the client's single connection.
///
/// Bytes that did not fit into the send buffer are held in a bounded backlog
/// and retried when the transport reports sent data.
#[derive(Debug)]
pub struct ClientSession {
    conn: ConnId,
    backlog: BytesMut,
    backlog_limit: usize,
}

impl ClientSession {
    pub fn new(conn: ConnId, backlog_limit: usize) -> Self {
        Self {
            conn,
            backlog: BytesMut::new(),
            backlog_limit,
        }
    }

    /// Bytes waiting for send buffer space.
    pub fn backlog(&self) -> &[u8] {
        &self.backlog
    }

    /// Enqueue `data` and flush, falling back to the backlog when full.
    fn send(&mut self, tx: &mut dyn Transport, data: &[u8]) {
        if !self.backlog.is_empty() && !self.flush_backlog(tx) {
            self.hold(data);
            return;
        }

        match tx.write(self.conn, data) {
            Ok(()) => {
                if let Err(e) = tx.output(self.conn) {
                    trace!(conn = ?self.conn, error = %e, "Output deferred");
                }
            }
            Err(TransportError::OutOfMemory) => self.hold(data),
            Err(e) => debug!(conn = ?self.conn, error = %e, len = data.len(), "Send dropped"),
        }
    }

    fn hold(&mut self, data: &[u8]) {
        if self.backlog.len() + data.len() <= self.backlog_limit {
            self.backlog.extend_from_slice(data);
            debug!(conn = ?self.conn, backlog = self.backlog.len(), "Send buffer full, holding data");
        } else {
            debug!(conn = ?self.conn, len = data.len(), "Backlog full, data dropped");
        }
    }

    /// Try to enqueue the backlog. Returns `true` once it is empty.
    fn flush_backlog(&mut self, tx: &mut dyn Transport) -> bool {
        match tx.write(self.conn, &self.backlog) {
            Ok(()) => {
                trace!(conn = ?self.conn, len = self.backlog.len(), "Backlog enqueued");
                self.backlog.clear();
                if let Err(e) = tx.output(self.conn) {
                    trace!(conn = ?self.conn, error = %e, "Output deferred");
                }
                true
            }
            Err(TransportError::OutOfMemory) => false,
            Err(e) => {
                debug!(conn = ?self.conn, error = %e, len = self.backlog.len(), "Backlog dropped");
                self.backlog.clear();
                true
            }
        }
    }
}

impl Session for ClientSession {
    fn conn(&self) -> ConnId {
        self.conn
    }

    fn on_recv(&mut self, tx: &mut dyn Transport, data: Option<Bytes>, status: Status) -> Verdict {
        match (status, data) {
            (Ok(()), Some(data)) if !data.is_empty() => {
                tx.recved(self.conn, data.len());
                trace!(conn = ?self.conn, len = data.len(), "Echoing");
                self.send(tx, &data);
                Verdict::Keep
            }
            (Ok(()), _) => {
                debug!(conn = ?self.conn, "Connection closed by server");
                Verdict::Close
            }
            (Err(e), _) => {
                debug!(conn = ?self.conn, error = %e, "Ignoring receive with error status");
                Verdict::Keep
            }
        }
    }

    fn on_sent(&mut self, tx: &mut dyn Transport, len: usize) -> Verdict {
        trace!(conn = ?self.conn, len, "Sent");
        if !self.backlog.is_empty() {
            self.flush_backlog(tx);
        }
        Verdict::Keep
    }

    fn on_poll(&mut self, _tx: &mut dyn Transport) -> Verdict {
        Verdict::Keep
    }

    fn on_error(&mut self, err: TransportError) {
        if err.is_fatal() {
            debug!(conn = ?self.conn, error = %err, "Connection lost");
        } else {
            warn!(conn = ?self.conn, error = %err, "Connection failed");
        }
    }
}

/// The client's one state record.
///
/// Lives as long as the client; only the session inside it comes and goes.
#[derive(Debug, Default)]
pub struct ClientState {
    session: Option<ClientSession>,
    retries: u32,
}

impl ClientState {
    /// Handle of the current connection, if any.
    pub fn conn(&self) -> Option<ConnId> {
        self.session.as_ref().map(Session::conn)
    }

    #[cfg(test)]
    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// Reconnect attempts made so far. No retry policy is implemented.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn reset(&mut self) {
        self.session = None;
        self.retries = 0;
    }
}

/// Echo client: connects, greets and echoes.
pub struct EchoClient {
    settings: ClientSettings,
    state: ClientState,
}

impl EchoClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            state: ClientState::default(),
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Start the outbound connection.
    ///
    /// Completion is reported later through [`Application::connected`].
    pub fn start(&mut self, tx: &mut dyn Transport) -> Status {
        info!("tcp client init");
        self.state.reset();

        info!(remote = %self.settings.remote, "Connecting to server");
        let conn = match tx.connect(self.settings.remote) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(remote = %self.settings.remote, error = %e, "Failed to allocate connection");
                return Err(e);
            }
        };

        self.state.session = Some(ClientSession::new(conn, self.settings.backlog_limit));
        tx.set_hooks(conn, Hooks::ERR);

        info!(?conn, "Connect initiated");
        Ok(())
    }

    fn session_mut(&mut self, conn: ConnId) -> Option<&mut ClientSession> {
        self.state.session.as_mut().filter(|s| s.conn == conn)
    }

    /// Detach hooks, close the handle and forget it. The state record stays.
    fn close_connection(&mut self, tx: &mut dyn Transport, conn: ConnId) {
        detach(tx, conn);
        if let Err(e) = tx.close(conn) {
            debug!(?conn, error = %e, "Close failed");
        }
        if let Some(session) = self.session_mut(conn) {
            if !session.backlog().is_empty() {
                debug!(?conn, len = session.backlog().len(), "Backlog discarded on close");
            }
            self.state.session = None;
        }
        debug!(?conn, retries = self.state.retries(), "Connection closed");
    }

    fn apply(&mut self, tx: &mut dyn Transport, conn: ConnId, verdict: Verdict) {
        if verdict == Verdict::Close {
            self.close_connection(tx, conn);
        }
    }
}

impl Application for EchoClient {
    fn accepted(&mut self, _tx: &mut dyn Transport, conn: ConnId) -> Status {
        warn!(?conn, "Unexpected inbound connection on echo client");
        Err(TransportError::InvalidArgument)
    }

    fn connected(&mut self, tx: &mut dyn Transport, conn: ConnId, status: Status) -> Status {
        if self.state.conn() != Some(conn) {
            warn!(?conn, "Connect completion for unknown connection");
            return Err(TransportError::InvalidArgument);
        }

        if let Err(e) = status {
            warn!(?conn, remote = %self.settings.remote, error = %e, "Connection failed");
            self.close_connection(tx, conn);
            return status;
        }

        tx.set_hooks(conn, Hooks::RECV | Hooks::SENT | Hooks::ERR);
        info!(?conn, remote = %self.settings.remote, "Connected to server");

        if let Some(session) = self.state.session.as_mut() {
            session.send(tx, self.settings.greeting.as_bytes());
        }
        Ok(())
    }

    fn received(
        &mut self,
        tx: &mut dyn Transport,
        conn: ConnId,
        data: Option<Bytes>,
        status: Status,
    ) -> Status {
        if let Some(session) = self.session_mut(conn) {
            let verdict = session.on_recv(tx, data, status);
            self.apply(tx, conn, verdict);
        }
        Ok(())
    }

    fn sent(&mut self, tx: &mut dyn Transport, conn: ConnId, len: usize) -> Status {
        if let Some(session) = self.session_mut(conn) {
            let verdict = session.on_sent(tx, len);
            self.apply(tx, conn, verdict);
        }
        Ok(())
    }

    fn poll(&mut self, tx: &mut dyn Transport, conn: ConnId) -> Status {
        if let Some(session) = self.session_mut(conn) {
            let verdict = session.on_poll(tx);
            self.apply(tx, conn, verdict);
        }
        Ok(())
    }

    fn errored(&mut self, conn: ConnId, err: TransportError) {
        if let Some(session) = self.session_mut(conn) {
            session.on_error(err);
            self.state.session = None;
        }
    }
}
