//! mio-backed TCP stack with a callback API.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking reads and writes and turn the results into
//! [`Application`] notifications. Uses epoll on Linux, kqueue on macOS.
//!
//! ## Notification rules
//!
//! - A notification is only delivered when its hook is set on the handle.
//! - Nothing is dispatched from inside a [`Transport`] call. Sent
//!   notifications, write failures and reads resumed by `recved` are queued
//!   and handled by the loop once the current callback returns.
//! - After `close`, `abort` or an error notification the handle is gone and
//!   no further notification refers to it.

use crate::config::StackSettings;
use crate::error::{Status, TransportError};
use crate::runtime::buffer::SendBuffer;
use crate::transport::{Application, ConnId, Hooks, Transport};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Lifecycle of a host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Outbound connect in flight.
    Connecting,
    /// Data may flow both ways.
    Established,
    /// Closed by the application; draining the send buffer.
    Closing,
}

/// Per-connection state for the host stack.
struct HostConn {
    stream: TcpStream,
    phase: Phase,
    hooks: Hooks,
    /// Ticks between poll notifications (0 = off).
    poll_interval: u8,
    poll_ticks: u8,
    send_buf: SendBuffer,
    /// Receive window left; reads stop at zero.
    window: usize,
    /// The socket may hold unread data.
    readable: bool,
    /// Peer sent FIN.
    fin: bool,
    /// Bytes written out since the last sent notification.
    unreported: usize,
    /// Write failure waiting to be reported.
    failure: Option<TransportError>,
}

impl HostConn {
    fn new(stream: TcpStream, phase: Phase, settings: &StackSettings) -> Self {
        Self {
            stream,
            phase,
            hooks: Hooks::empty(),
            poll_interval: 0,
            poll_ticks: 0,
            send_buf: SendBuffer::new(settings.send_buffer),
            window: settings.recv_window,
            readable: phase == Phase::Established,
            fin: false,
            unreported: 0,
            failure: None,
        }
    }

    fn wants_read(&self) -> bool {
        self.phase == Phase::Established && self.readable && !self.fin && self.window > 0
    }

    fn has_deferred(&self) -> bool {
        self.failure.is_some() || self.unreported > 0 || self.wants_read()
    }
}

/// Host TCP stack implementing [`Transport`] over non-blocking sockets.
pub struct HostStack {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    conns: Slab<HostConn>,
    settings: StackSettings,
    next_tick: Instant,
}

impl HostStack {
    pub fn new(settings: StackSettings) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            listener: None,
            conns: Slab::new(),
            next_tick: Instant::now() + settings.tick,
            settings,
        })
    }

    /// Address of the listening endpoint, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of live connections.
    #[cfg(test)]
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Dispatch notifications into `app` until no listener and no connection
    /// remain.
    pub fn run<A: Application>(&mut self, app: &mut A) -> io::Result<()> {
        self.next_tick = Instant::now() + self.settings.tick;

        while self.listener.is_some() || !self.conns.is_empty() {
            let timeout = if self.conns.iter().any(|(_, c)| c.has_deferred()) {
                Duration::ZERO
            } else {
                self.next_tick.saturating_duration_since(Instant::now())
            };

            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect();

            for (token, readable, writable) in ready {
                match token {
                    LISTENER_TOKEN => self.accept_connections(app),
                    Token(id) => self.handle_event(app, id, readable, writable),
                }
            }

            let now = Instant::now();
            if now >= self.next_tick {
                self.slow_tick(app);
                self.next_tick = now + self.settings.tick;
            }

            self.process_deferred(app);
        }

        debug!("No endpoints left, stack stopped");
        Ok(())
    }

    fn accept_connections<A: Application>(&mut self, app: &mut A) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.conns.vacant_entry();
                    let id = entry.key();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    entry.insert(HostConn::new(stream, Phase::Established, &self.settings));

                    debug!(conn = id, peer = %peer, "Accepted connection");
                    if let Err(e) = app.accepted(self, ConnId(id)) {
                        debug!(conn = id, error = %e, "Connection refused by application");
                        self.discard(id);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("Accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_event<A: Application>(&mut self, app: &mut A, id: usize, readable: bool, writable: bool) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        if conn.phase == Phase::Connecting {
            self.finish_connect(app, id);
            return;
        }

        if readable {
            conn.readable = true;
        }
        if writable && !conn.send_buf.is_empty() {
            let _ = self.flush(id);
        }

        self.read_available(app, id);
    }

    fn finish_connect<A: Application>(&mut self, app: &mut A, id: usize) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };

        let status = match conn.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(TransportError::from(e)),
            Ok(None) => match conn.stream.peer_addr() {
                Ok(_) => Ok(()),
                // Not finished yet; wait for the next event.
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return,
                Err(e) => Err(TransportError::from(e)),
            },
        };

        if status.is_ok() {
            conn.phase = Phase::Established;
            conn.readable = true;
        }

        debug!(conn = id, ?status, "Connect completed");
        let result = app.connected(self, ConnId(id), status);
        if status.is_err() || result.is_err() {
            self.discard(id);
        }
    }

    /// Read and deliver data while the window and the socket allow.
    fn read_available<A: Application>(&mut self, app: &mut A, id: usize) {
        loop {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            if !conn.wants_read() {
                return;
            }

            let mut buf = vec![0u8; conn.window.min(self.settings.mss)];
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    conn.fin = true;
                    trace!(conn = id, "FIN received");
                    self.deliver(app, id, None);
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    conn.window -= n;
                    self.deliver(app, id, Some(Bytes::from(buf)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    conn.readable = false;
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(app, id, TransportError::from(e));
                    return;
                }
            }
        }
    }

    fn deliver<A: Application>(&mut self, app: &mut A, id: usize, data: Option<Bytes>) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };

        if conn.hooks.contains(Hooks::RECV) {
            if let Err(e) = app.received(self, ConnId(id), data, Ok(())) {
                debug!(conn = id, error = %e, "Receive rejected, dropping connection");
                self.discard(id);
            }
            return;
        }

        // No receive hook: acknowledge and discard, close on FIN.
        match data {
            Some(data) => self.recved(ConnId(id), data.len()),
            None => {
                let _ = self.close(ConnId(id));
            }
        }
    }

    /// Write as much of the send buffer as the socket takes.
    fn flush(&mut self, id: usize) -> Status {
        let Some(conn) = self.conns.get_mut(id) else {
            return Err(TransportError::Closed);
        };

        while !conn.send_buf.is_empty() {
            match conn.stream.write(conn.send_buf.pending()) {
                Ok(0) => {
                    conn.failure = Some(TransportError::Closed);
                    return Err(TransportError::Closed);
                }
                Ok(n) => {
                    conn.send_buf.consume(n);
                    conn.unreported += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = TransportError::from(e);
                    conn.failure = Some(err);
                    return Err(err);
                }
            }
        }

        if conn.phase == Phase::Closing && conn.send_buf.is_empty() {
            self.finish_close(id);
        }
        Ok(())
    }

    fn slow_tick<A: Application>(&mut self, app: &mut A) {
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();

        for id in ids {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };

            if conn.phase != Phase::Connecting && !conn.send_buf.is_empty() {
                let _ = self.flush(id);
            }

            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };
            if conn.phase != Phase::Established
                || conn.poll_interval == 0
                || !conn.hooks.contains(Hooks::POLL)
            {
                continue;
            }

            conn.poll_ticks += 1;
            if conn.poll_ticks >= conn.poll_interval {
                conn.poll_ticks = 0;
                if let Err(e) = app.poll(self, ConnId(id)) {
                    debug!(conn = id, error = %e, "Poll rejected, dropping connection");
                    self.discard(id);
                }
            }
        }
    }

    /// Report write failures and sent bytes, and resume reads.
    fn process_deferred<A: Application>(&mut self, app: &mut A) {
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();

        for id in ids {
            let Some(conn) = self.conns.get_mut(id) else {
                continue;
            };

            if let Some(err) = conn.failure {
                self.fail(app, id, err);
                continue;
            }

            if conn.unreported > 0 {
                let len = std::mem::take(&mut conn.unreported);
                if conn.hooks.contains(Hooks::SENT) {
                    if let Err(e) = app.sent(self, ConnId(id), len) {
                        debug!(conn = id, error = %e, "Sent rejected, dropping connection");
                        self.discard(id);
                        continue;
                    }
                }
            }

            self.read_available(app, id);
        }
    }

    /// Drop a connection after a fatal error and tell the application.
    fn fail<A: Application>(&mut self, app: &mut A, id: usize, err: TransportError) {
        let Some(mut conn) = self.conns.try_remove(id) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);

        debug!(conn = id, error = %err, "Connection failed");
        if conn.hooks.contains(Hooks::ERR) {
            app.errored(ConnId(id), err);
        }
    }

    /// Reset and forget a connection without notifying anyone.
    fn discard(&mut self, id: usize) {
        let Some(mut conn) = self.conns.try_remove(id) else {
            return;
        };
        let _ = socket2::SockRef::from(&conn.stream).set_linger(Some(Duration::ZERO));
        let _ = self.poll.registry().deregister(&mut conn.stream);
        trace!(conn = id, "Connection discarded");
    }

    fn finish_close(&mut self, id: usize) {
        let Some(mut conn) = self.conns.try_remove(id) else {
            return;
        };
        let _ = conn.stream.shutdown(Shutdown::Write);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        debug!(conn = id, "Connection closed");
    }
}

impl Transport for HostStack {
    fn set_hooks(&mut self, conn: ConnId, hooks: Hooks) {
        if let Some(c) = self.conns.get_mut(conn.0) {
            c.hooks = hooks;
        }
    }

    fn set_poll_interval(&mut self, conn: ConnId, ticks: u8) {
        if let Some(c) = self.conns.get_mut(conn.0) {
            c.poll_interval = ticks;
            c.poll_ticks = 0;
        }
    }

    fn recved(&mut self, conn: ConnId, len: usize) {
        if let Some(c) = self.conns.get_mut(conn.0) {
            c.window = (c.window + len).min(self.settings.recv_window);
        }
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Status {
        let c = self.conns.get_mut(conn.0).ok_or(TransportError::Closed)?;
        match c.phase {
            Phase::Established => c.send_buf.push(data),
            Phase::Connecting => Err(TransportError::NotConnected),
            Phase::Closing => Err(TransportError::Closed),
        }
    }

    fn output(&mut self, conn: ConnId) -> Status {
        let c = self.conns.get(conn.0).ok_or(TransportError::Closed)?;
        if c.phase == Phase::Connecting {
            return Ok(());
        }
        self.flush(conn.0)
    }

    fn close(&mut self, conn: ConnId) -> Status {
        let c = self.conns.get_mut(conn.0).ok_or(TransportError::Closed)?;
        c.hooks = Hooks::empty();

        match c.phase {
            Phase::Connecting => {
                self.discard(conn.0);
                Ok(())
            }
            Phase::Established | Phase::Closing => {
                c.phase = Phase::Closing;
                if c.send_buf.is_empty() {
                    self.finish_close(conn.0);
                    Ok(())
                } else {
                    self.flush(conn.0)
                }
            }
        }
    }

    fn abort(&mut self, conn: ConnId) {
        self.discard(conn.0);
    }

    fn listen(&mut self, addr: SocketAddr) -> Status {
        if self.listener.is_some() {
            return Err(TransportError::InvalidArgument);
        }

        let listener = create_listener(addr, self.settings.listen_backlog)?;
        let mut listener = TcpListener::from_std(listener);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        self.listener = Some(listener);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnId, TransportError> {
        let mut stream = TcpStream::connect(addr)?;

        let entry = self.conns.vacant_entry();
        let id = entry.key();
        self.poll.registry().register(
            &mut stream,
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(HostConn::new(stream, Phase::Connecting, &self.settings));

        Ok(ConnId(id))
    }
}

/// Create a non-blocking TCP listener.
///
/// On failure the socket is dropped, releasing the endpoint.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
