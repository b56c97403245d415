//! Test double for the transport seam.

use crate::error::{Status, TransportError};
use crate::transport::{ConnId, Hooks, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A single call made on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetHooks(ConnId, Hooks),
    SetPollInterval(ConnId, u8),
    Recved(ConnId, usize),
    Write(ConnId, Vec<u8>),
    Output(ConnId),
    Close(ConnId),
    Abort(ConnId),
    Listen(SocketAddr),
    Connect(SocketAddr),
}

/// Transport that records every call and lets tests inject failures.
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Vec<Call>,
    hooks: HashMap<ConnId, Hooks>,
    /// Returned by every `write` while set. Failed writes are not recorded.
    pub write_error: Option<TransportError>,
    pub listen_error: Option<TransportError>,
    pub connect_error: Option<TransportError>,
    next_conn: usize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            next_conn: 100,
            ..Self::default()
        }
    }

    /// Hooks currently registered on `conn`.
    pub fn hooks(&self, conn: ConnId) -> Hooks {
        self.hooks.get(&conn).copied().unwrap_or_default()
    }

    /// Payloads successfully enqueued on `conn`, in order.
    pub fn written(&self, conn: ConnId) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(c, data) if *c == conn => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }
}

impl Transport for RecordingTransport {
    fn set_hooks(&mut self, conn: ConnId, hooks: Hooks) {
        self.hooks.insert(conn, hooks);
        self.calls.push(Call::SetHooks(conn, hooks));
    }

    fn set_poll_interval(&mut self, conn: ConnId, ticks: u8) {
        self.calls.push(Call::SetPollInterval(conn, ticks));
    }

    fn recved(&mut self, conn: ConnId, len: usize) {
        self.calls.push(Call::Recved(conn, len));
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Status {
        if let Some(err) = self.write_error {
            return Err(err);
        }
        self.calls.push(Call::Write(conn, data.to_vec()));
        Ok(())
    }

    fn output(&mut self, conn: ConnId) -> Status {
        self.calls.push(Call::Output(conn));
        Ok(())
    }

    fn close(&mut self, conn: ConnId) -> Status {
        self.calls.push(Call::Close(conn));
        Ok(())
    }

    fn abort(&mut self, conn: ConnId) {
        self.calls.push(Call::Abort(conn));
    }

    fn listen(&mut self, addr: SocketAddr) -> Status {
        self.calls.push(Call::Listen(addr));
        match self.listen_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnId, TransportError> {
        self.calls.push(Call::Connect(addr));
        if let Some(err) = self.connect_error {
            return Err(err);
        }
        self.next_conn += 1;
        Ok(ConnId(self.next_conn))
    }
}
