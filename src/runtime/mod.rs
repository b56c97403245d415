//! Host runtime for the echo applications.
//!
//! Drives a readiness-based TCP stack (epoll on Linux, kqueue on macOS via
//! mio) and dispatches its notifications into an [`Application`].
//!
//! - `SendBuffer`: bounded per-connection staging for outgoing bytes
//! - `HostStack`: the [`Transport`](crate::transport::Transport) the
//!   applications are written against

mod buffer;
mod stack;

use stack::HostStack;

use crate::client::EchoClient;
use crate::config::Config;
use crate::server::EchoServer;
use tracing::info;

/// Run the echo server until the process is stopped.
pub fn run_server(config: &Config) -> std::io::Result<()> {
    let mut stack = HostStack::new(config.stack.clone())?;
    let mut server = EchoServer::new(config.server.clone());

    server.start(&mut stack)?;
    if let Some(addr) = stack.local_addr() {
        info!(%addr, "Listening");
    }

    stack.run(&mut server)
}

/// Run the echo client until its connection goes away.
pub fn run_client(config: &Config) -> std::io::Result<()> {
    let mut stack = HostStack::new(config.stack.clone())?;
    let mut client = EchoClient::new(config.client.clone());

    client.start(&mut stack)?;
    stack.run(&mut client)?;

    info!(retries = client.state().retries(), "tcp client finished");
    Ok(())
}
