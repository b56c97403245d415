//! tcp-echo: callback-driven TCP echo server and client
//!
//! Two small applications written against an event-notification transport:
//! - Echo server: accepts one client at a time and echoes its data back
//! - Echo client: connects out, sends a greeting and echoes what it receives
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod config;
mod error;
mod runtime;
mod server;
mod session;
#[cfg(test)]
mod testing;
mod transport;

use config::{Config, Mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Server => {
            info!(
                listen = %config.server.listen,
                buffer_size = config.server.buffer_size,
                max_sessions = config.server.max_sessions,
                poll_ticks = config.server.poll_ticks,
                "Starting tcp echo server"
            );
            runtime::run_server(&config)?;
        }
        Mode::Client => {
            info!(
                remote = %config.client.remote,
                "Starting tcp echo client"
            );
            runtime::run_client(&config)?;
        }
    }

    Ok(())
}
