//! Configuration module for tcp-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-echo")]
#[command(author = "tcp-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Single-client TCP echo server and echo client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: ModeArgs,
}

/// Which component to run
#[derive(Subcommand, Debug)]
pub enum ModeArgs {
    /// Accept one client at a time and echo everything it sends
    Server {
        /// Address to listen on (e.g., 0.0.0.0:7)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Per-connection echo buffer size in bytes
        #[arg(short = 'b', long)]
        buffer_size: Option<usize>,

        /// Maximum number of concurrent sessions
        #[arg(long)]
        max_sessions: Option<usize>,
    },
    /// Connect to an echo server, send the greeting and echo replies
    Client {
        /// Remote server address (e.g., 192.168.1.225:5000)
        #[arg(short = 'r', long)]
        remote: Option<String>,

        /// Greeting sent once the connection is up
        #[arg(short = 'g', long)]
        greeting: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Echo buffer size per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Concurrent sessions admitted
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Slow-timer ticks between poll notifications
    #[serde(default = "default_poll_ticks")]
    pub poll_ticks: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
            poll_ticks: default_poll_ticks(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Echo server to connect to
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Greeting sent after connecting
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Bytes held back while the send buffer is full
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            greeting: default_greeting(),
            backlog_limit: default_backlog_limit(),
        }
    }
}

/// Host TCP stack tuning
#[derive(Debug, Deserialize)]
pub struct StackConfig {
    /// Slow-timer period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Largest single data delivery
    #[serde(default = "default_mss")]
    pub mss: usize,
    /// Send buffer per connection
    #[serde(default = "default_window")]
    pub send_buffer: usize,
    /// Receive window per connection
    #[serde(default = "default_window")]
    pub recv_window: usize,
    /// Listen backlog
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            mss: default_mss(),
            send_buffer: default_window(),
            recv_window: default_window(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7".to_string()
}

fn default_buffer_size() -> usize {
    256
}

fn default_max_sessions() -> usize {
    1
}

fn default_poll_ticks() -> u8 {
    2 // ~1 second at the default tick
}

fn default_remote() -> String {
    "192.168.1.225:5000".to_string()
}

fn default_greeting() -> String {
    "Hello STM32 LwIP Client!\n".to_string()
}

fn default_backlog_limit() -> usize {
    256
}

fn default_tick_ms() -> u64 {
    500
}

fn default_mss() -> usize {
    1460
}

fn default_window() -> usize {
    4 * default_mss()
}

fn default_listen_backlog() -> i32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Component selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub buffer_size: usize,
    pub max_sessions: usize,
    pub poll_ticks: u8,
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub remote: SocketAddr,
    pub greeting: String,
    pub backlog_limit: usize,
}

/// Resolved host stack settings
#[derive(Debug, Clone)]
pub struct StackSettings {
    pub tick: Duration,
    pub mss: usize,
    pub send_buffer: usize,
    pub recv_window: usize,
    pub listen_backlog: i32,
}

impl Default for StackSettings {
    fn default() -> Self {
        let stack = StackConfig::default();
        Self {
            tick: Duration::from_millis(stack.tick_ms),
            mss: stack.mss,
            send_buffer: stack.send_buffer,
            recv_window: stack.recv_window,
            listen_backlog: stack.listen_backlog,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub stack: StackSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            client,
            stack,
            logging,
        } = toml_config;

        let (mode, listen, buffer_size, max_sessions, remote, greeting) = match cli.mode {
            ModeArgs::Server {
                listen,
                buffer_size,
                max_sessions,
            } => (
                Mode::Server,
                listen.unwrap_or(server.listen),
                buffer_size.unwrap_or(server.buffer_size),
                max_sessions.unwrap_or(server.max_sessions),
                client.remote,
                client.greeting,
            ),
            ModeArgs::Client { remote, greeting } => (
                Mode::Client,
                server.listen,
                server.buffer_size,
                server.max_sessions,
                remote.unwrap_or(client.remote),
                greeting.unwrap_or(client.greeting),
            ),
        };

        if buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than zero"));
        }
        if max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be greater than zero"));
        }
        if stack.mss == 0 || stack.send_buffer == 0 || stack.recv_window == 0 {
            return Err(ConfigError::Invalid(
                "mss, send_buffer and recv_window must be greater than zero",
            ));
        }
        if stack.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be greater than zero"));
        }

        Ok(Config {
            mode,
            server: ServerSettings {
                listen: parse_addr(&listen)?,
                buffer_size,
                max_sessions,
                poll_ticks: server.poll_ticks,
            },
            client: ClientSettings {
                remote: parse_addr(&remote)?,
                greeting,
                backlog_limit: client.backlog_limit,
            },
            stack: StackSettings {
                tick: Duration::from_millis(stack.tick_ms),
                mss: stack.mss,
                send_buffer: stack.send_buffer,
                recv_window: stack.recv_window,
                listen_backlog: stack.listen_backlog,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        })
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|e| ConfigError::InvalidAddress(addr.to_string(), e))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid socket address '{0}': {1}")]
    InvalidAddress(String, #[source] AddrParseError),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("tcp-echo").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:7");
        assert_eq!(config.server.buffer_size, 256);
        assert_eq!(config.server.max_sessions, 1);
        assert_eq!(config.server.poll_ticks, 2);
        assert_eq!(config.client.remote, "192.168.1.225:5000");
        assert_eq!(config.client.greeting, "Hello STM32 LwIP Client!\n");
        assert_eq!(config.stack.tick_ms, 500);
        assert_eq!(config.stack.send_buffer, 5840);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:7007"
            buffer_size = 512

            [client]
            remote = "10.0.0.2:5000"
            greeting = "hi\n"

            [stack]
            tick_ms = 250
            mss = 536

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7007");
        assert_eq!(config.server.buffer_size, 512);
        assert_eq!(config.server.max_sessions, 1);
        assert_eq!(config.client.remote, "10.0.0.2:5000");
        assert_eq!(config.client.greeting, "hi\n");
        assert_eq!(config.stack.tick_ms, 250);
        assert_eq!(config.stack.mss, 536);
        assert_eq!(config.stack.recv_window, 5840);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:7007"
            buffer_size = 512
            "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["server", "-l", "127.0.0.1:9000"]), file).unwrap();
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.buffer_size, 512);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_client_mode() {
        let config = Config::merge(
            cli(&["--log-level", "trace", "client", "-r", "127.0.0.1:5000", "-g", "yo"]),
            TomlConfig::default(),
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.client.remote, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.client.greeting, "yo");
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.stack.tick, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(cli(&["server", "-l", "not-an-addr"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(ref a, _) if a == "not-an-addr"));

        let err = Config::merge(cli(&["server", "-b", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
