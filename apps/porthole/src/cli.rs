use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::session::SessionConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "porthole",
    about = "Mirror a headless TUI application to remote viewers over WebSocket",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "PORTHOLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "PORTHOLE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the multiplexer endpoint for directly connected viewers
    Host(HostArgs),
    /// Publish a session through a relay and print the share URL
    Share(ShareArgs),
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[arg(
        long,
        env = "PORTHOLE_LISTEN",
        help = "Address to serve the WebSocket endpoint on (default 127.0.0.1:7070)"
    )]
    pub listen: Option<SocketAddr>,

    #[command(flatten)]
    pub terminal: TerminalArgs,
}

#[derive(Args, Debug)]
pub struct ShareArgs {
    #[arg(
        long,
        env = "PORTHOLE_RELAY",
        help = "Relay WebSocket URL, e.g. wss://relay.example.com"
    )]
    pub relay: String,

    #[arg(long, help = "Tunnel id (defaults to a generated one)")]
    pub id: Option<String>,

    #[arg(long, help = "Namespace grouping related tunnel ids (defaults to the id)")]
    pub namespace: Option<String>,

    #[command(flatten)]
    pub terminal: TerminalArgs,
}

/// Terminal sizing and pacing knobs shared by both polarities. Flags win
/// over `PORTHOLE_*` environment configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct TerminalArgs {
    #[arg(long, help = "Initial terminal width in columns")]
    pub cols: Option<u16>,

    #[arg(long, help = "Initial terminal height in rows")]
    pub rows: Option<u16>,

    #[arg(long = "max-cols", help = "Largest width a viewer may resize to")]
    pub max_cols: Option<u16>,

    #[arg(long = "max-rows", help = "Largest height a viewer may resize to")]
    pub max_rows: Option<u16>,

    #[arg(long = "frame-rate", help = "Render loop frequency in frames per second")]
    pub frame_rate: Option<u32>,
}

impl TerminalArgs {
    pub fn to_session_config(&self, config: &Config) -> SessionConfig {
        SessionConfig {
            initial_cols: self.cols.unwrap_or(config.cols),
            initial_rows: self.rows.unwrap_or(config.rows),
            max_cols: self.max_cols.unwrap_or(config.max_cols),
            max_rows: self.max_rows.unwrap_or(config.max_rows),
            frame_rate: self.frame_rate.unwrap_or(config.frame_rate),
        }
    }
}
