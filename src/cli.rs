use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use devpulse_core::ccinfo::TimeRange;
use devpulse_core::config::CliOverrides;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Developer activity telemetry daemon")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Unix socket path of the daemon
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Directory for retry queues and logs
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Backend API endpoint
    #[arg(long, global = true)]
    pub api_endpoint: Option<String>,

    /// Accept heartbeats even if disabled in the config file
    #[arg(long, global = true)]
    pub code_tracking: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the daemon in the foreground until SIGINT/SIGTERM
    Daemon,
    /// Show the running daemon's status
    Status,
    /// Show cached cost, git and rate-limit info
    CcInfo {
        /// Time range for the cost summary
        #[arg(short, long, value_enum, default_value_t = TimeRange::Today)]
        range: TimeRange,
        /// Working directory for git info
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Send a raw JSON sync payload (`-` reads stdin)
    Sync {
        #[arg(value_name = "FILE")]
        input: String,
    },
    /// Send a single heartbeat
    Heartbeat {
        /// File the activity happened on
        #[arg(long)]
        entity: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        editor: Option<String>,
        /// Mark the heartbeat as a save
        #[arg(long)]
        write: bool,
    },
    /// Print the terminal and multiplexer hosting a process
    Terminal {
        /// Start from this PID instead of this process's parent
        #[arg(long)]
        pid: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_daemon_mode(&self) -> bool {
        matches!(self.command, Command::Daemon)
    }

    /// Settings overrides carried by the global flags
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            socket_path: self.socket.clone(),
            base_dir: self.base_dir.clone(),
            api_endpoint: self.api_endpoint.clone(),
            code_tracking: self.code_tracking,
        }
    }
}
