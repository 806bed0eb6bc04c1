mod cli;
mod commands;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Command};
use devpulse_core::config::DaemonSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Load settings
    let mut settings = DaemonSettings::load(cli.config.as_ref())?;
    settings.merge_cli(&cli.overrides());
    settings.validate();

    // Setup logging; only the daemon writes a log file
    let log_dir = cli.is_daemon_mode().then(|| settings.log_dir());
    setup_logging(cli.debug, log_dir.as_deref());

    let socket = settings.socket_path.clone();
    match cli.command {
        Command::Daemon => commands::run_daemon(settings).await,
        Command::Status => commands::status(&socket).await,
        Command::CcInfo { range, cwd, format } => {
            commands::cc_info(&socket, range, cwd.as_deref(), format).await
        }
        Command::Sync { input } => commands::sync(&socket, &input).await,
        Command::Heartbeat {
            entity,
            project,
            editor,
            write,
        } => commands::heartbeat(&socket, entity, project, editor, write).await,
        Command::Terminal { pid } => {
            commands::terminal(pid);
            Ok(())
        }
    }
}

fn setup_logging(debug: bool, log_dir: Option<&Path>) {
    let default = if debug {
        "devpulse=debug"
    } else {
        "devpulse=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let file_layer = log_dir.and_then(|dir| match open_daemon_log(dir) {
        Ok(file) => Some(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        ),
        Err(e) => {
            eprintln!("devpulse: {:#}", e);
            None
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
}

/// Open `<dir>/daemon-<YYYY-MM-DD>.log` for appending
fn open_daemon_log(dir: &Path) -> Result<File> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
    let path = dir.join(format!(
        "daemon-{}.log",
        chrono::Local::now().format("%Y-%m-%d")
    ));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {:?}", path))
}
