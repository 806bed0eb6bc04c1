//! Subcommand handlers

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::cli::OutputFormat;
use devpulse_core::ccinfo::TimeRange;
use devpulse_core::config::DaemonSettings;
use devpulse_core::daemon::DaemonBuilder;
use devpulse_core::ipc::client;
use devpulse_core::ipc::protocol::{format_uptime, CcInfoResponse};
use devpulse_core::model::{HeartbeatData, HeartbeatPayload};
use devpulse_core::terminal;

/// Run the daemon until SIGINT or SIGTERM
pub async fn run_daemon(settings: DaemonSettings) -> Result<()> {
    let daemon = DaemonBuilder::new(settings, env!("CARGO_PKG_VERSION")).build();
    daemon.start().await?;

    let waited = wait_for_signal().await;
    info!("Shutting down");
    daemon.stop().await;
    waited
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

pub async fn status(socket: &Path) -> Result<()> {
    let status = client::request_status(socket).await?;
    println!("devpulse {}", status.version);
    println!("  started:  {}", status.started_at);
    println!("  uptime:   {}", status.uptime);
    println!("  runtime:  {}", status.go_version);
    println!("  platform: {}", status.platform);
    Ok(())
}

pub async fn cc_info(
    socket: &Path,
    range: TimeRange,
    cwd: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let cwd = match cwd {
        Some(dir) => Some(dir.to_path_buf()),
        None => std::env::current_dir().ok(),
    };
    let cwd = cwd.as_deref().and_then(Path::to_str);
    let info = client::request_cc_info(socket, range, cwd).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => print!("{}", render_cc_info(&info)),
    }
    Ok(())
}

fn render_cc_info(info: &CcInfoResponse) -> String {
    let session = Duration::from_secs(info.total_session_seconds.max(0) as u64);
    let mut out = format!(
        "cost ({}): ${:.2}\nsession:   {}\ncached at: {}\n",
        info.time_range,
        info.total_cost_usd,
        format_uptime(session),
        info.cached_at
    );
    if !info.git_branch.is_empty() {
        let dirty = if info.git_dirty { " (dirty)" } else { "" };
        out.push_str(&format!("git:       {}{}\n", info.git_branch, dirty));
    }
    if let (Some(five), Some(seven)) = (info.five_hour_utilization, info.seven_day_utilization) {
        out.push_str(&format!("limits:    5h {:.0}%, 7d {:.0}%\n", five, seven));
    }
    if let Some(login) = &info.user_login {
        out.push_str(&format!("login:     {}\n", login));
    }
    out
}

/// Send a JSON payload read from `input` (`-` for stdin)
pub async fn sync(socket: &Path, input: &str) -> Result<()> {
    let raw = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read payload file: {}", input))?
    };
    let payload: Value = serde_json::from_str(&raw).context("Payload is not valid JSON")?;
    client::send_sync(socket, payload).await
}

pub async fn heartbeat(
    socket: &Path,
    entity: String,
    project: Option<String>,
    editor: Option<String>,
    is_write: bool,
) -> Result<()> {
    let payload = HeartbeatPayload {
        heartbeats: vec![HeartbeatData {
            project,
            editor,
            is_write,
            ..HeartbeatData::new(entity)
        }],
    };
    let ack = client::send_heartbeat(socket, &payload).await?;
    println!("{}", ack.status);
    Ok(())
}

pub fn terminal(pid: Option<u32>) {
    let resolved = match pid {
        Some(pid) => terminal::resolve_terminal(pid, terminal::system_provider().as_ref()),
        None => terminal::resolve_current_terminal(),
    };
    println!("terminal:    {}", resolved.terminal);
    if !resolved.multiplexer.is_empty() {
        println!("multiplexer: {}", resolved.multiplexer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn response() -> CcInfoResponse {
        CcInfoResponse {
            total_cost_usd: 1.5,
            total_session_seconds: 3720,
            time_range: "today".to_string(),
            cached_at: "1970-01-01T00:00:00+00:00".to_string(),
            git_branch: String::new(),
            git_dirty: false,
            five_hour_utilization: None,
            seven_day_utilization: None,
            user_login: None,
        }
    }

    #[test]
    fn test_render_minimal() {
        let text = render_cc_info(&response());
        assert!(text.starts_with("cost (today): $1.50\n"));
        assert!(!text.contains("git:"));
        assert!(!text.contains("limits:"));
    }

    #[test]
    fn test_render_optional_lines() {
        let info = CcInfoResponse {
            git_branch: "main".to_string(),
            git_dirty: true,
            five_hour_utilization: Some(42.0),
            seven_day_utilization: Some(7.4),
            user_login: Some("octocat".to_string()),
            ..response()
        };
        let text = render_cc_info(&info);
        assert!(text.contains("git:       main (dirty)\n"));
        assert!(text.contains("limits:    5h 42%, 7d 7%\n"));
        assert_eq!(text.lines().last(), Some("login:     octocat"));
    }
}
