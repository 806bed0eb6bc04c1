//! Socket IPC server
//!
//! Owns the daemon's Unix domain socket. Every accepted connection carries a
//! single request which is answered (or not) before the connection closes.
//! Slow work is handed to the bus; `cc_info` is served from cache.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, SOCKET_TOPIC};
use crate::ccinfo::{CcInfoTimer, TimeRange};
use crate::daemon::DaemonContext;
use crate::ipc::protocol::*;
use crate::lifecycle::{self, ShutdownSignal, TaskHandle, TaskSlot};

/// Unix socket server dispatching requests to the bus and caches
pub struct SocketServer {
    socket_path: PathBuf,
    handler: Arc<RequestHandler>,
    accept: TaskSlot,
    shutdown: ShutdownSignal,
    bound: AtomicBool,
}

struct RequestHandler {
    ctx: Arc<DaemonContext>,
    bus: Arc<Bus>,
    cc_info: CcInfoTimer,
}

impl SocketServer {
    pub fn new(
        ctx: Arc<DaemonContext>,
        bus: Arc<Bus>,
        cc_info: CcInfoTimer,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            socket_path: ctx.settings.socket_path.clone(),
            handler: Arc::new(RequestHandler { ctx, bus, cc_info }),
            accept: TaskSlot::new(),
            shutdown,
            bound: AtomicBool::new(false),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and start accepting in the background
    pub async fn start(&self) -> Result<()> {
        let sock = &self.socket_path;
        if let Some(parent) = sock.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {:?}", parent))?;
        }

        // Clean up stale socket
        if sock.exists() {
            match UnixStream::connect(sock).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another devpulse daemon is already running (socket {} is active)",
                        sock.display()
                    );
                }
                Err(_) => {
                    std::fs::remove_file(sock).with_context(|| {
                        format!("Failed to remove stale socket: {}", sock.display())
                    })?;
                }
            }
        }

        let listener = UnixListener::bind(sock)
            .with_context(|| format!("Failed to bind Unix socket: {}", sock.display()))?;
        self.bound.store(true, Ordering::SeqCst);

        // Any local process may connect
        std::fs::set_permissions(sock, std::fs::Permissions::from_mode(0o777))
            .context("Failed to set socket permissions")?;

        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        self.accept.start_with(|| {
            TaskHandle::spawn(move |stop| accept_loop(listener, handler, stop, shutdown))
        });

        info!("Socket server listening on {}", sock.display());
        Ok(())
    }

    /// Close the bus, stop owned workers and the accept loop, remove the socket
    pub async fn stop(&self) {
        self.handler.bus.close();
        self.handler.cc_info.stop().await;
        self.accept.stop().await;

        if self.bound.swap(false, Ordering::SeqCst) {
            match std::fs::remove_file(&self.socket_path) {
                Ok(()) => debug!("Removed socket {}", self.socket_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Failed to remove socket {}: {}",
                    self.socket_path.display(),
                    e
                ),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.accept.is_running()
    }
}

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<RequestHandler>,
    mut stop: tokio::sync::watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(stream).await {
                            debug!("Socket connection ended: {:#}", e);
                        }
                    });
                }
                Err(e) => warn!("Socket accept error: {}", e),
            },
            _ = lifecycle::signalled(&mut stop) => break,
            _ = lifecycle::signalled(&mut shutdown) => break,
        }
    }
    debug!("Socket accept loop stopped");
}

impl RequestHandler {
    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let value = match read_json_value(&mut stream).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Dropping connection with unreadable request: {}", e);
                return Ok(());
            }
        };

        let message = match SocketMessage::from_value(value.clone()) {
            Ok(m) => m,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!("Unknown socket message type: {}", kind);
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping connection with invalid request: {}", e);
                return Ok(());
            }
        };
        debug!("Socket request: {}", message.message_type().as_str());

        match message {
            SocketMessage::Status => reply(&mut stream, &self.ctx.status()).await,
            SocketMessage::Sync(_) => {
                // The caller does not wait for delivery
                self.publish(&value).await
            }
            SocketMessage::Heartbeat(_) => {
                if !self.ctx.code_tracking_enabled() {
                    return reply(&mut stream, &HeartbeatAck::disabled()).await;
                }
                self.publish(&value).await?;
                reply(&mut stream, &HeartbeatAck::ok()).await
            }
            SocketMessage::CcInfo(request) => {
                let response = self.cc_info_response(&request);
                reply(&mut stream, &response).await
            }
        }
    }

    async fn publish(&self, envelope: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(envelope).context("Failed to encode envelope")?;
        if let Err(e) = self.bus.publish(SOCKET_TOPIC, bytes).await {
            error!("Failed to publish socket message: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn cc_info_response(&self, request: &CcInfoRequest) -> CcInfoResponse {
        let range = TimeRange::parse_or_default(request.time_range.as_deref());
        let dir = request.working_directory.as_deref().unwrap_or("");

        let (cost, git) = self.cc_info.lookup(range, dir);
        let rate_limit = self.cc_info.get_cached_rate_limit();

        CcInfoResponse {
            total_cost_usd: cost.total_cost_usd,
            total_session_seconds: cost.total_session_seconds,
            time_range: range.as_str().to_string(),
            cached_at: cost.cached_at().to_rfc3339(),
            git_branch: git.branch,
            git_dirty: git.dirty,
            five_hour_utilization: rate_limit.as_ref().map(|r| r.five_hour_utilization),
            seven_day_utilization: rate_limit.as_ref().map(|r| r.seven_day_utilization),
            user_login: self.cc_info.get_user_login(),
        }
    }
}

async fn reply<T: Serialize>(stream: &mut UnixStream, msg: &T) -> Result<()> {
    let bytes = encode(msg)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
