//! Daemon wiring
//!
//! ```ignore
//! let daemon = DaemonBuilder::new(settings, env!("CARGO_PKG_VERSION"))
//!     .with_backend(backend)
//!     .build();
//! daemon.start().await?;
//! // ...
//! daemon.stop().await;
//! ```

mod context;
mod handlers;

pub use context::DaemonContext;
pub use handlers::PubSubHandlers;

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::info;

use crate::bus::{Bus, SOCKET_TOPIC};
use crate::ccinfo::{AnthropicUsageClient, CcInfoConfig, CcInfoTimer, RateLimitSource};
use crate::circuit::{CircuitBreaker, CircuitBreakerService, CircuitConfig, RepublishFn};
use crate::cleanup::CleanupService;
use crate::config::DaemonSettings;
use crate::ipc::SocketServer;
use crate::lifecycle::{self, TaskHandle, TaskSlot};
use crate::remote::{HttpBackend, SharedBackend};
use crate::resync::HeartbeatResyncService;
use crate::retry_queue::PersistentQueue;

/// Builder for a [`Daemon`]
pub struct DaemonBuilder {
    ctx: DaemonContext,
    backend: Option<SharedBackend>,
    rate_limit_source: Option<Option<Arc<dyn RateLimitSource>>>,
}

impl DaemonBuilder {
    pub fn new(settings: DaemonSettings, version: impl Into<String>) -> Self {
        Self {
            ctx: DaemonContext::new(settings, version),
            backend: None,
            rate_limit_source: None,
        }
    }

    /// Use `backend` instead of the HTTP client built from settings
    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the rate-limit source; `None` disables rate-limit lookups
    pub fn with_rate_limit_source(mut self, source: Option<Arc<dyn RateLimitSource>>) -> Self {
        self.rate_limit_source = Some(source);
        self
    }

    pub fn build(self) -> Daemon {
        let ctx = Arc::new(self.ctx);
        let settings = ctx.settings.clone();

        let backend: SharedBackend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(
                settings.api_endpoint.clone(),
                settings.token.clone(),
            )),
        };
        let rate_limit_source: Option<Arc<dyn RateLimitSource>> = match self.rate_limit_source {
            Some(source) => source,
            None => Some(Arc::new(AnthropicUsageClient::default())),
        };

        let (shutdown_tx, shutdown) = lifecycle::shutdown_channel();
        let bus = Arc::new(Bus::new(settings.bus.capacity, settings.bus.max_redeliveries));

        let breaker = Arc::new(CircuitBreaker::new(
            CircuitConfig::from(settings.as_ref()),
            settings.sync_pending_path(),
        ));
        let circuit = CircuitBreakerService::new(breaker.clone(), republish_on(bus.clone()));

        let heartbeat_queue = Arc::new(PersistentQueue::new(settings.heartbeat_pending_path()));
        let resync = HeartbeatResyncService::new(
            heartbeat_queue.clone(),
            backend.clone(),
            settings.resync_interval(),
        );

        let cc_info = CcInfoTimer::new(
            CcInfoConfig::from(settings.as_ref()),
            backend.clone(),
            rate_limit_source,
            shutdown.clone(),
        );
        let cleanup = CleanupService::new(
            settings.log_dir(),
            settings.cleanup.log_retention_days,
            settings.cleanup_interval(),
            cc_info.clone(),
        );

        let server = SocketServer::new(
            ctx.clone(),
            bus.clone(),
            cc_info.clone(),
            shutdown.clone(),
        );
        let handlers = Arc::new(PubSubHandlers::new(backend, breaker, heartbeat_queue));

        Daemon {
            ctx,
            shutdown_tx,
            bus,
            handlers,
            consumer: TaskSlot::new(),
            server,
            circuit,
            resync,
            cleanup,
            cc_info,
        }
    }
}

/// Republish a parked sync envelope onto the bus
fn republish_on(bus: Arc<Bus>) -> RepublishFn {
    Arc::new(move |payload: Vec<u8>| -> BoxFuture<'static, Result<()>> {
        let bus = bus.clone();
        Box::pin(async move {
            bus.publish(SOCKET_TOPIC, payload).await?;
            Ok(())
        })
    })
}

/// All daemon components, started and stopped together
pub struct Daemon {
    ctx: Arc<DaemonContext>,
    shutdown_tx: watch::Sender<bool>,
    bus: Arc<Bus>,
    handlers: Arc<PubSubHandlers>,
    consumer: TaskSlot,
    server: SocketServer,
    circuit: CircuitBreakerService,
    resync: HeartbeatResyncService,
    cleanup: CleanupService,
    cc_info: CcInfoTimer,
}

impl Daemon {
    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn cc_info(&self) -> &CcInfoTimer {
        &self.cc_info
    }

    pub fn circuit(&self) -> &CircuitBreakerService {
        &self.circuit
    }

    /// Bind the socket and start every background loop
    pub async fn start(&self) -> Result<()> {
        self.server.start().await?;

        if let Some(consumer) = self.bus.take_consumer() {
            let handlers = self.handlers.clone();
            let shutdown = self.shutdown_tx.subscribe();
            self.consumer.start_with(|| {
                TaskHandle::spawn(move |_stop| async move {
                    consumer
                        .run(
                            move |msg| {
                                let handlers = handlers.clone();
                                async move { handlers.handle(msg).await }
                            },
                            shutdown,
                        )
                        .await;
                })
            });
        }

        let shutdown = self.shutdown_tx.subscribe();
        self.circuit.start(shutdown.clone());
        self.resync.start(shutdown.clone());
        self.cleanup.start(shutdown);

        info!(
            "devpulse daemon {} started (socket {})",
            self.ctx.version,
            self.server.socket_path().display()
        );
        Ok(())
    }

    /// Stop everything and wait for every loop to exit
    pub async fn stop(&self) {
        // Closing the bus lets the consumer finish what is buffered
        self.server.stop().await;
        self.consumer.stop().await;

        let _ = self.shutdown_tx.send(true);
        self.circuit.stop().await;
        self.resync.stop().await;
        self.cleanup.stop().await;
        info!("devpulse daemon stopped");
    }
}
