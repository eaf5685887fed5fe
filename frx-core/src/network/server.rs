//! Relay server: accept loop, optional TLS, wiring of the shared
//! registry, stats and scheduler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::FrxError;
use crate::network::{RelayConnection, RelayContext};
use crate::registry::SessionRegistry;
use crate::scheduler::Scheduler;
use crate::stats::StatsAggregator;
use crate::transform::Transformer;

// ── RelayOptions ─────────────────────────────────────────────────

/// Runtime options for [`RelayServer`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Worker pool size.
    pub workers: usize,
    /// Close sessions with no inbound traffic for this long.
    pub idle_timeout: Duration,
    /// Drop frames that waited longer than this for a worker.
    pub stale_after: Option<Duration>,
    /// Concurrent session limit.
    pub max_connections: usize,
    /// Upper bound on each of the TLS and WebSocket handshakes. A peer that
    /// connects and stays silent is dropped after this and frees its slot.
    pub handshake_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            workers: 4,
            idle_timeout: Duration::from_secs(60),
            stale_after: Some(Duration::from_millis(500)),
            max_connections: 64,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// ── RelayServer ──────────────────────────────────────────────────

/// A bound relay server.
///
/// # Lifetime
///
/// [`bind`](Self::bind) opens the listener and starts the scheduler and
/// worker pool; [`run`](Self::run) accepts clients until the token from
/// [`shutdown_token`](Self::shutdown_token) is cancelled.
pub struct RelayServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: Arc<RelayContext>,
    max_connections: usize,
    scheduler_cancel: CancellationToken,
    scheduler: JoinHandle<()>,
}

impl RelayServer {
    pub async fn bind(
        options: RelayOptions,
        transformer: Arc<dyn Transformer>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, FrxError> {
        let listener = TcpListener::bind(options.bind_addr).await?;

        let registry = Arc::new(SessionRegistry::new());
        let stats = Arc::new(StatsAggregator::new(Arc::clone(&registry)));
        let (scheduler, handle) = Scheduler::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&transformer),
            options.workers,
            options.stale_after,
        );
        let scheduler_cancel = CancellationToken::new();
        let scheduler = scheduler.spawn(scheduler_cancel.clone());

        info!(
            addr = %listener.local_addr()?,
            workers = options.workers.max(1),
            transformer = transformer.name(),
            execution_provider = transformer.execution_provider().unwrap_or("default"),
            tls = tls.is_some(),
            "relay listening"
        );

        Ok(Self {
            listener,
            tls,
            ctx: Arc::new(RelayContext {
                registry,
                stats,
                scheduler: handle,
                transformer,
                idle_timeout: options.idle_timeout,
                handshake_timeout: options.handshake_timeout,
                shutdown: CancellationToken::new(),
            }),
            max_connections: options.max_connections.max(1),
            scheduler_cancel,
            scheduler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, FrxError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.ctx.stats)
    }

    /// Cancel this token to stop the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Accept clients until shut down, then wait for every connection to
    /// end and stop the scheduler.
    pub async fn run(self) -> Result<(), FrxError> {
        let limiter = Arc::new(Semaphore::new(self.max_connections));
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let Ok(permit) = Arc::clone(&limiter).try_acquire_owned() else {
                warn!(%peer, limit = self.max_connections, "connection limit reached; rejecting");
                drop(stream);
                continue;
            };

            let ctx = Arc::clone(&self.ctx);
            let tls = self.tls.clone();
            tracker.spawn(async move {
                let _permit = permit;
                let result = match tls {
                    Some(acceptor) => {
                        let limit = ctx.handshake_timeout;
                        match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                            Ok(Ok(stream)) => RelayConnection::serve(stream, peer, ctx).await,
                            Ok(Err(e)) => Err(FrxError::Connection(e)),
                            Err(_) => Err(FrxError::Timeout(limit)),
                        }
                    }
                    None => RelayConnection::serve(stream, peer, ctx).await,
                };
                if let Err(e) = result {
                    debug!(%peer, "connection ended with error: {e}");
                }
            });
        }

        info!(open = tracker.len(), "relay shutting down");
        tracker.close();
        tracker.wait().await;

        // Connections are gone; close anything the scheduler had not yet
        // finalized.
        let registry = Arc::clone(&self.ctx.registry);
        registry.for_each(|session| {
            registry.unregister(session.id());
            session.close();
        });

        self.scheduler_cancel.cancel();
        let _ = self.scheduler.await;
        info!("relay stopped");
        Ok(())
    }
}
