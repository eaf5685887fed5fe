//! WebSocket transport: per-connection tasks and the accept loop.

pub mod connection;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;
use crate::scheduler::SchedulerHandle;
use crate::stats::StatsAggregator;
use crate::transform::Transformer;

pub use connection::RelayConnection;
pub use server::{RelayOptions, RelayServer};

/// Shared state every connection task needs.
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<StatsAggregator>,
    pub scheduler: SchedulerHandle,
    pub transformer: Arc<dyn Transformer>,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Fires when the server stops accepting; connections end cleanly.
    pub shutdown: CancellationToken,
}
