//! # frx-core
//!
//! Streaming session and scheduling layer for the frx real-time frame
//! relay: clients stream webcam frames over WebSocket, a bounded worker
//! pool runs an opaque per-frame transformation, and each client gets its
//! transformed frames back with minimal added latency.
//!
//! This crate contains:
//! - **Codec**: `FrameCodec` for base64 JPEG frames
//! - **Protocol**: `ClientMessage` / `ServerMessage` JSON messages
//! - **Session**: `ClientSession` with newest-frame-wins single slots
//! - **Registry**: `SessionRegistry`, the table of live sessions
//! - **Scheduler**: `Scheduler` enforcing one outstanding job per session
//! - **Worker**: `WorkerPool` around a `Transformer` capability
//! - **Stats**: `StatsAggregator` counters and snapshots
//! - **Network**: `RelayServer` accept loop and per-connection tasks
//! - **Client**: `RelayClient` for load tests and integration tests
//! - **Error**: `FrxError`, a typed `thiserror` error hierarchy

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod stats;
pub mod transform;
pub mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{ClientReceiver, ClientSender, RelayClient};
pub use codec::{FrameCodec, MAX_MESSAGE_SIZE, synthetic_jpeg};
pub use error::{DecodeError, FrxError, ProcessingError};
pub use frame::{Frame, SourceIdentity};
pub use network::{RelayConnection, RelayContext, RelayOptions, RelayServer};
pub use protocol::{ClientMessage, ConfirmationStatus, PROTOCOL_VERSION, ServerMessage};
pub use registry::SessionRegistry;
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerHandle};
pub use session::{Claim, ClientSession, SubmitOutcome};
pub use state::{SessionId, SessionState, WorkerId, WorkerState};
pub use stats::{SessionDetails, StatsAggregator, StatsSnapshot};
pub use transform::{BlockingTransformer, Passthrough, Simulated, Transformer};
pub use worker::{Job, JobOutcome, JobReport, WorkerPool};
