pub mod session;
pub mod worker;

pub use session::{SessionId, SessionState};
pub use worker::{WorkerId, WorkerState};
