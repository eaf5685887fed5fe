//! Worker occupancy as seen by the scheduler.

use std::fmt;
use std::time::{Duration, Instant};

use crate::state::SessionId;

/// Index of a worker in the pool (`0..N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w-{}", self.0)
    }
}

/// Whether a worker may be offered a job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    /// Running a job for `session`.
    Busy { session: SessionId, since: Instant },
}

impl WorkerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// The session whose job this worker is running, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Busy { session, .. } => Some(*session),
            Self::Idle => None,
        }
    }

    /// Time spent on the current job.
    pub fn busy_for(&self) -> Option<Duration> {
        match self {
            Self::Busy { since, .. } => Some(since.elapsed()),
            Self::Idle => None,
        }
    }
}
