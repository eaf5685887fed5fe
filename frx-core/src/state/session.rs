//! Client session lifecycle state machine.
//!
//! Provides a `SessionState` enum that models the full lifecycle of a
//! relay session, with validated transitions that return `Result`
//! instead of panicking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::FrxError;

// ── SessionId ────────────────────────────────────────────────────

/// Opaque, process-unique session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Wrap a raw id. Mostly useful in tests.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate the next unused id.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// The current phase of a client session.
///
/// ```text
///  Connecting ──► Active ──► Draining ──► Closed
///       │                       ▲
///       └───────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Transport accepted; waiting for the `source_face` handshake.
    #[default]
    Connecting,

    /// Handshake complete; frames are accepted.
    Active {
        /// When the session entered the `Active` state.
        since: Instant,
    },

    /// Transport gone or idle; an in-flight job may still finish.
    Draining,

    /// Terminal. Resources released, removed from the registry.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Draining => write!(f, "Draining"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// `Draining` or `Closed`: the session takes no new work.
    pub fn is_winding_down(&self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }

    /// How long the session has been `Active`.
    ///
    /// Returns `None` for any other state.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Active`.
    ///
    /// Valid from: `Connecting`. Re-configuring an `Active` session is a
    /// no-op that keeps the original `since`.
    pub fn activate(&mut self) -> Result<(), FrxError> {
        match self {
            Self::Connecting => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            Self::Active { .. } => Ok(()),
            _ => Err(FrxError::InvalidTransition(
                "cannot activate: session is winding down",
            )),
        }
    }

    /// Transition to `Draining`.
    ///
    /// Valid from: `Connecting`, `Active`. Draining twice is a no-op.
    pub fn begin_drain(&mut self) -> Result<(), FrxError> {
        match self {
            Self::Connecting | Self::Active { .. } => {
                *self = Self::Draining;
                Ok(())
            }
            Self::Draining => Ok(()),
            Self::Closed => Err(FrxError::InvalidTransition(
                "cannot drain: session already closed",
            )),
        }
    }

    /// Transition to `Closed`.
    ///
    /// Valid from: `Draining`.
    pub fn close(&mut self) -> Result<(), FrxError> {
        match self {
            Self::Draining => {
                *self = Self::Closed;
                Ok(())
            }
            _ => Err(FrxError::InvalidTransition(
                "cannot close: session is not draining",
            )),
        }
    }

    /// Force to `Closed` regardless of current state.
    pub fn force_close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────
