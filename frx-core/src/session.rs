//! Per-connection session: identity, single-slot queues, liveness.
//!
//! The inbound and outbound slots each hold at most one frame. A new
//! arrival replaces whatever is waiting (newest-frame-wins), so a client
//! that outruns the worker pool sees old frames superseded instead of a
//! growing backlog.
//!
//! All mutable state sits behind one short-lived mutex so the connection
//! task (producer) and the scheduler (consumer) always observe a
//! consistent `pending` / `job_outstanding` / `state` triple.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, watch};

use crate::error::FrxError;
use crate::frame::{Frame, SourceIdentity};
use crate::state::{SessionId, SessionState};

// ── SubmitOutcome ────────────────────────────────────────────────

/// What happened to a frame handed to [`ClientSession::submit_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The frame now occupies the inbound slot.
    Queued {
        /// An older, unclaimed frame was discarded to make room.
        superseded: bool,
        /// The session just entered the ready set; the scheduler must be
        /// told.
        became_ready: bool,
    },
    /// The handshake has not completed yet; the frame was dropped.
    NotConfigured,
}

// ── Claim ────────────────────────────────────────────────────────

/// Result of [`ClientSession::claim_job`].
#[derive(Debug)]
pub enum Claim {
    /// The pending frame is now the session's outstanding job.
    Job(Frame, Arc<SourceIdentity>),
    /// The pending frame outlived the staleness limit and was discarded.
    Stale(Frame),
    /// Nothing to claim: empty slot, a job already outstanding, or the
    /// session is not `Active`.
    Unavailable,
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slots {
    state: SessionState,
    identity: Option<Arc<SourceIdentity>>,
    pending: Option<Frame>,
    result: Option<Frame>,
    job_outstanding: bool,
    last_activity: Instant,
}

// ── ClientSession ────────────────────────────────────────────────

/// Server-side state for one client connection.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    peer: Option<SocketAddr>,
    slots: Mutex<Slots>,
    result_ready: Notify,
    closed_tx: watch::Sender<bool>,
    next_sequence: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    created: Instant,
}

impl ClientSession {
    pub fn new(id: SessionId, peer: Option<SocketAddr>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            peer,
            slots: Mutex::new(Slots {
                state: SessionState::Connecting,
                identity: None,
                pending: None,
                result: None,
                job_outstanding: false,
                last_activity: Instant::now(),
            }),
            result_ready: Notify::new(),
            closed_tx,
            next_sequence: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Every critical section leaves the slots consistent before any
        // call that could panic, so a poisoned guard is still valid.
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn identity(&self) -> Option<Arc<SourceIdentity>> {
        self.lock().identity.clone()
    }

    /// Next per-session arrival ordinal.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    // ── Liveness ─────────────────────────────────────────────────

    /// Record client activity.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Time since the last client activity.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    // ── Handshake ────────────────────────────────────────────────

    /// Install (or replace) the source identity and enter `Active`.
    pub fn configure(&self, identity: Arc<SourceIdentity>) -> Result<(), FrxError> {
        let mut slots = self.lock();
        if slots.state.is_winding_down() {
            return Err(FrxError::SessionClosed(self.id));
        }
        slots.state.activate()?;
        slots.identity = Some(identity);
        Ok(())
    }

    // ── Inbound slot (connection task → scheduler) ──────────────

    /// Place a frame in the inbound slot, replacing any unclaimed one.
    pub fn submit_frame(&self, frame: Frame) -> Result<SubmitOutcome, FrxError> {
        let mut slots = self.lock();
        match slots.state {
            SessionState::Connecting => return Ok(SubmitOutcome::NotConfigured),
            SessionState::Draining | SessionState::Closed => {
                return Err(FrxError::SessionClosed(self.id));
            }
            SessionState::Active { .. } => {}
        }
        slots.last_activity = Instant::now();
        let superseded = slots.pending.replace(frame).is_some();
        let became_ready = !superseded && !slots.job_outstanding;
        drop(slots);

        self.frames_received.fetch_add(1, Ordering::Relaxed);
        Ok(SubmitOutcome::Queued {
            superseded,
            became_ready,
        })
    }

    /// Claim the pending frame for a job.
    ///
    /// With a `stale_after` limit, a frame older than the limit is discarded
    /// instead. Age check and claim happen under one lock, so a frame that
    /// replaces a stale one between the two is never lost. On success the
    /// session is marked as having a job outstanding until
    /// [`complete_job`](Self::complete_job).
    pub fn claim_job(&self, stale_after: Option<Duration>) -> Claim {
        let mut slots = self.lock();
        if !slots.state.is_active() || slots.job_outstanding {
            return Claim::Unavailable;
        }
        let Some(identity) = slots.identity.clone() else {
            return Claim::Unavailable;
        };
        let Some(frame) = slots.pending.take() else {
            return Claim::Unavailable;
        };
        if let Some(limit) = stale_after {
            if frame.received_at().elapsed() > limit {
                return Claim::Stale(frame);
            }
        }
        slots.job_outstanding = true;
        Claim::Job(frame, identity)
    }

    /// Put a claimed frame back after a failed hand-off, unless a newer
    /// frame has arrived in the meantime.
    pub fn restore_pending(&self, frame: Frame) {
        let mut slots = self.lock();
        if slots.state.is_active() && slots.pending.is_none() {
            slots.pending = Some(frame);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Finish the outstanding job.
    ///
    /// A result is only stored while the session is `Active`; a draining
    /// session's result is discarded. Returns `true` when a newer frame
    /// arrived meanwhile and the session is ready again.
    pub fn complete_job(&self, result: Option<Frame>) -> bool {
        let mut slots = self.lock();
        slots.job_outstanding = false;
        let active = slots.state.is_active();
        let delivered = match result {
            Some(frame) if active => {
                slots.result = Some(frame);
                true
            }
            _ => false,
        };
        let ready_again = active && slots.pending.is_some();
        drop(slots);

        if delivered {
            self.result_ready.notify_one();
        }
        ready_again
    }

    // ── Outbound slot (scheduler → connection task) ─────────────

    /// Non-blocking poll of the outbound slot.
    pub fn take_result(&self) -> Result<Option<Frame>, FrxError> {
        let mut slots = self.lock();
        if slots.state.is_closed() {
            return Err(FrxError::SessionClosed(self.id));
        }
        Ok(slots.result.take())
    }

    /// Resolves once a result may be waiting in the outbound slot.
    pub async fn result_notified(&self) {
        self.result_ready.notified().await
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Stop accepting frames. The pending frame is discarded; an
    /// outstanding job keeps running.
    ///
    /// Returns the discarded frame, if there was one.
    pub fn begin_drain(&self) -> Result<Option<Frame>, FrxError> {
        let mut slots = self.lock();
        slots.state.begin_drain()?;
        slots.result = None;
        Ok(slots.pending.take())
    }

    /// Enter `Closed` and release the slots.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        {
            let mut slots = self.lock();
            if slots.state.close().is_err() {
                slots.state.force_close();
            }
            slots.pending = None;
            slots.result = None;
            slots.identity = None;
        }
        self.closed_tx.send_replace(true);
        // Wake a writer parked on the outbound slot so it observes the
        // closed state.
        self.result_ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close first.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        Frame::new(Bytes::from(format!("frame-{seq}")), seq as f64, seq)
    }

    fn claim(s: &ClientSession) -> Option<(Frame, Arc<SourceIdentity>)> {
        match s.claim_job(None) {
            Claim::Job(frame, identity) => Some((frame, identity)),
            _ => None,
        }
    }

    fn active_session() -> ClientSession {
        let s = ClientSession::new(SessionId::next(), None);
        s.configure(Arc::new(SourceIdentity::from_image(Bytes::from_static(b"id"))))
            .unwrap();
        s
    }

    #[test]
    fn frames_before_handshake_are_dropped() {
        let s = ClientSession::new(SessionId::next(), None);
        assert_eq!(s.submit_frame(frame(1)).unwrap(), SubmitOutcome::NotConfigured);
        assert!(!s.has_pending());
    }

    #[test]
    fn newest_frame_wins() {
        let s = active_session();
        assert_eq!(
            s.submit_frame(frame(1)).unwrap(),
            SubmitOutcome::Queued {
                superseded: false,
                became_ready: true
            }
        );
        assert_eq!(
            s.submit_frame(frame(2)).unwrap(),
            SubmitOutcome::Queued {
                superseded: true,
                became_ready: false
            }
        );
        let (claimed, _) = claim(&s).unwrap();
        assert_eq!(claimed.sequence(), 2);
        assert!(claim(&s).is_none());
    }

    #[test]
    fn one_outstanding_job() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        assert!(claim(&s).is_some());

        let outcome = s.submit_frame(frame(2)).unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Queued {
                superseded: false,
                became_ready: false
            }
        );
        assert!(claim(&s).is_none(), "second claim while outstanding");

        let ready_again = s.complete_job(Some(frame(1)));
        assert!(ready_again);
        let (next, _) = claim(&s).unwrap();
        assert_eq!(next.sequence(), 2);
    }

    #[test]
    fn result_slot_is_single() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        claim(&s).unwrap();
        s.complete_job(Some(frame(1)));
        assert_eq!(s.take_result().unwrap().unwrap().sequence(), 1);
        assert!(s.take_result().unwrap().is_none());
    }

    #[test]
    fn draining_discards_result_and_rejects_frames() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        claim(&s).unwrap();
        s.submit_frame(frame(2)).unwrap();

        let discarded = s.begin_drain().unwrap();
        assert_eq!(discarded.unwrap().sequence(), 2);
        assert!(matches!(
            s.submit_frame(frame(3)),
            Err(FrxError::SessionClosed(_))
        ));

        assert!(!s.complete_job(Some(frame(1))));
        assert!(s.take_result().unwrap().is_none());
    }

    #[test]
    fn closed_session_rejects_operations() {
        let s = active_session();
        s.begin_drain().unwrap();
        s.close();
        assert!(s.is_closed());
        assert!(matches!(s.take_result(), Err(FrxError::SessionClosed(_))));
        assert!(matches!(
            s.submit_frame(frame(1)),
            Err(FrxError::SessionClosed(_))
        ));
        assert!(matches!(
            s.configure(Arc::new(SourceIdentity::from_image(Bytes::new()))),
            Err(FrxError::SessionClosed(_))
        ));
    }

    #[test]
    fn reconfigure_replaces_identity() {
        let s = active_session();
        let before = s.identity().unwrap().fingerprint();
        s.configure(Arc::new(SourceIdentity::from_image(Bytes::from_static(b"other"))))
            .unwrap();
        assert_ne!(s.identity().unwrap().fingerprint(), before);
        assert!(s.state().is_active());
    }

    #[tokio::test]
    async fn wait_closed_resolves() {
        let s = Arc::new(active_session());
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_closed().await })
        };
        s.begin_drain().unwrap();
        s.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("timeout")
            .unwrap();
    }

    #[test]
    fn result_notification_wakes_writer() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        let (job, _) = claim(&s).unwrap();

        let mut notified = tokio_test::task::spawn(s.result_notified());
        tokio_test::assert_pending!(notified.poll());
        s.complete_job(Some(job));
        assert!(notified.is_woken());
        tokio_test::assert_ready!(notified.poll());
    }

    #[test]
    fn stale_frame_is_discarded_on_claim() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        match s.claim_job(Some(Duration::from_millis(10))) {
            Claim::Stale(f) => assert_eq!(f.sequence(), 1),
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(!s.has_pending());
        // No job was left outstanding: the next frame makes the session ready.
        assert_eq!(
            s.submit_frame(frame(2)).unwrap(),
            SubmitOutcome::Queued {
                superseded: false,
                became_ready: true
            }
        );
    }

    #[test]
    fn fresh_replacement_of_stale_frame_is_claimed() {
        let s = active_session();
        s.submit_frame(frame(1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        // Arrives after the old frame went stale but before the claim.
        s.submit_frame(frame(2)).unwrap();

        match s.claim_job(Some(Duration::from_millis(10))) {
            Claim::Job(f, _) => assert_eq!(f.sequence(), 2),
            other => panic!("expected job, got {other:?}"),
        }
        assert!(matches!(s.claim_job(None), Claim::Unavailable));
    }
}
