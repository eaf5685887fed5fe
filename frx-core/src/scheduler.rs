//! Matches ready sessions to idle workers.
//!
//! The scheduler is a single task that owns the ready queue and the
//! worker table, so "at most one outstanding job per session" is enforced
//! by one thread of control. Connection tasks tell it when a session
//! becomes ready or starts draining; workers tell it when a job finishes.
//!
//! Ordering: sessions are served FIFO by the moment they entered the ready
//! queue. A session whose pending frame is replaced keeps its place, so a
//! client that submits faster than the pool drains cannot jump ahead of,
//! or fall behind, slower clients.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::FrxError;
use crate::registry::SessionRegistry;
use crate::session::Claim;
use crate::state::{SessionId, WorkerId, WorkerState};
use crate::stats::StatsAggregator;
use crate::transform::Transformer;
use crate::worker::{Job, JobOutcome, JobReport, WorkerPool};

// ── SchedulerEvent ───────────────────────────────────────────────

/// Notifications from connection tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The session's inbound slot went from empty to occupied while no job
    /// was outstanding.
    FrameReady(SessionId),
    /// The session stopped accepting frames. The scheduler closes and
    /// unregisters it once any outstanding job has finished.
    SessionDraining(SessionId),
}

/// Cloneable sender side of the scheduler's event queue.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub fn frame_ready(&self, id: SessionId) -> Result<(), FrxError> {
        Ok(self.tx.send(SchedulerEvent::FrameReady(id))?)
    }

    pub fn session_draining(&self, id: SessionId) -> Result<(), FrxError> {
        Ok(self.tx.send(SchedulerEvent::SessionDraining(id))?)
    }
}

// ── Scheduler ────────────────────────────────────────────────────

pub struct Scheduler {
    registry: Arc<SessionRegistry>,
    stats: Arc<StatsAggregator>,
    pool: WorkerPool,
    workers: Vec<WorkerState>,
    idle: VecDeque<WorkerId>,
    ready: VecDeque<SessionId>,
    queued: HashSet<SessionId>,
    outstanding: HashMap<SessionId, WorkerId>,
    draining: HashSet<SessionId>,
    stale_after: Option<Duration>,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    reports_rx: mpsc::UnboundedReceiver<JobReport>,
}

impl Scheduler {
    /// Build a scheduler and its worker pool.
    ///
    /// Frames that waited longer than `stale_after` between arrival and
    /// dispatch are dropped instead of processed.
    pub fn new(
        registry: Arc<SessionRegistry>,
        stats: Arc<StatsAggregator>,
        transformer: Arc<dyn Transformer>,
        workers: usize,
        stale_after: Option<Duration>,
    ) -> (Self, SchedulerHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(workers, transformer, Arc::clone(&stats), reports_tx);
        let size = pool.size();

        let scheduler = Self {
            registry,
            stats,
            pool,
            workers: vec![WorkerState::Idle; size],
            idle: (0..size).map(WorkerId).collect(),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            outstanding: HashMap::new(),
            draining: HashSet::new(),
            stale_after,
            events_rx,
            reports_rx,
        };
        (scheduler, SchedulerHandle { tx: events_tx })
    }

    /// Run on the current runtime until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(workers = self.workers.len(), "scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(report) = self.reports_rx.recv() => self.on_report(report),
                event = self.events_rx.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
            self.dispatch();
        }
        info!("scheduler stopping; waiting for in-flight jobs");
        self.pool.shutdown().await;
    }

    // ── Event handling ───────────────────────────────────────────

    fn on_event(&mut self, event: SchedulerEvent) {
        trace!(?event, "scheduler event");
        match event {
            SchedulerEvent::FrameReady(id) => self.enqueue(id),
            SchedulerEvent::SessionDraining(id) => {
                if self.queued.remove(&id) {
                    self.ready.retain(|s| *s != id);
                }
                if let Some(worker) = self.outstanding.get(&id) {
                    let busy_for = self.workers.get(worker.0).and_then(WorkerState::busy_for);
                    debug!(session = %id, %worker, ?busy_for, "draining; waiting for outstanding job");
                    self.draining.insert(id);
                } else {
                    self.finalize(id);
                }
            }
        }
    }

    fn on_report(&mut self, report: JobReport) {
        let JobReport {
            worker,
            session: id,
            outcome,
            latency,
        } = report;

        if let Some(state) = self.workers.get_mut(worker.0) {
            let was = std::mem::take(state);
            if was.session() != Some(id) {
                error!(%worker, session = %id, ?was, "report does not match worker table");
            }
        }
        self.idle.push_back(worker);
        self.outstanding.remove(&id);
        let was_draining = self.draining.remove(&id);

        let Some(session) = self.registry.get(id) else {
            debug!(session = %id, "result for unknown session discarded");
            return;
        };

        let result = match outcome {
            JobOutcome::Done(frame) => {
                trace!(session = %id, seq = frame.sequence(), ?latency, "job done");
                Some(frame)
            }
            JobOutcome::Failed(_) => None,
        };
        let ready_again = session.complete_job(result);

        if was_draining {
            self.finalize(id);
        } else if ready_again {
            self.enqueue(id);
        }
    }

    fn enqueue(&mut self, id: SessionId) {
        if self.outstanding.contains_key(&id) || self.draining.contains(&id) {
            return;
        }
        if self.queued.insert(id) {
            self.ready.push_back(id);
        }
    }

    /// Close and unregister a drained session.
    fn finalize(&mut self, id: SessionId) {
        if let Some(session) = self.registry.unregister(id) {
            session.close();
            info!(
                session = %id,
                received = session.frames_received(),
                sent = session.frames_sent(),
                "session closed"
            );
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    fn dispatch(&mut self) {
        while let Some(&worker) = self.idle.front() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            self.queued.remove(&id);

            let Some(session) = self.registry.get(id) else {
                continue;
            };

            let (frame, identity) = match session.claim_job(self.stale_after) {
                Claim::Job(frame, identity) => (frame, identity),
                Claim::Stale(frame) => {
                    self.stats.record_dropped();
                    debug!(session = %id, seq = frame.sequence(), "stale frame dropped");
                    continue;
                }
                Claim::Unavailable => continue,
            };
            debug_assert!(!self.outstanding.contains_key(&id));
            debug_assert!(self.workers[worker.0].is_idle());

            self.idle.pop_front();
            let seq = frame.sequence();
            let job = Job {
                session: id,
                frame,
                identity,
            };
            match self.pool.offer(worker, job) {
                Ok(()) => {
                    self.workers[worker.0] = WorkerState::Busy {
                        session: id,
                        since: Instant::now(),
                    };
                    self.outstanding.insert(id, worker);
                    trace!(session = %id, %worker, seq, "dispatched");
                }
                Err(job) => {
                    // The worker is gone; retire it and give the frame
                    // back unless a newer one already arrived.
                    error!(%worker, "worker refused a job; retiring it");
                    session.restore_pending(job.frame);
                    if session.complete_job(None) {
                        self.queued.insert(id);
                        self.ready.push_front(id);
                    }
                }
            }
        }
    }
}
