//! Fixed-size pool of transformation workers.
//!
//! Each worker owns a channel of capacity one: the scheduler can offer it
//! exactly one job, and cannot offer another until the worker reports back.
//! Workers only call the [`Transformer`]; they never touch the network.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProcessingError;
use crate::frame::{Frame, SourceIdentity};
use crate::state::{SessionId, WorkerId};
use crate::stats::StatsAggregator;
use crate::transform::Transformer;

// ── Job ──────────────────────────────────────────────────────────

/// One claimed frame on its way through a worker.
#[derive(Debug)]
pub struct Job {
    /// Non-owning reference to the originating session.
    pub session: SessionId,
    pub frame: Frame,
    pub identity: Arc<SourceIdentity>,
}

/// Result of running a [`Job`].
#[derive(Debug)]
pub enum JobOutcome {
    /// Processed frame, carrying the original timestamp and sequence.
    Done(Frame),
    Failed(ProcessingError),
}

/// Sent back to the scheduler when a worker finishes a job.
#[derive(Debug)]
pub struct JobReport {
    pub worker: WorkerId,
    pub session: SessionId,
    pub outcome: JobOutcome,
    pub latency: Duration,
}

// ── WorkerPool ───────────────────────────────────────────────────

/// `N` long-lived worker tasks sharing one transformer.
pub struct WorkerPool {
    slots: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers. Reports flow into `report_tx`.
    ///
    /// `size` is clamped to at least one.
    pub fn spawn(
        size: usize,
        transformer: Arc<dyn Transformer>,
        stats: Arc<StatsAggregator>,
        report_tx: mpsc::UnboundedSender<JobReport>,
    ) -> Self {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::channel(1);
            let worker = Worker {
                id: WorkerId(index),
                rx,
                transformer: Arc::clone(&transformer),
                stats: Arc::clone(&stats),
                report_tx: report_tx.clone(),
            };
            slots.push(tx);
            handles.push(tokio::spawn(worker.run()));
        }

        Self { slots, handles }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Hand `job` to `worker`. Gives the job back if the worker is still
    /// holding one or has stopped.
    pub fn offer(&self, worker: WorkerId, job: Job) -> Result<(), Job> {
        let Some(slot) = self.slots.get(worker.0) else {
            return Err(job);
        };
        slot.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    /// Close every worker's queue and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        drop(self.slots);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────

struct Worker {
    id: WorkerId,
    rx: mpsc::Receiver<Job>,
    transformer: Arc<dyn Transformer>,
    stats: Arc<StatsAggregator>,
    report_tx: mpsc::UnboundedSender<JobReport>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            let report = self.execute(job).await;
            if self.report_tx.send(report).is_err() {
                // Scheduler is gone; nobody will offer more work.
                break;
            }
        }
        debug!(worker = %self.id, "worker stopped");
    }

    async fn execute(&self, job: Job) -> JobReport {
        let Job {
            session,
            frame,
            identity,
        } = job;
        let started = Instant::now();

        let call = self.transformer.process(frame.payload().clone(), identity);
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Aborted(format!(
                "{} panicked",
                self.transformer.name()
            ))),
        };
        let latency = started.elapsed();

        let outcome = match result {
            Ok(payload) => {
                self.stats.record_completion(latency);
                JobOutcome::Done(frame.with_payload(payload))
            }
            Err(e) => {
                warn!(worker = %self.id, %session, seq = frame.sequence(), "job failed: {e}");
                self.stats.record_failure();
                JobOutcome::Failed(e)
            }
        };

        JobReport {
            worker: self.id,
            session,
            outcome,
            latency,
        }
    }
}
