//! Relay-wide throughput and latency counters.
//!
//! Counters are plain atomics so workers can record completions without
//! contending with readers. The latency average is an exponentially
//! weighted moving average kept behind a mutex that is only held for a
//! multiply-add.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::wall_clock_secs;
use crate::registry::SessionRegistry;
use crate::session::ClientSession;

/// Weight given to the newest latency sample.
const LATENCY_ALPHA: f64 = 0.1;

// ── StatsSnapshot ────────────────────────────────────────────────

/// Point-in-time view of the relay counters.
///
/// Serialized field names are the ones clients read from the `stats`
/// message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(rename = "connected_clients")]
    pub connected_sessions: usize,
    pub frames_processed: u64,
    /// Rolling mean processing latency in seconds.
    #[serde(rename = "processing_time_avg")]
    pub average_latency: f64,
    #[serde(default)]
    pub frames_received: u64,
    #[serde(default)]
    pub frames_sent: u64,
    /// Frames superseded by a newer one or dropped as stale.
    #[serde(default)]
    pub frames_dropped: u64,
    #[serde(default)]
    pub processing_failures: u64,
    #[serde(default)]
    pub decode_errors: u64,
    /// Seconds since the relay started.
    #[serde(default)]
    pub uptime: f64,
    /// Per-session counters keyed by session id.
    #[serde(default)]
    pub client_details: BTreeMap<String, SessionDetails>,
}

/// One entry of [`StatsSnapshot::client_details`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDetails {
    /// Wall-clock connect time, seconds since the Unix epoch.
    pub connected_at: f64,
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Seconds since the client last sent anything.
    pub idle: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

impl SessionDetails {
    fn of(session: &ClientSession, now: f64) -> Self {
        Self {
            connected_at: now - session.age().as_secs_f64(),
            frames_received: session.frames_received(),
            frames_sent: session.frames_sent(),
            idle: session.idle_for().as_secs_f64(),
            peer: session.peer().map(|p| p.to_string()),
        }
    }
}

// ── Ewma ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Ewma {
    value: f64,
    seeded: bool,
}

impl Ewma {
    fn record(&mut self, sample: f64) {
        if self.seeded {
            self.value = self.value * (1.0 - LATENCY_ALPHA) + sample * LATENCY_ALPHA;
        } else {
            self.value = sample;
            self.seeded = true;
        }
    }
}

// ── StatsAggregator ──────────────────────────────────────────────

/// Shared counters observed by every worker and connection task.
#[derive(Debug)]
pub struct StatsAggregator {
    registry: Arc<SessionRegistry>,
    frames_received: AtomicU64,
    frames_processed: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    processing_failures: AtomicU64,
    decode_errors: AtomicU64,
    latency: Mutex<Ewma>,
    started: Instant,
}

impl StatsAggregator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            frames_received: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            processing_failures: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            latency: Mutex::new(Ewma::default()),
            started: Instant::now(),
        }
    }

    /// Record a successfully processed job and its processing latency.
    pub fn record_completion(&self, latency: Duration) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        // A poisoned lock only means another recorder panicked mid
        // multiply-add; the value is still a usable f64.
        let mut ewma = self.latency.lock().unwrap_or_else(|p| p.into_inner());
        ewma.record(latency.as_secs_f64());
    }

    pub fn record_failure(&self) {
        self.processing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let average_latency = self
            .latency
            .lock()
            .map(|e| e.value)
            .unwrap_or_else(|p| p.into_inner().value);
        let sessions = self.registry.snapshot();
        let now = wall_clock_secs();
        let client_details = sessions
            .iter()
            .map(|s| (s.id().to_string(), SessionDetails::of(s, now)))
            .collect();
        StatsSnapshot {
            connected_sessions: sessions.len(),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            average_latency,
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime: self.started.elapsed().as_secs_f64(),
            client_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> StatsAggregator {
        StatsAggregator::new(Arc::new(SessionRegistry::new()))
    }

    #[test]
    fn empty_snapshot() {
        let snap = aggregator().snapshot();
        assert!(snap.uptime >= 0.0);
        assert_eq!(
            snap,
            StatsSnapshot {
                uptime: snap.uptime,
                ..StatsSnapshot::default()
            }
        );
    }

    #[test]
    fn snapshot_is_idempotent() {
        let stats = aggregator();
        stats.record_completion(Duration::from_millis(40));
        stats.record_received();
        let a = stats.snapshot();
        let b = stats.snapshot();
        assert_eq!(a.frames_processed, b.frames_processed);
        assert_eq!(a.frames_received, b.frames_received);
        assert_eq!(a.average_latency, b.average_latency);
        assert!(b.uptime >= a.uptime);
    }

    #[test]
    fn snapshot_lists_every_session() {
        use crate::frame::{Frame, SourceIdentity};
        use crate::state::SessionId;
        use bytes::Bytes;

        let registry = Arc::new(SessionRegistry::new());
        let stats = StatsAggregator::new(Arc::clone(&registry));
        let peer = "10.0.0.7:5000".parse().ok();
        let a = Arc::new(ClientSession::new(SessionId::next(), peer));
        let b = Arc::new(ClientSession::new(SessionId::next(), None));
        a.configure(Arc::new(SourceIdentity::from_image(Bytes::from_static(b"a"))))
            .unwrap();
        a.submit_frame(Frame::new(Bytes::from_static(b"f"), 1.0, 0)).unwrap();
        a.record_sent();
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        std::thread::sleep(Duration::from_millis(5));
        let snap = stats.snapshot();
        assert_eq!(snap.connected_sessions, 2);
        assert_eq!(snap.client_details.len(), 2);
        assert!(snap.uptime > 0.0);

        let details = &snap.client_details[&a.id().to_string()];
        assert_eq!(details.frames_received, 1);
        assert_eq!(details.frames_sent, 1);
        assert_eq!(details.peer.as_deref(), Some("10.0.0.7:5000"));
        assert!(details.connected_at <= wall_clock_secs());
        assert!(details.connected_at > wall_clock_secs() - 60.0);
        assert!(snap.client_details[&b.id().to_string()].peer.is_none());

        let v: serde_json::Value = serde_json::to_value(&snap).unwrap();
        assert!(v["uptime"].as_f64().is_some());
        assert_eq!(v["client_details"][a.id().to_string()]["frames_sent"], 1);
    }

    #[test]
    fn first_sample_seeds_average() {
        let stats = aggregator();
        stats.record_completion(Duration::from_millis(100));
        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 1);
        assert!((snap.average_latency - 0.1).abs() < 1e-9);
    }

    #[test]
    fn average_is_ewma() {
        let stats = aggregator();
        stats.record_completion(Duration::from_millis(100));
        stats.record_completion(Duration::from_millis(200));
        // 0.1 * 0.9 + 0.2 * 0.1 = 0.11
        let snap = stats.snapshot();
        assert!((snap.average_latency - 0.11).abs() < 1e-9, "{}", snap.average_latency);
        assert_eq!(snap.frames_processed, 2);
    }

    #[test]
    fn failures_do_not_count_as_processed() {
        let stats = aggregator();
        stats.record_failure();
        stats.record_dropped();
        stats.record_decode_error();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_processed, 0);
        assert_eq!(snap.processing_failures, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.decode_errors, 1);
    }

    #[test]
    fn concurrent_recorders() {
        let stats = Arc::new(aggregator());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_completion(Duration::from_millis(5));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().frames_processed, 8000);
    }
}
