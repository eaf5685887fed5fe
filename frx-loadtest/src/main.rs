//! frx load tester: drives N concurrent clients against a relay.
//!
//! ```text
//! frx-loadtest                              2 clients, 5 fps, 30 s
//! frx-loadtest --clients 8 --fps 15         heavier load
//! frx-loadtest --url ws://host:8765         remote relay
//! ```

use std::time::{Duration, Instant};

use clap::Parser;
use frx_core::protocol::wall_clock_secs;
use frx_core::{ClientReceiver, ConfirmationStatus, FrxError, RelayClient, ServerMessage, synthetic_jpeg};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug, Clone)]
#[command(name = "frx-loadtest", about = "Multi-client load generator for the frx relay")]
struct Cli {
    /// Relay URL.
    #[arg(long, default_value = "ws://localhost:8765")]
    url: String,

    /// Number of concurrent clients.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..=256))]
    clients: u32,

    /// Frames per second per client.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..=120))]
    fps: u32,

    /// Test duration in seconds.
    #[arg(short, long, default_value_t = 30)]
    duration: u64,

    /// Seconds between stats requests.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

// ── Per-client run ───────────────────────────────────────────────

#[derive(Debug)]
struct ClientReport {
    id: u32,
    sent: u64,
    received: u64,
    rtt_total: f64,
    elapsed: Duration,
}

impl ClientReport {
    fn mean_rtt_ms(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        self.rtt_total / self.received as f64 * 1000.0
    }
}

/// Results still in flight when sending stops get this long to arrive.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

async fn run_client(id: u32, cli: Cli) -> Result<ClientReport, FrxError> {
    let client = RelayClient::connect(&cli.url).await?;
    info!(client = id, "connected to {}", cli.url);
    let (mut tx, rx) = client.into_split();

    tx.send_source_face(&synthetic_jpeg(format!("source face {id}").as_bytes()))
        .await?;
    let receiver = tokio::spawn(receive(id, rx));

    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.duration);
    let mut frames = tokio::time::interval(Duration::from_secs(1) / cli.fps);
    let mut stats = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    stats.tick().await;

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = frames.tick() => {
                let image = synthetic_jpeg(format!("client {id} frame {sent}").as_bytes());
                if let Err(e) = tx.send_frame(&image, wall_clock_secs()).await {
                    warn!(client = id, "send failed: {e}");
                    break;
                }
                sent += 1;
            }
            _ = stats.tick() => tx.request_stats().await?,
        }
    }

    tokio::time::sleep(DRAIN_GRACE.min(Duration::from_secs(cli.duration))).await;
    let _ = tx.close().await;
    let (received, rtt_total) = match tokio::time::timeout(DRAIN_GRACE, receiver).await {
        Ok(Ok(totals)) => totals,
        _ => {
            warn!(client = id, "receiver did not finish");
            (0, 0.0)
        }
    };

    Ok(ClientReport {
        id,
        sent,
        received,
        rtt_total,
        elapsed: start.elapsed(),
    })
}

/// Count processed frames and sum their round-trip times until the server
/// closes the connection.
async fn receive(id: u32, mut rx: ClientReceiver) -> (u64, f64) {
    let mut received = 0u64;
    let mut rtt_total = 0.0;
    loop {
        let message = match rx.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(client = id, "receive failed: {e}");
                break;
            }
        };
        match message {
            ServerMessage::ProcessedFrame { timestamp, .. } => {
                received += 1;
                rtt_total += (wall_clock_secs() - timestamp).max(0.0);
                if received % 10 == 0 {
                    info!(client = id, received, "processed frames");
                }
            }
            ServerMessage::SourceFaceConfirmation { status, message } => match status {
                ConfirmationStatus::Success => info!(client = id, "source face registered: {message}"),
                ConfirmationStatus::Error => warn!(client = id, "source face error: {message}"),
            },
            ServerMessage::Stats { data } => info!(
                client = id,
                connected = data.connected_sessions,
                processed = data.frames_processed,
                avg_latency_ms = data.average_latency * 1000.0,
                uptime_s = data.uptime,
                "server stats"
            ),
            _ => {}
        }
    }
    (received, rtt_total)
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        clients = cli.clients,
        fps = cli.fps,
        duration_s = cli.duration,
        "starting load test against {}",
        cli.url
    );

    let runs = (1..=cli.clients).map(|id| run_client(id, cli.clone()));
    let results = futures::future::join_all(runs).await;

    let mut total_sent = 0;
    let mut total_received = 0;
    for (id, result) in (1..=cli.clients).zip(results) {
        match result {
            Ok(report) => {
                let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
                println!(
                    "client {:>3}: sent {:>6} ({:.1} fps)  received {:>6} ({:.1} fps)  mean rtt {:.1} ms",
                    report.id,
                    report.sent,
                    report.sent as f64 / secs,
                    report.received,
                    report.received as f64 / secs,
                    report.mean_rtt_ms(),
                );
                total_sent += report.sent;
                total_received += report.received;
            }
            Err(e) => println!("client {id:>3}: failed: {e}"),
        }
    }

    let rate = if total_sent > 0 {
        total_received as f64 / total_sent as f64 * 100.0
    } else {
        0.0
    };
    println!("total: sent {total_sent}  received {total_received}  delivered {rate:.1}%");
    Ok(())
}
