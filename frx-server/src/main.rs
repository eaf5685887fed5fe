//! frx relay server entry point.
//!
//! ```text
//! frx-server                          Run with frx-server.toml or defaults
//! frx-server --config <path>          Load a custom config TOML
//! frx-server --server-port 9000       Override the listen port
//! frx-server --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use frx_core::RelayServer;
use frx_server::config::ServerConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "frx-server", about = "Real-time frame relay server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "frx-server.toml")]
    config: PathBuf,

    /// WebSocket listen port.
    #[arg(long)]
    server_port: Option<u16>,

    /// Inference backend, e.g. "cuda" or "cpu".
    #[arg(long)]
    execution_provider: Option<String>,

    /// Number of processing workers.
    #[arg(long)]
    execution_threads: Option<usize>,

    /// PEM certificate chain; enables TLS together with --tls-key.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Seconds of client silence before a session is closed.
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.server_port {
            config.network.port = port;
        }
        if let Some(provider) = &self.execution_provider {
            config.processing.execution_provider = provider.clone();
        }
        if let Some(threads) = self.execution_threads {
            config.processing.execution_threads = threads;
        }
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_path = cert.display().to_string();
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_path = key.display().to_string();
        }
        if let Some(secs) = self.idle_timeout {
            config.session.idle_timeout_secs = secs;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("frx-server v{}", env!("CARGO_PKG_VERSION"));
    info!("workers: {}", config.processing.execution_threads.max(1));

    let tls = match config.tls_paths() {
        Some((cert, key)) => Some(frx_server::tls::load_acceptor(cert, key)?),
        None => None,
    };

    let server =
        RelayServer::bind(config.to_relay_options(), config.build_transformer(), tls).await?;
    let shutdown = server.shutdown_token();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        shutdown.cancel();
    });

    if let Err(e) = server.run().await {
        error!("relay failed: {e}");
        return Err(e.into());
    }
    Ok(())
}
