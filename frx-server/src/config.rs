//! Configuration for the relay server.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use frx_core::{Passthrough, RelayOptions, Simulated, Transformer};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// TLS settings. TLS is on when both paths are set.
    pub tls: TlsConfig,
    /// Frame processing.
    pub processing: ProcessingConfig,
    /// Session lifetime.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub host: String,
    /// WebSocket port.
    pub port: u16,
    /// Maximum concurrent client sessions.
    pub max_connections: usize,
    /// Drop connections whose TLS or WebSocket handshake takes longer.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain. Empty disables TLS.
    pub cert_path: String,
    /// PEM private key. Empty disables TLS.
    pub key_path: String,
}

/// Which built-in transformer to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformerKind {
    Passthrough,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Inference backend name, e.g. "cuda" or "cpu". Handed to the
    /// transformer.
    pub execution_provider: String,
    /// Worker pool size.
    pub execution_threads: usize,
    pub transformer: TransformerKind,
    /// Per-frame delay of the simulated transformer.
    pub simulated_latency_ms: u64,
    /// Fail every k-th simulated frame. 0 disables.
    pub fail_every: u64,
    /// Drop frames that waited longer than this for a worker. 0 disables.
    pub stale_frame_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close sessions that sent nothing for this long.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
            max_connections: 64,
            handshake_timeout_secs: 10,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            execution_provider: "cuda".into(),
            execution_threads: 4,
            transformer: TransformerKind::Passthrough,
            simulated_latency_ms: 40,
            fail_every: 0,
            stale_frame_ms: 500,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// TLS certificate and key paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        if self.tls.cert_path.is_empty() || self.tls.key_path.is_empty() {
            return None;
        }
        Some((Path::new(&self.tls.cert_path), Path::new(&self.tls.key_path)))
    }

    /// Convert into the core's runtime options.
    pub fn to_relay_options(&self) -> RelayOptions {
        let ip = self.network.host.parse::<IpAddr>().unwrap_or_else(|_| {
            tracing::warn!("invalid host {:?}; binding 0.0.0.0", self.network.host);
            IpAddr::from([0, 0, 0, 0])
        });
        RelayOptions {
            bind_addr: SocketAddr::new(ip, self.network.port),
            workers: self.processing.execution_threads.max(1),
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs.max(1)),
            stale_after: (self.processing.stale_frame_ms > 0)
                .then(|| Duration::from_millis(self.processing.stale_frame_ms)),
            max_connections: self.network.max_connections.max(1),
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs.max(1)),
        }
    }

    /// Instantiate the configured transformer.
    pub fn build_transformer(&self) -> Arc<dyn Transformer> {
        let provider = self.processing.execution_provider.as_str();
        match self.processing.transformer {
            TransformerKind::Passthrough => {
                Arc::new(Passthrough::default().on_provider(provider))
            }
            TransformerKind::Simulated => Arc::new(
                Simulated::new(Duration::from_millis(self.processing.simulated_latency_ms))
                    .failing_every(self.processing.fail_every)
                    .on_provider(provider),
            ),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        assert!(text.contains("port = 8765"));
        assert!(text.contains("execution_provider"));
        assert!(text.contains("idle_timeout_secs"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 8765);
        assert_eq!(parsed.processing.transformer, TransformerKind::Passthrough);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str(
            "[processing]\ntransformer = \"simulated\"\nexecution_threads = 2\n",
        )
        .unwrap();
        assert_eq!(parsed.processing.transformer, TransformerKind::Simulated);
        assert_eq!(parsed.processing.execution_threads, 2);
        assert_eq!(parsed.network.port, 8765);
        assert_eq!(parsed.build_transformer().name(), "simulated");
    }

    #[test]
    fn execution_provider_reaches_transformer() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.build_transformer().execution_provider(), Some("cuda"));
        cfg.processing.transformer = TransformerKind::Simulated;
        cfg.processing.execution_provider = "cpu".into();
        assert_eq!(cfg.build_transformer().execution_provider(), Some("cpu"));
    }

    #[test]
    fn to_relay_options_clamps() {
        let mut cfg = ServerConfig::default();
        cfg.processing.execution_threads = 0;
        cfg.processing.stale_frame_ms = 0;
        cfg.network.host = "127.0.0.1".into();
        cfg.network.port = 9000;
        let opts = cfg.to_relay_options();
        assert_eq!(opts.workers, 1);
        assert_eq!(opts.stale_after, None);
        assert_eq!(opts.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(opts.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn tls_requires_both_paths() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.tls_paths().is_none());
        cfg.tls.cert_path = "cert.pem".into();
        assert!(cfg.tls_paths().is_none());
        cfg.tls.key_path = "key.pem".into();
        assert!(cfg.tls_paths().is_some());
    }

    #[test]
    fn write_default_then_load() {
        let path = std::env::temp_dir().join(format!("frx-server-{}.toml", std::process::id()));
        ServerConfig::write_default(&path).unwrap();
        let cfg = ServerConfig::load(&path);
        assert_eq!(cfg.session.idle_timeout_secs, 60);
        assert_eq!(cfg.processing.stale_frame_ms, 500);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = ServerConfig::load(Path::new("/nonexistent/frx-server.toml"));
        assert_eq!(cfg.network.port, 8765);
    }
}
