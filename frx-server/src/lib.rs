//! # frx-server: real-time frame relay
//!
//! WebSocket server that accepts webcam streams, runs each frame through
//! the configured transformer on a bounded worker pool, and streams the
//! results back to the originating client.
//!
//! ## Sources of settings
//!
//! - **TOML file** (`--config`, default `frx-server.toml`)
//! - **CLI flags**, which override the file

pub mod config;
pub mod tls;
