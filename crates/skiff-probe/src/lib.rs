//! Skiff probe agent
//!
//! Runs on a managed host and keeps one authenticated websocket session
//! with the Skiff control plane:
//! - one-shot enrollment and token authentication over HTTP
//! - heartbeats and system snapshots on independent tickers
//! - log streaming from files, systemd journal and Windows event logs

pub mod api;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logs;
pub mod session;
pub mod snapshot;
pub mod tls;

pub use config::{ProbeConfig, RuntimeConfig};
pub use envelope::Envelope;
pub use error::{ProbeError, ProbeResult};
pub use session::{Agent, SessionState};

/// Reported in the `hello` envelope
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
