//! Skiff plugin wire contract
//!
//! Shared by the host supervisor and by plugin binaries:
//! - Handshake and framing over the plugin's stdio (`protocol`, `transport`)
//! - Multiplexed request/response client with capability-typed wrappers (`client`, `capability`)
//! - Service traits and the plugin-side serve loop (`server`)

pub mod capability;
pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

pub use capability::{AutomationClient, CoreClient, KycClient, PaymentClient, SmsClient};
pub use client::RpcClient;
pub use protocol::{Handshake, RpcStatus, Service, StatusCode};

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("plugin returned {0}")]
    Status(RpcStatus),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("plugin does not advertise the {0} service")]
    ServiceNotAdvertised(Service),
}

impl RpcError {
    /// Whether the failure came from the transport rather than the plugin's own logic
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::DeadlineExceeded | Self::Protocol(_)
        )
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Bound an RPC future by `deadline`
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> RpcResult<T>
where
    F: Future<Output = RpcResult<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| RpcError::DeadlineExceeded)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_deadline_maps_elapsed_to_deadline_exceeded() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, RpcError>(1)
        };
        let err = with_deadline(Duration::from_secs(2), slow).await.unwrap_err();
        assert_eq!(err, RpcError::DeadlineExceeded);
        assert!(err.is_transport());

        let fast = async { Ok::<_, RpcError>(7) };
        assert_eq!(with_deadline(Duration::from_secs(2), fast).await.unwrap(), 7);
    }
}
