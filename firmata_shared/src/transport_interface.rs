//! Byte-stream transport seam between the protocol engine and whatever
//! carries the bytes (serial port, bridge, simulator).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport is closed")]
    Closed,
    #[error("Transport error: {0}")]
    Other(String),
}

/// Signals a transport raises towards the engine, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Data(Vec<u8>),
    Close,
    Disconnect,
    Error(String),
}

/// Outbound half of a transport. The inbound half is a channel of
/// [`TransportEvent`]s handed to the engine alongside it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Human readable name used in logs.
    fn name(&self) -> String {
        "transport".to_string()
    }
}
