//! Transport boundary.
//!
//! The engine never touches radios directly. A platform implements
//! [`Transport`] for outbound frames and pushes inbound frames plus
//! connection events into the mesh service. Frames are chunked to the
//! transport MTU on the way out and reassembled on the way in.

pub mod chunk;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use chunk::{ChunkReassembler, DEFAULT_MTU};
pub use memory::{MemoryBus, MemoryTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of a platform link layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to a specific device.
    async fn send_to(&self, device: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Send one frame to every connected device.
    async fn broadcast(&self, data: &[u8]) -> Result<(), TransportError>;
}
