// In-memory transport for tests.
//
// A bus holds one inbound queue per attached node. `send_to` drops a frame
// into the named node's queue tagged with the sender's address; `broadcast`
// fans out to every other node. Tests drain the queues and feed frames
// back into their mesh services.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportError};

/// A frame delivered to a node: (sending device address, bytes).
pub type InboundFrame = (String, Vec<u8>);

#[derive(Default)]
struct BusState {
    nodes: HashMap<String, mpsc::UnboundedSender<InboundFrame>>,
}

/// Shared bus connecting any number of in-memory transports.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBus::default())
    }

    /// Attach a node; returns its transport handle and inbound queue.
    pub fn attach(
        self: &Arc<Self>,
        address: &str,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().nodes.insert(address.to_string(), tx);
        (
            MemoryTransport {
                bus: Arc::clone(self),
                address: address.to_string(),
            },
            rx,
        )
    }

    /// Detach a node; its queue closes.
    pub fn detach(&self, address: &str) {
        self.state.lock().nodes.remove(address);
    }
}

/// One node's handle onto the bus.
pub struct MemoryTransport {
    bus: Arc<MemoryBus>,
    address: String,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, device: &str, data: &[u8]) -> Result<(), TransportError> {
        let sender = {
            let state = self.bus.state.lock();
            state
                .nodes
                .get(device)
                .cloned()
                .ok_or_else(|| TransportError::UnknownDevice(device.to_string()))?
        };
        sender
            .send((self.address.clone(), data.to_vec()))
            .map_err(|_| TransportError::SendFailed(device.to_string()))
    }

    async fn broadcast(&self, data: &[u8]) -> Result<(), TransportError> {
        let targets: Vec<_> = {
            let state = self.bus.state.lock();
            state
                .nodes
                .iter()
                .filter(|(address, _)| *address != &self.address)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            // A detached receiver is not an error for a broadcast.
            let _ = tx.send((self.address.clone(), data.to_vec()));
        }
        Ok(())
    }
}
