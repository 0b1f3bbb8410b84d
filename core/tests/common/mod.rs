// Shared scaffolding for the integration tests: an in-memory mesh node
// with a recording delegate and a pump task feeding transport frames back
// into the service.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use lantern_core::mesh::{MeshConfig, MeshService};
use lantern_core::transport::MemoryBus;
use lantern_core::{MeshDelegate, MeshIdentity, PeerId, PeerInfo, PrivateMessage};

#[derive(Default)]
pub struct Recorder {
    pub discovered: Mutex<Vec<PeerId>>,
    pub left: Mutex<Vec<PeerId>>,
    pub public: Mutex<Vec<(PeerId, String, String)>>,
    pub private: Mutex<Vec<(PeerId, PrivateMessage)>>,
    pub delivered: Mutex<Vec<(PeerId, String)>>,
    pub files: Mutex<Vec<(PeerId, Vec<u8>, bool)>>,
    pub sessions: Mutex<Vec<PeerId>>,
}

impl MeshDelegate for Recorder {
    fn peer_discovered(&self, info: &PeerInfo) {
        self.discovered.lock().push(info.peer_id);
    }
    fn peer_left(&self, peer: PeerId) {
        self.left.lock().push(peer);
    }
    fn public_message(&self, from: PeerId, nickname: String, content: String) {
        self.public.lock().push((from, nickname, content));
    }
    fn private_message(&self, from: PeerId, message: PrivateMessage) {
        self.private.lock().push((from, message));
    }
    fn delivery_confirmed(&self, from: PeerId, message_id: String) {
        self.delivered.lock().push((from, message_id));
    }
    fn file_received(&self, from: PeerId, data: Vec<u8>, private: bool) {
        self.files.lock().push((from, data, private));
    }
    fn session_established(&self, peer: PeerId) {
        self.sessions.lock().push(peer);
    }
}

pub struct TestNode {
    pub service: Arc<MeshService>,
    pub delegate: Arc<Recorder>,
    pub address: String,
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.service.peer_id()
    }
}

/// Attach a node to the bus and pump its inbound frames into the service.
pub fn spawn_node(bus: &Arc<MemoryBus>, name: &str) -> TestNode {
    spawn_node_with_identity(bus, name, MeshIdentity::generate())
}

/// Like [`spawn_node`], but with a caller-supplied identity, so one peer
/// can show up on the bus behind several device addresses.
pub fn spawn_node_with_identity(
    bus: &Arc<MemoryBus>,
    name: &str,
    identity: MeshIdentity,
) -> TestNode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (transport, mut rx) = bus.attach(name);
    let delegate = Arc::new(Recorder::default());
    let config = MeshConfig {
        nickname: name.to_string(),
        ..MeshConfig::default()
    };
    let service = MeshService::new(identity, config, Arc::new(transport), delegate.clone());
    let pump = service.clone();
    tokio::spawn(async move {
        while let Some((from, data)) = rx.recv().await {
            pump.handle_incoming(&from, &data).await;
        }
    });
    TestNode {
        service,
        delegate,
        address: name.to_string(),
    }
}

/// Poll `cond` until it holds, or fail the test.
pub async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
