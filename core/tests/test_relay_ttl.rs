// Flood relay semantics: forwarded packets lose exactly one TTL hop, a
// spent hop budget stops the flood, and relayed signatures stay valid.

mod common;

use common::{spawn_node, wait_for};
use lantern_core::noise::xx::XxBackend;
use lantern_core::protocol::codec;
use lantern_core::security::SecurityManager;
use lantern_core::transport::{chunk, MemoryBus};
use lantern_core::{MeshIdentity, MeshPacket, PacketType};

/// A signed packet from an identity that exists nowhere on the bus, so
/// every hop it takes is a relay.
fn ghost_packet(ttl: u8, content: &str) -> (MeshPacket, Vec<u8>) {
    let ghost = SecurityManager::new(MeshIdentity::generate(), Box::new(XxBackend));
    let mut packet = MeshPacket::broadcast(
        PacketType::Message,
        ghost.local_peer_id(),
        content.as_bytes().to_vec(),
    );
    packet.ttl = ttl;
    ghost.sign_packet(&mut packet);
    let frame = codec::encode(&packet).unwrap();
    (packet, frame)
}

/// Push an encoded frame into `node` as if a device had delivered it.
async fn inject(node: &common::TestNode, device: &str, frame: &[u8]) {
    for piece in chunk::split_frame(frame, 500) {
        node.service.handle_incoming(device, &piece).await;
    }
}

#[tokio::test]
async fn relay_decrements_ttl_once() {
    let bus = MemoryBus::new();
    let relay = spawn_node(&bus, "node-relay");
    let observer = spawn_node(&bus, "node-observer");

    let (packet, frame) = ghost_packet(3, "passed along");
    inject(&relay, "ghost-dev", &frame).await;

    // The relay node itself delivers the message...
    wait_for(
        || !relay.delegate.public.lock().is_empty(),
        "delivery at the relay",
    )
    .await;
    // ...and the observer hears the forwarded copy.
    wait_for(
        || {
            observer
                .delegate
                .public
                .lock()
                .iter()
                .any(|(from, _, content)| *from == packet.sender && content == "passed along")
        },
        "relayed delivery at the observer",
    )
    .await;
}

#[tokio::test]
async fn last_hop_is_not_forwarded() {
    let bus = MemoryBus::new();
    let relay = spawn_node(&bus, "node-relay");
    let observer = spawn_node(&bus, "node-observer");

    let (_, frame) = ghost_packet(1, "end of the line");
    inject(&relay, "ghost-dev", &frame).await;

    wait_for(
        || !relay.delegate.public.lock().is_empty(),
        "delivery at the relay",
    )
    .await;
    // Give any (wrong) forwarding a chance to land, then check silence.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(observer.delegate.public.lock().is_empty());
}

#[tokio::test]
async fn zero_ttl_is_not_relayed_at_all() {
    let bus = MemoryBus::new();
    let relay = spawn_node(&bus, "node-relay");
    let observer = spawn_node(&bus, "node-observer");

    let (_, frame) = ghost_packet(0, "stillborn");
    inject(&relay, "ghost-dev", &frame).await;

    // TTL 0 still delivers locally; it just cannot travel.
    wait_for(
        || !relay.delegate.public.lock().is_empty(),
        "delivery at the relay",
    )
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(observer.delegate.public.lock().is_empty());
}

#[test]
fn relayed_signature_survives_ttl_mutation() {
    let identity = MeshIdentity::generate();
    let manager = SecurityManager::new(identity.clone(), Box::new(XxBackend));
    let mut packet = MeshPacket::broadcast(
        PacketType::Message,
        manager.local_peer_id(),
        b"over the hills".to_vec(),
    );
    packet.ttl = 3;
    manager.sign_packet(&mut packet);

    // Two relay hops: decrement, re-encode, decode, decrement again.
    packet.ttl -= 1;
    let hop1 = codec::decode(&codec::encode(&packet).unwrap()).unwrap();
    let mut hop2 = hop1.clone();
    hop2.ttl -= 1;

    assert!(SecurityManager::verify_packet(
        &hop2,
        &identity.signing.public_key_bytes()
    ));
}
