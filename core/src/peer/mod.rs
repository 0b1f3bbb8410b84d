//! Peer bookkeeping: who we have heard from and which transport device
//! each peer sits behind.

pub mod device_index;
pub mod registry;

pub use device_index::DeviceIndex;
pub use registry::{PeerEvents, PeerInfo, PeerRegistry};
