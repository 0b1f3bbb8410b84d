//! Long-term key material and the derived mesh identity.

pub mod keys;

pub use keys::{MeshIdentity, NoiseKeypair, SigningKeys};
