// Identity key material.
//
// Every node holds two long-term keypairs: an Ed25519 pair for packet
// signatures and an X25519 static pair for Noise handshakes. The wire peer
// ID is derived from the signing public key, so identity and peer ID can
// never drift apart.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::protocol::{PeerId, PEER_ID_LEN, SIGNATURE_LEN};

/// Ed25519 signing keypair used for packet authentication.
#[derive(Clone)]
pub struct SigningKeys {
    signing_key: SigningKey,
}

impl SigningKeys {
    /// Generate a new random signing keypair.
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *secret);
        SigningKeys {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Restore from a 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        SigningKeys {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify `signature` over `message` against an arbitrary public key.
    pub fn verify_with(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let sig = Ed25519Signature::from_bytes(signature);
        verifying_key.verify(message, &sig).is_ok()
    }
}

/// X25519 static keypair used as the Noise "s" key.
#[derive(Clone)]
pub struct NoiseKeypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl NoiseKeypair {
    pub fn generate() -> Self {
        let mut secret_bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *secret_bytes);
        let secret = StaticSecret::from(*secret_bytes);
        let public = X25519PublicKey::from(&secret);
        NoiseKeypair { secret, public }
    }

    /// Restore from a 32-byte secret. Rejects the all-zero seed, which
    /// would pin every shared secret to the identity point.
    pub fn from_secret_bytes(secret_bytes: &[u8; 32]) -> Option<Self> {
        if secret_bytes.iter().all(|&b| b == 0) {
            return None;
        }
        let secret = StaticSecret::from(*secret_bytes);
        let public = X25519PublicKey::from(&secret);
        Some(NoiseKeypair { secret, public })
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Diffie-Hellman against a remote public key.
    ///
    /// Rejects keys that are not exactly 32 bytes or are all zero; an
    /// all-zero key would force the shared secret onto a small subgroup.
    pub fn diffie_hellman(&self, remote_public: &[u8]) -> Option<Zeroizing<[u8; 32]>> {
        let key_bytes = <[u8; 32]>::try_from(remote_public).ok()?;
        if key_bytes.iter().all(|&b| b == 0) {
            return None;
        }
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(key_bytes));
        Some(Zeroizing::new(shared.to_bytes()))
    }
}

/// A node's complete identity: both keypairs plus the derived peer ID.
#[derive(Clone)]
pub struct MeshIdentity {
    pub signing: SigningKeys,
    pub noise: NoiseKeypair,
    peer_id: PeerId,
}

impl MeshIdentity {
    pub fn generate() -> Self {
        Self::from_keys(SigningKeys::generate(), NoiseKeypair::generate())
    }

    pub fn from_keys(signing: SigningKeys, noise: NoiseKeypair) -> Self {
        let peer_id = derive_peer_id(&signing.public_key_bytes());
        MeshIdentity {
            signing,
            noise,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

/// Peer ID derivation: the first 8 bytes of SHA-256 over the signing
/// public key.
pub fn derive_peer_id(signing_public_key: &[u8]) -> PeerId {
    let digest = Sha256::digest(signing_public_key);
    let mut bytes = [0u8; PEER_ID_LEN];
    bytes.copy_from_slice(&digest[..PEER_ID_LEN]);
    PeerId::from_bytes(bytes)
}
