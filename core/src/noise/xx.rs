// Noise_XX_25519_ChaChaPoly_SHA256.
//
// The XX pattern in three messages:
//
//   -> e              (32 bytes)
//   <- e, ee, s, es   (96 bytes)
//   -> s, se          (64 bytes)
//
// Both sides transmit their static keys encrypted, so neither identity is
// visible to a passive observer. Payloads are empty; the handshake carries
// keys only.
//
// ChaCha20-Poly1305 nonces follow the Noise convention: four zero bytes
// followed by the 64-bit counter in little-endian.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::identity::NoiseKeypair;

use super::engine::{HandshakeEngine, HandshakeRole, NoiseBackend, TransportCipher};
use super::NoiseError;

const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

const DH_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Wire sizes of the three pattern messages (empty payloads).
pub const XX_MESSAGE_1_LEN: usize = DH_LEN;
pub const XX_MESSAGE_2_LEN: usize = DH_LEN + (DH_LEN + TAG_LEN) + TAG_LEN;
pub const XX_MESSAGE_3_LEN: usize = (DH_LEN + TAG_LEN) + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac takes any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Two-output HKDF as defined by the Noise spec.
fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let temp = Zeroizing::new(hmac(chaining_key, ikm));
    let out1 = Zeroizing::new(hmac(&*temp, &[0x01]));
    let mut second_input = Zeroizing::new([0u8; 33]);
    second_input[..32].copy_from_slice(&*out1);
    second_input[32] = 0x02;
    let out2 = Zeroizing::new(hmac(&*temp, &*second_input));
    (out1, out2)
}

fn chacha_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

fn aead_encrypt(
    key: &[u8; 32],
    counter: u64,
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            &chacha_nonce(counter),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::DecryptFailed)
}

fn aead_decrypt(
    key: &[u8; 32],
    counter: u64,
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &chacha_nonce(counter),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| NoiseError::DecryptFailed)
}

/// CipherState: a key (once one exists) and an incrementing nonce.
struct CipherState {
    key: Option<Zeroizing<[u8; 32]>>,
    nonce: u64,
}

impl CipherState {
    fn new() -> Self {
        CipherState {
            key: None,
            nonce: 0,
        }
    }

    fn initialize_key(&mut self, key: Zeroizing<[u8; 32]>) {
        self.key = Some(key);
        self.nonce = 0;
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match &self.key {
            None => Ok(plaintext.to_vec()),
            Some(key) => {
                let out = aead_encrypt(key, self.nonce, ad, plaintext)?;
                self.nonce += 1;
                Ok(out)
            }
        }
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match &self.key {
            None => Ok(ciphertext.to_vec()),
            Some(key) => {
                let out = aead_decrypt(key, self.nonce, ad, ciphertext)?;
                self.nonce += 1;
                Ok(out)
            }
        }
    }
}

/// SymmetricState: chaining key, handshake hash, and the current cipher.
struct SymmetricState {
    chaining_key: Zeroizing<[u8; 32]>,
    hash: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    fn new() -> Self {
        // The protocol name is exactly hash-length, so it seeds h directly.
        let hash = *PROTOCOL_NAME;
        SymmetricState {
            chaining_key: Zeroizing::new(hash),
            hash,
            cipher: CipherState::new(),
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (chaining_key, cipher_key) = hkdf2(&self.chaining_key, ikm);
        self.chaining_key = chaining_key;
        self.cipher.initialize_key(cipher_key);
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let hash = self.hash;
        let ciphertext = self.cipher.encrypt_with_ad(&hash, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let hash = self.hash;
        let plaintext = self.cipher.decrypt_with_ad(&hash, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        hkdf2(&self.chaining_key, &[])
    }
}

/// An in-progress XX handshake.
pub struct XxHandshake {
    role: HandshakeRole,
    state: SymmetricState,
    local_static: NoiseKeypair,
    local_ephemeral: Option<NoiseKeypair>,
    remote_ephemeral: Option<[u8; 32]>,
    remote_static: Option<[u8; 32]>,
    /// Index of the next pattern message (0..=2); 3 means complete.
    step: u8,
}

impl XxHandshake {
    pub fn new(role: HandshakeRole, local_static: &NoiseKeypair) -> Self {
        XxHandshake {
            role,
            state: SymmetricState::new(),
            local_static: local_static.clone(),
            local_ephemeral: None,
            remote_ephemeral: None,
            remote_static: None,
            step: 0,
        }
    }

    fn dh(&self, local: &NoiseKeypair, remote: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, NoiseError> {
        local.diffie_hellman(remote).ok_or(NoiseError::InvalidKey)
    }

    fn local_ephemeral(&self) -> Result<&NoiseKeypair, NoiseError> {
        self.local_ephemeral
            .as_ref()
            .ok_or(NoiseError::HandshakeOutOfOrder)
    }

    fn remote_ephemeral(&self) -> Result<[u8; 32], NoiseError> {
        self.remote_ephemeral.ok_or(NoiseError::HandshakeOutOfOrder)
    }
}

impl HandshakeEngine for XxHandshake {
    fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut out = Vec::new();
        match (self.role, self.step) {
            // -> e
            (HandshakeRole::Initiator, 0) => {
                let ephemeral = NoiseKeypair::generate();
                out.extend_from_slice(&ephemeral.public_key_bytes());
                self.state.mix_hash(&ephemeral.public_key_bytes());
                self.local_ephemeral = Some(ephemeral);
                out.extend_from_slice(&self.state.encrypt_and_hash(payload)?);
            }
            // <- e, ee, s, es
            (HandshakeRole::Responder, 1) => {
                let ephemeral = NoiseKeypair::generate();
                out.extend_from_slice(&ephemeral.public_key_bytes());
                self.state.mix_hash(&ephemeral.public_key_bytes());
                let remote_e = self.remote_ephemeral()?;
                let ee = self.dh(&ephemeral, &remote_e)?;
                self.local_ephemeral = Some(ephemeral);
                self.state.mix_key(&*ee);
                let static_public = self.local_static.public_key_bytes();
                out.extend_from_slice(&self.state.encrypt_and_hash(&static_public)?);
                let es = self.dh(&self.local_static, &remote_e)?;
                self.state.mix_key(&*es);
                out.extend_from_slice(&self.state.encrypt_and_hash(payload)?);
            }
            // -> s, se
            (HandshakeRole::Initiator, 2) => {
                let static_public = self.local_static.public_key_bytes();
                out.extend_from_slice(&self.state.encrypt_and_hash(&static_public)?);
                let remote_e = self.remote_ephemeral()?;
                let se = self.dh(&self.local_static, &remote_e)?;
                self.state.mix_key(&*se);
                out.extend_from_slice(&self.state.encrypt_and_hash(payload)?);
            }
            _ => return Err(NoiseError::HandshakeOutOfOrder),
        }
        self.step += 1;
        Ok(out)
    }

    fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let payload = match (self.role, self.step) {
            // -> e
            (HandshakeRole::Responder, 0) => {
                if message.len() < DH_LEN {
                    return Err(NoiseError::Malformed);
                }
                let remote_e: [u8; 32] =
                    message[..DH_LEN].try_into().map_err(|_| NoiseError::Malformed)?;
                self.state.mix_hash(&remote_e);
                self.remote_ephemeral = Some(remote_e);
                self.state.decrypt_and_hash(&message[DH_LEN..])?
            }
            // <- e, ee, s, es
            (HandshakeRole::Initiator, 1) => {
                if message.len() < DH_LEN + DH_LEN + TAG_LEN + TAG_LEN {
                    return Err(NoiseError::Malformed);
                }
                let remote_e: [u8; 32] =
                    message[..DH_LEN].try_into().map_err(|_| NoiseError::Malformed)?;
                self.state.mix_hash(&remote_e);
                self.remote_ephemeral = Some(remote_e);
                let ee = self.dh(self.local_ephemeral()?, &remote_e)?;
                self.state.mix_key(&*ee);
                let static_end = DH_LEN + DH_LEN + TAG_LEN;
                let remote_s_plain = self.state.decrypt_and_hash(&message[DH_LEN..static_end])?;
                let remote_s: [u8; 32] =
                    remote_s_plain.as_slice().try_into().map_err(|_| NoiseError::Malformed)?;
                self.remote_static = Some(remote_s);
                let es = self.dh(self.local_ephemeral()?, &remote_s)?;
                self.state.mix_key(&*es);
                self.state.decrypt_and_hash(&message[static_end..])?
            }
            // -> s, se
            (HandshakeRole::Responder, 2) => {
                if message.len() < DH_LEN + TAG_LEN + TAG_LEN {
                    return Err(NoiseError::Malformed);
                }
                let static_end = DH_LEN + TAG_LEN;
                let remote_s_plain = self.state.decrypt_and_hash(&message[..static_end])?;
                let remote_s: [u8; 32] =
                    remote_s_plain.as_slice().try_into().map_err(|_| NoiseError::Malformed)?;
                self.remote_static = Some(remote_s);
                let se = self.dh(self.local_ephemeral()?, &remote_s)?;
                self.state.mix_key(&*se);
                self.state.decrypt_and_hash(&message[static_end..])?
            }
            _ => return Err(NoiseError::HandshakeOutOfOrder),
        };
        self.step += 1;
        Ok(payload)
    }

    fn is_complete(&self) -> bool {
        self.step >= 3
    }

    fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.is_complete().then_some(self.state.hash)
    }

    fn into_transport(
        self: Box<Self>,
    ) -> Result<(Box<dyn TransportCipher>, Box<dyn TransportCipher>), NoiseError> {
        if !self.is_complete() {
            return Err(NoiseError::HandshakeIncomplete);
        }
        let (k1, k2) = self.state.split();
        // The initiator sends with the first split key, receives with the
        // second; the responder is mirrored.
        let (send_key, recv_key) = match self.role {
            HandshakeRole::Initiator => (k1, k2),
            HandshakeRole::Responder => (k2, k1),
        };
        Ok((
            Box::new(XxTransportCipher::new(send_key)),
            Box::new(XxTransportCipher::new(recv_key)),
        ))
    }
}

/// One direction of an established session.
///
/// Nonces are carried explicitly on the wire as a 4-byte prefix, so the
/// sending side hands the counter out and the receiving side decrypts at
/// whatever nonce arrived (replay filtering happens a layer up).
struct XxTransportCipher {
    key: Zeroizing<[u8; 32]>,
    next_nonce: u64,
}

impl XxTransportCipher {
    fn new(key: Zeroizing<[u8; 32]>) -> Self {
        XxTransportCipher { key, next_nonce: 0 }
    }
}

impl TransportCipher for XxTransportCipher {
    fn encrypt_next(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), NoiseError> {
        // The wire prefix is 4 bytes, so the counter must stay within u32.
        if self.next_nonce >= u32::MAX as u64 {
            return Err(NoiseError::NonceExceeded);
        }
        let nonce = self.next_nonce as u32;
        let ciphertext = aead_encrypt(&self.key, nonce as u64, &[], plaintext)?;
        self.next_nonce += 1;
        Ok((nonce, ciphertext))
    }

    fn decrypt_at(&self, nonce: u32, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        aead_decrypt(&self.key, nonce as u64, &[], ciphertext)
    }
}

/// Default backend producing XX handshakes.
pub struct XxBackend;

impl NoiseBackend for XxBackend {
    fn new_handshake(
        &self,
        role: HandshakeRole,
        local_static: &NoiseKeypair,
    ) -> Box<dyn HandshakeEngine> {
        Box::new(XxHandshake::new(role, local_static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (
        Box<dyn TransportCipher>,
        Box<dyn TransportCipher>,
        Box<dyn TransportCipher>,
        Box<dyn TransportCipher>,
        [u8; 32],
        [u8; 32],
    ) {
        let alice_static = NoiseKeypair::generate();
        let bob_static = NoiseKeypair::generate();
        let mut alice: Box<dyn HandshakeEngine> =
            Box::new(XxHandshake::new(HandshakeRole::Initiator, &alice_static));
        let mut bob: Box<dyn HandshakeEngine> =
            Box::new(XxHandshake::new(HandshakeRole::Responder, &bob_static));

        let m1 = alice.write_message(&[]).unwrap();
        assert_eq!(m1.len(), XX_MESSAGE_1_LEN);
        bob.read_message(&m1).unwrap();

        let m2 = bob.write_message(&[]).unwrap();
        assert_eq!(m2.len(), XX_MESSAGE_2_LEN);
        alice.read_message(&m2).unwrap();
        // Mid-handshake there is no transcript hash to bind to yet.
        assert!(alice.handshake_hash().is_none());

        let m3 = alice.write_message(&[]).unwrap();
        assert_eq!(m3.len(), XX_MESSAGE_3_LEN);
        bob.read_message(&m3).unwrap();

        assert!(alice.is_complete());
        assert!(bob.is_complete());
        assert_eq!(alice.remote_static(), Some(bob_static.public_key_bytes()));
        assert_eq!(bob.remote_static(), Some(alice_static.public_key_bytes()));
        assert!(alice.handshake_hash().is_some());
        assert_eq!(alice.handshake_hash(), bob.handshake_hash());

        let (a_send, a_recv) = alice.into_transport().unwrap();
        let (b_send, b_recv) = bob.into_transport().unwrap();
        (
            a_send,
            a_recv,
            b_send,
            b_recv,
            alice_static.public_key_bytes(),
            bob_static.public_key_bytes(),
        )
    }

    #[test]
    fn full_handshake_and_transport() {
        let (mut a_send, a_recv, mut b_send, b_recv, _, _) = run_handshake();

        let (nonce, ct) = a_send.encrypt_next(b"from alice").unwrap();
        assert_eq!(nonce, 0);
        assert_eq!(b_recv.decrypt_at(nonce, &ct).unwrap(), b"from alice");

        let (nonce, ct) = b_send.encrypt_next(b"from bob").unwrap();
        assert_eq!(a_recv.decrypt_at(nonce, &ct).unwrap(), b"from bob");
    }

    #[test]
    fn nonces_increment_per_message() {
        let (mut a_send, _, _, b_recv, _, _) = run_handshake();
        for expected in 0u32..5 {
            let (nonce, ct) = a_send.encrypt_next(b"tick").unwrap();
            assert_eq!(nonce, expected);
            assert_eq!(b_recv.decrypt_at(nonce, &ct).unwrap(), b"tick");
        }
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (mut a_send, _, _, b_recv, _, _) = run_handshake();
        let (nonce, mut ct) = a_send.encrypt_next(b"secret").unwrap();
        ct[0] ^= 0x01;
        assert_eq!(b_recv.decrypt_at(nonce, &ct), Err(NoiseError::DecryptFailed));
    }

    #[test]
    fn wrong_nonce_rejected() {
        let (mut a_send, _, _, b_recv, _, _) = run_handshake();
        let (nonce, ct) = a_send.encrypt_next(b"secret").unwrap();
        assert_eq!(
            b_recv.decrypt_at(nonce + 1, &ct),
            Err(NoiseError::DecryptFailed)
        );
    }

    #[test]
    fn out_of_order_handshake_rejected() {
        let local = NoiseKeypair::generate();
        let mut responder = XxHandshake::new(HandshakeRole::Responder, &local);
        // The responder never writes first in XX.
        assert_eq!(
            responder.write_message(&[]),
            Err(NoiseError::HandshakeOutOfOrder)
        );

        let mut initiator = XxHandshake::new(HandshakeRole::Initiator, &local);
        assert_eq!(
            initiator.read_message(&[0u8; XX_MESSAGE_1_LEN]),
            Err(NoiseError::HandshakeOutOfOrder)
        );
    }

    #[test]
    fn truncated_messages_rejected() {
        let alice_static = NoiseKeypair::generate();
        let bob_static = NoiseKeypair::generate();
        let mut alice = XxHandshake::new(HandshakeRole::Initiator, &alice_static);
        let mut bob = XxHandshake::new(HandshakeRole::Responder, &bob_static);

        let m1 = alice.write_message(&[]).unwrap();
        assert_eq!(bob.read_message(&m1[..16]), Err(NoiseError::Malformed));
    }

    #[test]
    fn split_incomplete_handshake_fails() {
        let local = NoiseKeypair::generate();
        let handshake: Box<dyn HandshakeEngine> =
            Box::new(XxHandshake::new(HandshakeRole::Initiator, &local));
        assert!(handshake.into_transport().is_err());
    }
}
