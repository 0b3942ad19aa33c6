//! Channel key material.
//!
//! Each side of a channel gets a fresh X25519 keypair. The stored
//! `crypto_key` is own public key, own secret key, peer public key.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

pub const KEY_SIZE: usize = 32;
pub const CRYPTO_KEY_SIZE: usize = KEY_SIZE * 3;

#[derive(Clone)]
pub struct ChannelKeypair {
    pub public: [u8; KEY_SIZE],
    secret: [u8; KEY_SIZE],
}

impl ChannelKeypair {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public: signing.verifying_key().to_montgomery().to_bytes(),
            secret: signing.to_scalar_bytes(),
        }
    }

    /// Layout expected by the node executable in `contractors.crypto_key`.
    pub fn crypto_key(&self, peer_public: &[u8; KEY_SIZE]) -> Vec<u8> {
        let mut out = Vec::with_capacity(CRYPTO_KEY_SIZE);
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&self.secret);
        out.extend_from_slice(peer_public);
        out
    }
}

impl std::fmt::Debug for ChannelKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKeypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}
