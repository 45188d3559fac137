//! Payload encryption for frames carrying the encrypted flag.
//!
//! The protocol treats the cipher as an opaque primitive keyed by the secret
//! both ends of a link share once the handshake completes (the handshake key
//! digest). [`ChaChaCipher`] is the default: ChaCha20-Poly1305 with a key
//! derived as SHA-256 of that secret and a random 12-byte nonce prepended to
//! each ciphertext.
//!
//! ```text
//! [Nonce(12)] [Ciphertext + Tag(N + 16)]
//! ```

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Nonce length for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Opaque symmetric cipher applied to whole frame payloads
pub trait FrameCipher: Send + Sync {
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 keyed by SHA-256 of the shared secret
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaCipher;

impl ChaChaCipher {
    fn cipher(key: &[u8]) -> ChaCha20Poly1305 {
        let digest: [u8; 32] = Sha256::digest(key).into();
        ChaCha20Poly1305::new(Key::from_slice(&digest))
    }
}

impl FrameCipher for ChaChaCipher {
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;

        let ciphertext = Self::cipher(key)
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_SIZE);
        Self::cipher(key)
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
