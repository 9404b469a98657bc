//! Crypto provider seam.
//!
//! Key exchange and authentication treat the provider as opaque and
//! fallible. Real primitives live outside this crate; `PlaintextProvider`
//! passes data through unchanged and is meant for trusted networks and tests.

use crate::error::{Result, SyncError};
use bytes::Bytes;

pub trait CryptoProvider: Send + Sync {
    /// Our public key, sent during key exchange.
    fn public_key(&self) -> Bytes;

    /// Encrypt `plaintext` so only the holder of `peer_public_key` can read it.
    fn encrypt(&self, plaintext: &[u8], peer_public_key: &[u8]) -> Result<Bytes>;

    /// Decrypt data that was encrypted to our public key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Bytes>;
}

/// Pass-through provider. Its "public key" is an identity label.
#[derive(Debug, Clone)]
pub struct PlaintextProvider {
    identity: Bytes,
}

impl PlaintextProvider {
    pub fn new(identity: impl Into<Bytes>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

impl Default for PlaintextProvider {
    fn default() -> Self {
        Self::new(Bytes::from_static(b"treesync-plaintext"))
    }
}

impl CryptoProvider for PlaintextProvider {
    fn public_key(&self) -> Bytes {
        self.identity.clone()
    }

    fn encrypt(&self, plaintext: &[u8], peer_public_key: &[u8]) -> Result<Bytes> {
        if peer_public_key.is_empty() {
            return Err(SyncError::Crypto("no peer public key".into()));
        }
        Ok(Bytes::copy_from_slice(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(ciphertext))
    }
}
