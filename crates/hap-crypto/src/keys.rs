//! Session key types and derivation.

use crate::chacha::FrameCipher;
use crate::hkdf;
use hap_core::error::CryptoError;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shared secret from SRP or ECDH.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

/// 32-byte encryption key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

/// Directional keys for one encrypted connection.
///
/// `encrypt_key` seals what this side sends, `decrypt_key` opens what it
/// receives. The controller and the accessory derive the same two keys with
/// the roles swapped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub encrypt_key: EncryptionKey,
    pub decrypt_key: EncryptionKey,
}

impl SharedSecret {
    /// Create from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl EncryptionKey {
    /// Create from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl SessionKeys {
    /// Keys as seen by the accessory: it reads with the controller's write key.
    pub fn derive_accessory_keys(shared_secret: &SharedSecret) -> Result<Self, CryptoError> {
        Ok(Self {
            encrypt_key: EncryptionKey(hkdf::derive_control_read_key(shared_secret.as_bytes())?),
            decrypt_key: EncryptionKey(hkdf::derive_control_write_key(shared_secret.as_bytes())?),
        })
    }

    /// Keys as seen by the controller.
    pub fn derive_control_keys(shared_secret: &SharedSecret) -> Result<Self, CryptoError> {
        Ok(Self {
            encrypt_key: EncryptionKey(hkdf::derive_control_write_key(shared_secret.as_bytes())?),
            decrypt_key: EncryptionKey(hkdf::derive_control_read_key(shared_secret.as_bytes())?),
        })
    }

    /// Derive pair-setup encryption key.
    pub fn derive_pair_setup_key(shared_secret: &SharedSecret) -> Result<EncryptionKey, CryptoError> {
        Ok(EncryptionKey(hkdf::derive_pair_setup_key(shared_secret.as_bytes())?))
    }

    /// Derive pair-verify encryption key.
    pub fn derive_pair_verify_key(
        shared_secret: &SharedSecret,
    ) -> Result<EncryptionKey, CryptoError> {
        Ok(EncryptionKey(hkdf::derive_pair_verify_key(shared_secret.as_bytes())?))
    }

    /// Build the frame cipher for these keys with fresh counters.
    pub fn cipher(&self) -> FrameCipher {
        FrameCipher::new(*self.encrypt_key.as_bytes(), *self.decrypt_key.as_bytes())
    }
}
