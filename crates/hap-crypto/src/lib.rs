//! # hap-crypto
//!
//! Cryptographic primitives for HAP pairing and session encryption.
//!
//! This crate provides:
//! - TLV8 codec for pairing messages
//! - SRP-6a (3072-bit) for pair-setup
//! - Ephemeral Curve25519 agreement and signed transcripts for pair-verify
//! - Ed25519 for long-term identities
//! - ChaCha20-Poly1305 for payloads and session frames
//! - HKDF-SHA512 for key derivation
//!
//! All secret material is zeroized on drop.

pub mod chacha;
pub mod ed25519;
pub mod ephemeral;
pub mod hkdf;
pub mod keys;
pub mod srp;
pub mod tlv;

pub use chacha::FrameCipher;
pub use keys::{EncryptionKey, SessionKeys, SharedSecret};
pub use tlv::{PairingMethod, Tlv8, TlvErrorCode, TlvType};
