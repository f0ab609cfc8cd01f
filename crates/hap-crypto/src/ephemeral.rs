//! Ephemeral Curve25519 agreement for pair-verify.
//!
//! Each side of pair-verify brings a fresh X25519 key, agrees on a shared
//! secret, and then signs a transcript of both public keys wrapped around
//! its pairing identifier. [`KeyAgreement`] keeps the two public keys in the
//! caller's own orientation, so the accessory and the controller build and
//! check those transcripts through the same two calls.

use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::keys::{EncryptionKey, SessionKeys, SharedSecret};

/// One side's ephemeral key for a single pair-verify run.
pub struct EphemeralKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        Self::from_static(StaticSecret::random_from_rng(OsRng))
    }

    /// Fixed key, for exchanges that must be reproducible.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self::from_static(StaticSecret::from(secret))
    }

    fn from_static(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Agree with the peer's ephemeral key. The key is spent either way.
    ///
    /// Refuses peer keys that force an all-zero secret, which covers the
    /// zero key and every low-order point.
    pub fn agree(self, peer_public: [u8; 32]) -> Result<KeyAgreement, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey(
                "peer ephemeral key is a low-order point".to_string(),
            ));
        }
        Ok(KeyAgreement {
            local_public: self.public.to_bytes(),
            peer_public,
            shared: SharedSecret::new(shared.as_bytes().to_vec()),
        })
    }
}

/// Result of one ephemeral exchange, seen from one side.
pub struct KeyAgreement {
    local_public: [u8; 32],
    peer_public: [u8; 32],
    shared: SharedSecret,
}

impl KeyAgreement {
    pub fn local_public(&self) -> [u8; 32] {
        self.local_public
    }

    pub fn peer_public(&self) -> [u8; 32] {
        self.peer_public
    }

    pub fn shared_secret(&self) -> &SharedSecret {
        &self.shared
    }

    /// Key sealing the `{Identifier, Signature}` sub-TLVs of M2 and M3.
    pub fn verify_key(&self) -> Result<EncryptionKey, CryptoError> {
        SessionKeys::derive_pair_verify_key(&self.shared)
    }

    /// What this side signs: own key, own identifier, peer key.
    pub fn local_transcript(&self, local_id: &[u8]) -> Vec<u8> {
        transcript(&self.local_public, local_id, &self.peer_public)
    }

    /// What the peer signs: peer key, peer identifier, own key.
    pub fn peer_transcript(&self, peer_id: &[u8]) -> Vec<u8> {
        transcript(&self.peer_public, peer_id, &self.local_public)
    }
}

fn transcript(first: &[u8; 32], id: &[u8], second: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + id.len());
    out.extend_from_slice(first);
    out.extend_from_slice(id);
    out.extend_from_slice(second);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(byte: u8) -> EphemeralKey {
        EphemeralKey::from_secret([byte; 32])
    }

    mod agreement {
        use super::*;

        #[test]
        fn both_sides_share_secret_and_verify_key() {
            let accessory = EphemeralKey::generate();
            let controller = EphemeralKey::generate();
            let (accessory_pub, controller_pub) = (accessory.public_key(), controller.public_key());

            let a = accessory.agree(controller_pub).unwrap();
            let c = controller.agree(accessory_pub).unwrap();

            assert_eq!(a.shared_secret().as_bytes(), c.shared_secret().as_bytes());
            assert!(a.verify_key().unwrap() == c.verify_key().unwrap());
            assert_eq!(a.local_public(), c.peer_public());
            assert_eq!(a.peer_public(), c.local_public());
        }

        #[test]
        fn fresh_keys_differ() {
            assert_ne!(
                EphemeralKey::generate().public_key(),
                EphemeralKey::generate().public_key()
            );
        }

        #[test]
        fn refuses_zero_key() {
            assert!(matches!(
                fixed(1).agree([0; 32]),
                Err(CryptoError::InvalidPublicKey(_))
            ));
        }

        #[test]
        fn refuses_low_order_point() {
            let low_order: [u8; 32] =
                hex::decode("ecffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f")
                    .unwrap()
                    .try_into()
                    .unwrap();
            assert!(fixed(1).agree(low_order).is_err());
        }

        #[test]
        fn rfc7748_vector() {
            let secret = |s: &str| -> [u8; 32] { hex::decode(s).unwrap().try_into().unwrap() };
            let alice = EphemeralKey::from_secret(secret(
                "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
            ));
            let bob = EphemeralKey::from_secret(secret(
                "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
            ));
            assert_eq!(
                hex::encode(bob.public_key()),
                "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f"
            );

            let agreement = alice.agree(bob.public_key()).unwrap();
            assert_eq!(
                hex::encode(agreement.shared_secret().as_bytes()),
                "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
            );
        }
    }

    mod transcripts {
        use super::*;

        #[test]
        fn local_transcript_is_peer_transcript_of_other_side() {
            let accessory = fixed(0x11);
            let controller = fixed(0x22);
            let (accessory_pub, controller_pub) = (accessory.public_key(), controller.public_key());
            let a = accessory.agree(controller_pub).unwrap();
            let c = controller.agree(accessory_pub).unwrap();

            // M2 is signed by the accessory, M3 by the controller.
            assert_eq!(a.local_transcript(b"AA:BB"), c.peer_transcript(b"AA:BB"));
            assert_eq!(c.local_transcript(b"ctrl"), a.peer_transcript(b"ctrl"));
        }

        #[test]
        fn layout_is_key_id_key() {
            let a = fixed(0x11).agree(fixed(0x22).public_key()).unwrap();
            let t = a.local_transcript(b"id");

            assert_eq!(t.len(), 66);
            assert_eq!(&t[..32], &a.local_public());
            assert_eq!(&t[32..34], b"id");
            assert_eq!(&t[34..], &a.peer_public());
        }
    }
}
