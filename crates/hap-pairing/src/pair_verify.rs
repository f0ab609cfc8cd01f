//! HomeKit pair-verify protocol (M1-M4), accessory side.
//!
//! Pair-verify proves both long-term identities over a fresh Curve25519
//! exchange and yields the session keys for the encrypted transport.

use hap_core::error::{Error, PairingError};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::verify,
    ephemeral::{EphemeralKey, KeyAgreement},
    keys::{EncryptionKey, SessionKeys},
    tlv::{Tlv8, TlvErrorCode, TlvType},
};
use tracing::{debug, info};

use crate::identity::IdentityStore;
use crate::pair_setup::error_code;

/// Nonce for pair-verify M2 encryption.
const PV_MSG02_NONCE: &[u8] = b"PV-Msg02";
/// Nonce for pair-verify M3 decryption.
const PV_MSG03_NONCE: &[u8] = b"PV-Msg03";

/// Result of one pair-verify step.
pub struct VerifyResponse {
    /// TLV8 body to send back.
    pub body: Vec<u8>,
    /// Set once M4 succeeds: the verified controller and its session keys.
    pub verified: Option<(String, SessionKeys)>,
}

impl VerifyResponse {
    fn reply(body: Vec<u8>) -> Self {
        Self {
            body,
            verified: None,
        }
    }
}

struct PendingVerify {
    agreement: KeyAgreement,
    session_key: EncryptionKey,
}

/// Pair-verify state machine for one connection.
pub struct PairVerify {
    ephemeral: Option<EphemeralKey>,
    pending: Option<PendingVerify>,
}

impl PairVerify {
    pub fn new() -> Self {
        Self {
            ephemeral: None,
            pending: None,
        }
    }

    /// Use a fixed ephemeral key for the next M1.
    pub fn with_ephemeral(ephemeral: EphemeralKey) -> Self {
        Self {
            ephemeral: Some(ephemeral),
            pending: None,
        }
    }

    /// True while waiting for M3.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn handle(&mut self, request: &[u8], store: &IdentityStore) -> VerifyResponse {
        let tlv = match Tlv8::decode(request) {
            Ok(tlv) => tlv,
            Err(e) => {
                debug!(error = %e, "undecodable pair-verify request");
                let state = if self.pending.is_some() { 4 } else { 2 };
                self.pending = None;
                return VerifyResponse::reply(
                    Tlv8::error_response(state, TlvErrorCode::Unknown).encode(),
                );
            }
        };

        match tlv.state() {
            Some(1) => match self.handle_m1(&tlv, store) {
                Ok(body) => VerifyResponse::reply(body.encode()),
                Err(err) => self.fail(2, &err),
            },
            Some(3) => match self.handle_m3(&tlv, store) {
                Ok((body, controller_id, keys)) => VerifyResponse {
                    body: body.encode(),
                    verified: Some((controller_id, keys)),
                },
                Err(err) => self.fail(4, &err),
            },
            other => {
                let actual = other.unwrap_or(0);
                let err = PairingError::Sequence {
                    expected: if self.pending.is_some() { 3 } else { 1 },
                    actual,
                }
                .into();
                self.fail(actual.wrapping_add(1), &err)
            }
        }
    }

    fn fail(&mut self, state: u8, err: &Error) -> VerifyResponse {
        debug!(state, error = %err, "pair-verify request rejected");
        self.pending = None;
        VerifyResponse::reply(Tlv8::error_response(state, error_code(err)).encode())
    }

    /// M1 may arrive at any time and restarts verification.
    fn handle_m1(&mut self, tlv: &Tlv8, store: &IdentityStore) -> Result<Tlv8, Error> {
        self.pending = None;

        let controller_public: [u8; 32] = tlv
            .require(TlvType::PublicKey)?
            .try_into()
            .map_err(|_| PairingError::AuthenticationFailed)?;

        let agreement = self
            .ephemeral
            .take()
            .unwrap_or_else(EphemeralKey::generate)
            .agree(controller_public)
            .map_err(|_| PairingError::AuthenticationFailed)?;
        let session_key = agreement.verify_key()?;

        let accessory_id = store.identifier().as_bytes();
        let signature = store.keypair().sign(&agreement.local_transcript(accessory_id));

        let sub_tlv = Tlv8::new()
            .with(TlvType::Identifier, accessory_id.to_vec())
            .with(TlvType::Signature, signature.to_vec());
        let encrypted = encrypt_with_nonce(
            session_key.as_bytes(),
            &nonce_from_string(PV_MSG02_NONCE),
            &sub_tlv.encode(),
        )?;

        let accessory_public = agreement.local_public();
        self.pending = Some(PendingVerify {
            agreement,
            session_key,
        });

        Ok(Tlv8::new()
            .with(TlvType::State, vec![0x02])
            .with(TlvType::PublicKey, accessory_public.to_vec())
            .with(TlvType::EncryptedData, encrypted))
    }

    fn handle_m3(
        &mut self,
        tlv: &Tlv8,
        store: &IdentityStore,
    ) -> Result<(Tlv8, String, SessionKeys), Error> {
        let pending = self.pending.take().ok_or(PairingError::Sequence {
            expected: 1,
            actual: 3,
        })?;

        let encrypted = tlv.require(TlvType::EncryptedData)?;
        let decrypted = decrypt_with_nonce(
            pending.session_key.as_bytes(),
            &nonce_from_string(PV_MSG03_NONCE),
            encrypted,
        )
        .map_err(|_| PairingError::AuthenticationFailed)?;

        let inner = Tlv8::decode(&decrypted).map_err(|_| PairingError::AuthenticationFailed)?;
        let controller_id = inner
            .get(TlvType::Identifier)
            .and_then(|id| std::str::from_utf8(id).ok())
            .ok_or(PairingError::AuthenticationFailed)?;
        let signature = inner
            .get(TlvType::Signature)
            .ok_or(PairingError::AuthenticationFailed)?;

        let Some(controller) = store.controller(controller_id) else {
            debug!(controller = %controller_id, "pair-verify from unknown controller");
            return Err(PairingError::AuthenticationFailed.into());
        };

        let transcript = pending.agreement.peer_transcript(controller_id.as_bytes());
        verify(&controller.public_key, &transcript, signature)
            .map_err(|_| PairingError::AuthenticationFailed)?;

        let keys = SessionKeys::derive_accessory_keys(pending.agreement.shared_secret())?;
        info!(controller = %controller.id, "pair-verify complete");

        Ok((
            Tlv8::new().with(TlvType::State, vec![0x04]),
            controller.id,
            keys,
        ))
    }
}

impl Default for PairVerify {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::controller::{ControllerIdentity, ControllerPairVerify};
    use crate::identity::{PairedController, Permissions};
    use crate::storage::MemoryStorage;

    fn paired_store(identity: &ControllerIdentity) -> IdentityStore {
        let store = IdentityStore::load_or_create(Arc::new(MemoryStorage::new())).unwrap();
        store
            .add_controller(PairedController {
                id: identity.id().to_string(),
                public_key: identity.public_key(),
                permissions: Permissions::Admin,
            })
            .unwrap();
        store
    }

    fn error_of(body: &[u8]) -> (Option<u8>, Option<TlvErrorCode>) {
        let tlv = Tlv8::decode(body).unwrap();
        (tlv.state(), tlv.error())
    }

    mod exchange {
        use super::*;

        #[test]
        fn paired_controller_gets_matching_keys() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let mut server = PairVerify::new();
            let mut client =
                ControllerPairVerify::new(identity.clone(), store.keypair().public_key());

            let m2 = server.handle(&client.generate_m1(), &store);
            assert!(m2.verified.is_none());
            assert!(server.is_pending());

            client.process_m2(&m2.body).unwrap();
            let m4 = server.handle(&client.generate_m3().unwrap(), &store);
            let (controller_id, accessory_keys) = m4.verified.expect("verified");
            let controller_keys = client.process_m4(&m4.body).unwrap();

            assert_eq!(controller_id, identity.id());
            assert!(accessory_keys.encrypt_key == controller_keys.decrypt_key);
            assert!(accessory_keys.decrypt_key == controller_keys.encrypt_key);
            assert!(!server.is_pending());
        }

        #[test]
        fn m1_restarts_verification() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let mut server = PairVerify::new();

            let mut first =
                ControllerPairVerify::new(identity.clone(), store.keypair().public_key());
            server.handle(&first.generate_m1(), &store);

            let mut second = ControllerPairVerify::new(identity, store.keypair().public_key());
            let m2 = server.handle(&second.generate_m1(), &store);
            second.process_m2(&m2.body).unwrap();
            let m4 = server.handle(&second.generate_m3().unwrap(), &store);
            assert!(m4.verified.is_some());
        }

        #[test]
        fn fixed_ephemerals_reproduce_keys() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);

            let run = || {
                let mut server =
                    PairVerify::with_ephemeral(EphemeralKey::from_secret([0x11; 32]));
                let mut client =
                    ControllerPairVerify::new(identity.clone(), store.keypair().public_key())
                        .with_ephemeral_secret([0x22; 32]);
                let m2 = server.handle(&client.generate_m1(), &store);
                client.process_m2(&m2.body).unwrap();
                let m4 = server.handle(&client.generate_m3().unwrap(), &store);
                m4.verified.expect("verified").1
            };

            let first = run();
            let second = run();
            assert!(first.encrypt_key == second.encrypt_key);
            assert!(first.decrypt_key == second.decrypt_key);
            assert!(first.encrypt_key != first.decrypt_key);
        }

        #[test]
        fn fixed_ephemeral_is_used() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let ephemeral = EphemeralKey::from_secret([7u8; 32]);
            let expected = ephemeral.public_key();
            let mut server = PairVerify::with_ephemeral(ephemeral);
            let mut client = ControllerPairVerify::new(identity, store.keypair().public_key());

            let m2 = server.handle(&client.generate_m1(), &store);
            let tlv = Tlv8::decode(&m2.body).unwrap();
            assert_eq!(tlv.get(TlvType::PublicKey), Some(expected.as_slice()));
        }
    }

    mod rejection {
        use super::*;

        #[test]
        fn unknown_controller_is_authentication_error() {
            let paired = ControllerIdentity::generate();
            let stranger = ControllerIdentity::generate();
            let store = paired_store(&paired);
            let mut server = PairVerify::new();
            let mut client = ControllerPairVerify::new(stranger, store.keypair().public_key());

            let m2 = server.handle(&client.generate_m1(), &store);
            client.process_m2(&m2.body).unwrap();
            let m4 = server.handle(&client.generate_m3().unwrap(), &store);

            assert!(m4.verified.is_none());
            assert_eq!(
                error_of(&m4.body),
                (Some(4), Some(TlvErrorCode::Authentication))
            );
        }

        #[test]
        fn wrong_key_for_known_id_is_rejected() {
            let paired = ControllerIdentity::generate();
            let store = paired_store(&paired);
            let impostor = ControllerIdentity::with_id(
                hap_crypto::ed25519::IdentityKeyPair::generate(),
                paired.id(),
            );
            let mut server = PairVerify::new();
            let mut client = ControllerPairVerify::new(impostor, store.keypair().public_key());

            let m2 = server.handle(&client.generate_m1(), &store);
            client.process_m2(&m2.body).unwrap();
            let m4 = server.handle(&client.generate_m3().unwrap(), &store);

            assert!(m4.verified.is_none());
            assert_eq!(
                error_of(&m4.body),
                (Some(4), Some(TlvErrorCode::Authentication))
            );
        }

        #[test]
        fn m3_without_m1_is_unknown() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let mut server = PairVerify::new();
            let m3 = Tlv8::new()
                .with(TlvType::State, vec![3])
                .with(TlvType::EncryptedData, vec![0; 40]);

            let response = server.handle(&m3.encode(), &store);
            assert_eq!(error_of(&response.body), (Some(4), Some(TlvErrorCode::Unknown)));
        }

        #[test]
        fn short_public_key_is_rejected() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let mut server = PairVerify::new();
            let m1 = Tlv8::new()
                .with(TlvType::State, vec![1])
                .with(TlvType::PublicKey, vec![9; 16]);

            let response = server.handle(&m1.encode(), &store);
            assert_eq!(
                error_of(&response.body),
                (Some(2), Some(TlvErrorCode::Authentication))
            );
            assert!(!server.is_pending());
        }

        #[test]
        fn corrupted_m3_is_rejected() {
            let identity = ControllerIdentity::generate();
            let store = paired_store(&identity);
            let mut server = PairVerify::new();
            let mut client = ControllerPairVerify::new(identity, store.keypair().public_key());

            let m2 = server.handle(&client.generate_m1(), &store);
            client.process_m2(&m2.body).unwrap();
            let mut m3 = Tlv8::decode(&client.generate_m3().unwrap()).unwrap();
            let mut data = m3.get(TlvType::EncryptedData).unwrap().to_vec();
            let last = data.len() - 1;
            data[last] ^= 0x01;
            m3.set(TlvType::EncryptedData, data);

            let m4 = server.handle(&m3.encode(), &store);
            assert!(m4.verified.is_none());
            assert_eq!(
                error_of(&m4.body),
                (Some(4), Some(TlvErrorCode::Authentication))
            );
        }
    }
}
