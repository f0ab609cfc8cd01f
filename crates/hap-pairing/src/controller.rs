//! Controller side of pair-setup and pair-verify.
//!
//! The accessory never runs these; they drive the accessory state machines
//! from tests and from tools that talk to a running server.

use hap_core::error::{Error, PairingError, Result};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::{public_key_from_slice, verify, IdentityKeyPair},
    ephemeral::{EphemeralKey, KeyAgreement},
    hkdf,
    keys::{EncryptionKey, SessionKeys, SharedSecret},
    srp::{SrpChallenge, SrpClient, SrpProof, N_BYTES, SALT_LEN},
    tlv::{Tlv8, TlvErrorCode, TlvType},
};

use crate::pair_setup::SRP_USERNAME;

/// Controller long-term identity: pairing identifier plus Ed25519 key pair.
///
/// The same identifier must be used in pair-setup M5 and pair-verify M3.
#[derive(Clone)]
pub struct ControllerIdentity {
    id: String,
    keypair: IdentityKeyPair,
}

impl ControllerIdentity {
    /// Generate a new identity with an identifier derived from the public key.
    pub fn generate() -> Self {
        Self::from_keypair(IdentityKeyPair::generate())
    }

    /// Identifier in UUID layout built from the first 16 public key bytes.
    pub fn from_keypair(keypair: IdentityKeyPair) -> Self {
        let pk = hex::encode_upper(&keypair.public_key()[..16]);
        let id = format!(
            "{}-{}-{}-{}-{}",
            &pk[0..8],
            &pk[8..12],
            &pk[12..16],
            &pk[16..20],
            &pk[20..32]
        );
        Self { id, keypair }
    }

    pub fn with_id(keypair: IdentityKeyPair, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            keypair,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }
}

/// Accessory identity learned from pair-setup M6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryInfo {
    pub id: String,
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupStep {
    Initial,
    M1Sent,
    M2Received,
    M3Sent,
    M4Received,
    M5Sent,
    Complete,
    Failed,
}

/// Controller half of pair-setup.
pub struct ControllerPairSetup {
    step: SetupStep,
    srp: SrpClient,
    proof: Option<SrpProof>,
    session_key: Option<EncryptionKey>,
}

impl ControllerPairSetup {
    /// `pin` in either `XXXXXXXX` or `XXX-XX-XXX` form.
    pub fn new(pin: &str) -> Self {
        let password = dashed_pin(pin);
        Self {
            step: SetupStep::Initial,
            srp: SrpClient::new(SRP_USERNAME, password.as_bytes()),
            proof: None,
            session_key: None,
        }
    }

    /// M1: `{State=1, Method=PairSetup}`.
    pub fn generate_m1(&mut self) -> Result<Vec<u8>> {
        self.advance(SetupStep::Initial, SetupStep::M1Sent)?;
        Ok(Tlv8::pair_setup_m1().encode())
    }

    /// M2: `{State=2, Salt, PublicKey}`.
    pub fn process_m2(&mut self, response: &[u8]) -> Result<()> {
        self.advance(SetupStep::M1Sent, SetupStep::M2Received)?;
        let tlv = self.check_response(response, 2)?;

        let result = (|| {
            let salt: [u8; SALT_LEN] = tlv
                .require(TlvType::Salt)?
                .try_into()
                .map_err(|_| protocol("M2 salt has wrong length"))?;
            let server_public = tlv.require(TlvType::PublicKey)?;
            if server_public.len() > N_BYTES {
                return Err(protocol("M2 public key too long").into());
            }
            let mut padded = vec![0u8; N_BYTES - server_public.len()];
            padded.extend_from_slice(server_public);

            let challenge = SrpChallenge {
                salt,
                server_public_key: padded,
            };
            Ok::<_, Error>(self.srp.process_challenge(&challenge)?)
        })();

        match result {
            Ok(proof) => {
                self.proof = Some(proof);
                Ok(())
            }
            Err(e) => self.failed(e),
        }
    }

    /// M3: `{State=3, PublicKey=A, Proof}`.
    pub fn generate_m3(&mut self) -> Result<Vec<u8>> {
        self.advance(SetupStep::M2Received, SetupStep::M3Sent)?;
        let Some(proof) = self.proof.as_ref() else {
            return self.failed(protocol("SRP proof not computed").into());
        };
        Ok(Tlv8::new()
            .with(TlvType::State, vec![0x03])
            .with(TlvType::PublicKey, self.srp.public_key())
            .with(TlvType::Proof, proof.client_proof.clone())
            .encode())
    }

    /// M4: `{State=4, Proof}`. Verifies the accessory knows the PIN.
    pub fn process_m4(&mut self, response: &[u8]) -> Result<()> {
        self.advance(SetupStep::M3Sent, SetupStep::M4Received)?;
        let tlv = self.check_response(response, 4)?;

        let Some(proof) = self.proof.as_ref() else {
            return self.failed(protocol("SRP proof not computed").into());
        };
        let server_proof = match tlv.require(TlvType::Proof) {
            Ok(p) => p,
            Err(e) => return self.failed(e.into()),
        };
        if !self
            .srp
            .verify_server_proof(server_proof, &proof.expected_server_proof)
        {
            return self.failed(PairingError::AuthenticationFailed.into());
        }

        let shared = SharedSecret::new(proof.shared_secret.clone());
        match SessionKeys::derive_pair_setup_key(&shared) {
            Ok(key) => {
                self.session_key = Some(key);
                Ok(())
            }
            Err(e) => self.failed(e.into()),
        }
    }

    /// M5: encrypted `{Identifier, PublicKey, Signature}`.
    pub fn generate_m5(&mut self, identity: &ControllerIdentity) -> Result<Vec<u8>> {
        self.advance(SetupStep::M4Received, SetupStep::M5Sent)?;
        let (Some(proof), Some(key)) = (self.proof.as_ref(), self.session_key.as_ref()) else {
            return self.failed(protocol("session key not derived").into());
        };

        let result = (|| {
            // iOSDeviceX || iOSDevicePairingID || iOSDeviceLTPK
            let device_x = hkdf::derive_controller_sign_key(&proof.shared_secret)?;
            let mut info = Vec::new();
            info.extend_from_slice(&device_x);
            info.extend_from_slice(identity.id().as_bytes());
            info.extend_from_slice(&identity.public_key());
            let signature = identity.sign(&info);

            let sub_tlv = Tlv8::new()
                .with(TlvType::Identifier, identity.id().as_bytes().to_vec())
                .with(TlvType::PublicKey, identity.public_key().to_vec())
                .with(TlvType::Signature, signature.to_vec());
            let encrypted = encrypt_with_nonce(
                key.as_bytes(),
                &nonce_from_string(b"PS-Msg05"),
                &sub_tlv.encode(),
            )?;
            Ok::<_, Error>(
                Tlv8::new()
                    .with(TlvType::State, vec![0x05])
                    .with(TlvType::EncryptedData, encrypted)
                    .encode(),
            )
        })();

        result.or_else(|e| self.failed(e))
    }

    /// M6: decrypts and checks the accessory's signed identity.
    pub fn process_m6(&mut self, response: &[u8]) -> Result<AccessoryInfo> {
        self.advance(SetupStep::M5Sent, SetupStep::Complete)?;
        let tlv = self.check_response(response, 6)?;
        let (Some(proof), Some(key)) = (self.proof.as_ref(), self.session_key.as_ref()) else {
            return self.failed(protocol("session key not derived").into());
        };

        let result = (|| {
            let decrypted = decrypt_with_nonce(
                key.as_bytes(),
                &nonce_from_string(b"PS-Msg06"),
                tlv.require(TlvType::EncryptedData)?,
            )?;
            let inner = Tlv8::decode(&decrypted)?;
            let id = String::from_utf8(inner.require(TlvType::Identifier)?.to_vec())
                .map_err(|_| protocol("accessory identifier is not UTF-8"))?;
            let public_key = public_key_from_slice(inner.require(TlvType::PublicKey)?)?;
            let signature = inner.require(TlvType::Signature)?;

            // AccessoryX || AccessoryPairingID || AccessoryLTPK
            let accessory_x = hkdf::derive_accessory_sign_key(&proof.shared_secret)?;
            let mut info = Vec::new();
            info.extend_from_slice(&accessory_x);
            info.extend_from_slice(id.as_bytes());
            info.extend_from_slice(&public_key);
            verify(&public_key, &info, signature)?;

            Ok::<_, Error>(AccessoryInfo { id, public_key })
        })();

        result.or_else(|e| self.failed(e))
    }

    fn advance(&mut self, from: SetupStep, to: SetupStep) -> Result<()> {
        if self.step != from {
            return self.failed(protocol(&format!("cannot move from {:?} to {:?}", self.step, to)).into());
        }
        self.step = to;
        Ok(())
    }

    fn check_response(&mut self, response: &[u8], state: u8) -> Result<Tlv8> {
        match parse_response(response, state) {
            Ok(tlv) => Ok(tlv),
            Err(e) => self.failed(e),
        }
    }

    fn failed<T>(&mut self, err: Error) -> Result<T> {
        self.step = SetupStep::Failed;
        Err(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyStep {
    Initial,
    M1Sent,
    M2Received,
    M3Sent,
    Complete,
}

/// Controller half of pair-verify.
pub struct ControllerPairVerify {
    step: VerifyStep,
    identity: ControllerIdentity,
    accessory_ltpk: [u8; 32],
    ephemeral_secret: Option<[u8; 32]>,
    ephemeral: Option<EphemeralKey>,
    agreement: Option<KeyAgreement>,
    session_key: Option<EncryptionKey>,
}

impl ControllerPairVerify {
    /// `accessory_ltpk` is the key learned during pair-setup.
    pub fn new(identity: ControllerIdentity, accessory_ltpk: [u8; 32]) -> Self {
        Self {
            step: VerifyStep::Initial,
            identity,
            accessory_ltpk,
            ephemeral_secret: None,
            ephemeral: None,
            agreement: None,
            session_key: None,
        }
    }

    /// Use the same ephemeral secret for every M1 instead of a random one.
    pub fn with_ephemeral_secret(mut self, secret: [u8; 32]) -> Self {
        self.ephemeral_secret = Some(secret);
        self
    }

    /// M1: `{State=1, PublicKey}`. Calling it again restarts verification.
    pub fn generate_m1(&mut self) -> Vec<u8> {
        let ephemeral = match self.ephemeral_secret {
            Some(secret) => EphemeralKey::from_secret(secret),
            None => EphemeralKey::generate(),
        };
        let controller_public = ephemeral.public_key();
        self.ephemeral = Some(ephemeral);
        self.agreement = None;
        self.session_key = None;
        self.step = VerifyStep::M1Sent;
        Tlv8::pair_verify_m1(&controller_public).encode()
    }

    /// M2: checks the accessory's signature over both ephemeral keys.
    pub fn process_m2(&mut self, response: &[u8]) -> Result<()> {
        self.expect(VerifyStep::M1Sent)?;
        let tlv = parse_response(response, 2)?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| protocol("ephemeral key missing"))?;

        let accessory_public: [u8; 32] = public_key_from_slice(tlv.require(TlvType::PublicKey)?)?;
        let agreement = ephemeral.agree(accessory_public)?;
        let session_key = agreement.verify_key()?;

        let decrypted = decrypt_with_nonce(
            session_key.as_bytes(),
            &nonce_from_string(b"PV-Msg02"),
            tlv.require(TlvType::EncryptedData)?,
        )?;
        let inner = Tlv8::decode(&decrypted)?;
        let accessory_id = inner.require(TlvType::Identifier)?;
        let signature = inner.require(TlvType::Signature)?;

        verify(
            &self.accessory_ltpk,
            &agreement.peer_transcript(accessory_id),
            signature,
        )?;

        self.agreement = Some(agreement);
        self.session_key = Some(session_key);
        self.step = VerifyStep::M2Received;
        Ok(())
    }

    /// M3: encrypted `{Identifier, Signature}`.
    pub fn generate_m3(&mut self) -> Result<Vec<u8>> {
        self.expect(VerifyStep::M2Received)?;
        let (Some(key), Some(agreement)) = (&self.session_key, &self.agreement) else {
            return Err(protocol("session key not derived").into());
        };
        let signature = self
            .identity
            .sign(&agreement.local_transcript(self.identity.id().as_bytes()));

        let sub_tlv = Tlv8::new()
            .with(TlvType::Identifier, self.identity.id().as_bytes().to_vec())
            .with(TlvType::Signature, signature.to_vec());
        let encrypted = encrypt_with_nonce(
            key.as_bytes(),
            &nonce_from_string(b"PV-Msg03"),
            &sub_tlv.encode(),
        )?;

        self.step = VerifyStep::M3Sent;
        Ok(Tlv8::new()
            .with(TlvType::State, vec![0x03])
            .with(TlvType::EncryptedData, encrypted)
            .encode())
    }

    /// M4: `{State=4}`. Returns the controller's view of the session keys.
    pub fn process_m4(&mut self, response: &[u8]) -> Result<SessionKeys> {
        self.expect(VerifyStep::M3Sent)?;
        parse_response(response, 4)?;
        let agreement = self
            .agreement
            .as_ref()
            .ok_or_else(|| protocol("shared secret missing"))?;
        let keys = SessionKeys::derive_control_keys(agreement.shared_secret())?;
        self.step = VerifyStep::Complete;
        Ok(keys)
    }

    pub fn is_complete(&self) -> bool {
        self.step == VerifyStep::Complete
    }

    fn expect(&self, step: VerifyStep) -> Result<()> {
        if self.step == step {
            Ok(())
        } else {
            Err(protocol(&format!("expected {:?}, at {:?}", step, self.step)).into())
        }
    }
}

/// Decode a response and turn an `Error` TLV into the matching error.
fn parse_response(response: &[u8], state: u8) -> Result<Tlv8> {
    let tlv = Tlv8::decode(response)?;
    if let Some(code) = tlv.error() {
        return Err(match code {
            TlvErrorCode::Authentication => PairingError::AuthenticationFailed,
            TlvErrorCode::Unavailable => PairingError::Unavailable,
            TlvErrorCode::Busy => PairingError::Busy,
            TlvErrorCode::MaxTries => PairingError::MaxTries,
            TlvErrorCode::MaxPeers => PairingError::MaxPeers,
            other => PairingError::Protocol(format!("accessory returned {:?}", other)),
        }
        .into());
    }
    if tlv.state() != Some(state) {
        return Err(PairingError::Sequence {
            expected: state,
            actual: tlv.state().unwrap_or(0),
        }
        .into());
    }
    Ok(tlv)
}

fn dashed_pin(pin: &str) -> String {
    let digits: String = pin.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 8 {
        format!("{}-{}-{}", &digits[0..3], &digits[3..5], &digits[5..8])
    } else {
        pin.to_string()
    }
}

fn protocol(msg: &str) -> PairingError {
    PairingError::Protocol(msg.to_string())
}
