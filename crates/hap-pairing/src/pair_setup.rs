//! HomeKit pair-setup protocol (M1-M6), accessory side.
//!
//! Each connection owns one [`PairSetup`]. Accessory-wide limits (one setup
//! at a time, the failed-proof counter) live in the shared [`SetupAttempts`].
//!
//! ```text
//! M1 {State=1, Method}            -> M2 {State=2, Salt, PublicKey=B}
//! M3 {State=3, PublicKey=A, Proof} -> M4 {State=4, Proof=M2}
//! M5 {State=5, EncryptedData}      -> M6 {State=6, EncryptedData}
//! ```

use std::sync::{Arc, Mutex};

use hap_core::error::{Error, PairingError};
use hap_core::ids::ConnectionId;
use hap_core::setup_code::SetupCode;
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::{public_key_from_slice, verify},
    hkdf,
    keys::{EncryptionKey, SessionKeys, SharedSecret},
    srp::SrpServer,
    tlv::{PairingMethod, Tlv8, TlvErrorCode, TlvType},
};
use tracing::{debug, info, warn};

use crate::identity::{IdentityStore, PairedController, Permissions};

/// SRP username for pair-setup.
pub const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Failed proofs after which every M1 is refused.
pub const MAX_FAILED_ATTEMPTS: u32 = 100;

/// Nonce for pair-setup M5 decryption.
const PS_MSG05_NONCE: &[u8] = b"PS-Msg05";
/// Nonce for pair-setup M6 encryption.
const PS_MSG06_NONCE: &[u8] = b"PS-Msg06";

/// Accessory-wide pair-setup bookkeeping shared by all connections.
#[derive(Debug, Default)]
pub struct SetupAttempts {
    inner: Mutex<AttemptsInner>,
}

#[derive(Debug, Default)]
struct AttemptsInner {
    owner: Option<ConnectionId>,
    failed: u32,
}

impl SetupAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failed SRP proofs so far.
    pub fn failed(&self) -> u32 {
        self.lock().failed
    }

    /// Connection currently running pair-setup, if any.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.lock().owner
    }

    fn try_claim(&self, conn: ConnectionId) -> bool {
        let mut inner = self.lock();
        match inner.owner {
            Some(owner) if owner != conn => false,
            _ => {
                inner.owner = Some(conn);
                true
            }
        }
    }

    fn release(&self, conn: ConnectionId) {
        let mut inner = self.lock();
        if inner.owner == Some(conn) {
            inner.owner = None;
        }
    }

    fn record_failure(&self) -> u32 {
        let mut inner = self.lock();
        inner.failed = inner.failed.saturating_add(1);
        inner.failed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AttemptsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupState {
    AwaitingM1,
    AwaitingM3,
    AwaitingM5,
    Complete,
}

impl SetupState {
    fn expected_message(self) -> u8 {
        match self {
            SetupState::AwaitingM1 | SetupState::Complete => 1,
            SetupState::AwaitingM3 => 3,
            SetupState::AwaitingM5 => 5,
        }
    }
}

/// Pair-setup state machine for one connection.
pub struct PairSetup {
    conn: ConnectionId,
    setup_code: SetupCode,
    attempts: Arc<SetupAttempts>,
    state: SetupState,
    srp: Option<SrpServer>,
    shared_secret: Option<SharedSecret>,
    session_key: Option<EncryptionKey>,
}

impl PairSetup {
    pub fn new(conn: ConnectionId, setup_code: SetupCode, attempts: Arc<SetupAttempts>) -> Self {
        Self {
            conn,
            setup_code,
            attempts,
            state: SetupState::AwaitingM1,
            srp: None,
            shared_secret: None,
            session_key: None,
        }
    }

    /// True between a successful M1 and the final M6 or a failure.
    pub fn is_active(&self) -> bool {
        matches!(self.state, SetupState::AwaitingM3 | SetupState::AwaitingM5)
    }

    /// True once M6 has been produced.
    pub fn is_complete(&self) -> bool {
        self.state == SetupState::Complete
    }

    /// Process one request body and produce the TLV8 response body.
    ///
    /// Failures are answered with `State = request + 1` and an `Error` TLV;
    /// the detailed cause is only logged.
    pub fn handle(&mut self, request: &[u8], store: &IdentityStore) -> Vec<u8> {
        let tlv = match Tlv8::decode(request) {
            Ok(tlv) => tlv,
            Err(e) => {
                debug!(conn = %self.conn, error = %e, "undecodable pair-setup request");
                let state = self.state.expected_message() + 1;
                self.reset();
                return Tlv8::error_response(state, TlvErrorCode::Unknown).encode();
            }
        };

        let request_state = tlv.state().unwrap_or(0);
        let result = match request_state {
            1 => self.handle_m1(&tlv, store),
            3 => self.handle_m3(&tlv),
            5 => self.handle_m5(&tlv, store),
            actual => Err(PairingError::Sequence {
                expected: self.state.expected_message(),
                actual,
            }
            .into()),
        };

        match result {
            Ok(response) => response.encode(),
            Err(err) => {
                let code = error_code(&err);
                debug!(
                    conn = %self.conn,
                    state = request_state,
                    error = %err,
                    "pair-setup request rejected"
                );
                // A duplicate M1 must not disturb the setup already in progress.
                if !matches!(err, Error::Pairing(PairingError::Busy)) {
                    self.reset();
                }
                Tlv8::error_response(request_state.wrapping_add(1), code).encode()
            }
        }
    }

    fn handle_m1(&mut self, tlv: &Tlv8, store: &IdentityStore) -> Result<Tlv8, Error> {
        if let Some(method) = tlv.method() {
            match PairingMethod::try_from(method)? {
                PairingMethod::PairSetup | PairingMethod::PairSetupWithAuth => {}
                _ => return Err(PairingError::UnsupportedMethod(method).into()),
            }
        }

        if store.is_paired() {
            return Err(PairingError::Unavailable.into());
        }
        if self.is_active() {
            return Err(PairingError::Busy.into());
        }
        if self.attempts.failed() >= MAX_FAILED_ATTEMPTS {
            return Err(PairingError::MaxTries.into());
        }
        if !self.attempts.try_claim(self.conn) {
            return Err(PairingError::Busy.into());
        }

        let srp = SrpServer::new(SRP_USERNAME, self.setup_code.srp_password().as_bytes());
        let response = Tlv8::new()
            .with(TlvType::State, vec![0x02])
            .with(TlvType::Salt, srp.salt().to_vec())
            .with(TlvType::PublicKey, srp.public_key());

        self.srp = Some(srp);
        self.state = SetupState::AwaitingM3;
        info!(conn = %self.conn, "pair-setup started");
        Ok(response)
    }

    fn handle_m3(&mut self, tlv: &Tlv8) -> Result<Tlv8, Error> {
        self.expect(SetupState::AwaitingM3, 3)?;

        let client_public = tlv.require(TlvType::PublicKey)?;
        let client_proof = tlv.require(TlvType::Proof)?;
        let srp = self
            .srp
            .as_ref()
            .ok_or(PairingError::Sequence { expected: 1, actual: 3 })?;

        let verified = match srp.verify_client(client_public, client_proof) {
            Ok(verified) => verified,
            Err(e) => {
                let failed = self.attempts.record_failure();
                warn!(conn = %self.conn, failed, "pair-setup proof rejected");
                debug!(conn = %self.conn, error = %e, "SRP verification detail");
                return Err(PairingError::AuthenticationFailed.into());
            }
        };

        let shared_secret = SharedSecret::new(verified.shared_secret.clone());
        let session_key = SessionKeys::derive_pair_setup_key(&shared_secret)?;
        let response = Tlv8::new()
            .with(TlvType::State, vec![0x04])
            .with(TlvType::Proof, verified.server_proof.clone());

        self.srp = None;
        self.shared_secret = Some(shared_secret);
        self.session_key = Some(session_key);
        self.state = SetupState::AwaitingM5;
        debug!(conn = %self.conn, "pair-setup proof accepted");
        Ok(response)
    }

    fn handle_m5(&mut self, tlv: &Tlv8, store: &IdentityStore) -> Result<Tlv8, Error> {
        self.expect(SetupState::AwaitingM5, 5)?;

        let (Some(session_key), Some(shared_secret)) =
            (self.session_key.as_ref(), self.shared_secret.as_ref())
        else {
            return Err(PairingError::Sequence { expected: 1, actual: 5 }.into());
        };

        let encrypted = tlv.require(TlvType::EncryptedData)?;
        let decrypted = decrypt_with_nonce(
            session_key.as_bytes(),
            &nonce_from_string(PS_MSG05_NONCE),
            encrypted,
        )
        .map_err(|_| PairingError::AuthenticationFailed)?;

        let inner = Tlv8::decode(&decrypted)?;
        let controller_id = inner.require(TlvType::Identifier)?;
        let controller_ltpk = inner.require(TlvType::PublicKey)?;
        let signature = inner.require(TlvType::Signature)?;

        let controller_ltpk =
            public_key_from_slice(controller_ltpk).map_err(|_| PairingError::AuthenticationFailed)?;
        let controller_id = String::from_utf8(controller_id.to_vec())
            .map_err(|_| PairingError::Protocol("pairing identifier is not UTF-8".to_string()))?;

        // iOSDeviceX || iOSDevicePairingID || iOSDeviceLTPK
        let device_x = hkdf::derive_controller_sign_key(shared_secret.as_bytes())?;
        let mut device_info = Vec::with_capacity(32 + controller_id.len() + 32);
        device_info.extend_from_slice(&device_x);
        device_info.extend_from_slice(controller_id.as_bytes());
        device_info.extend_from_slice(&controller_ltpk);
        verify(&controller_ltpk, &device_info, signature)
            .map_err(|_| PairingError::AuthenticationFailed)?;

        store.add_controller(PairedController {
            id: controller_id.clone(),
            public_key: controller_ltpk,
            permissions: Permissions::Admin,
        })?;

        // AccessoryX || AccessoryPairingID || AccessoryLTPK
        let accessory_x = hkdf::derive_accessory_sign_key(shared_secret.as_bytes())?;
        let accessory_id = store.identifier().as_bytes();
        let accessory_ltpk = store.keypair().public_key();
        let mut accessory_info = Vec::with_capacity(32 + accessory_id.len() + 32);
        accessory_info.extend_from_slice(&accessory_x);
        accessory_info.extend_from_slice(accessory_id);
        accessory_info.extend_from_slice(&accessory_ltpk);
        let accessory_signature = store.keypair().sign(&accessory_info);

        let sub_tlv = Tlv8::new()
            .with(TlvType::Identifier, accessory_id.to_vec())
            .with(TlvType::PublicKey, accessory_ltpk.to_vec())
            .with(TlvType::Signature, accessory_signature.to_vec());
        let encrypted = encrypt_with_nonce(
            session_key.as_bytes(),
            &nonce_from_string(PS_MSG06_NONCE),
            &sub_tlv.encode(),
        )?;

        let response = Tlv8::new()
            .with(TlvType::State, vec![0x06])
            .with(TlvType::EncryptedData, encrypted);

        self.finish();
        info!(conn = %self.conn, controller = %controller_id, "pair-setup complete");
        Ok(response)
    }

    fn expect(&self, state: SetupState, actual: u8) -> Result<(), PairingError> {
        if self.state == state {
            Ok(())
        } else {
            Err(PairingError::Sequence {
                expected: self.state.expected_message(),
                actual,
            })
        }
    }

    fn finish(&mut self) {
        self.clear_secrets();
        self.state = SetupState::Complete;
        self.attempts.release(self.conn);
    }

    /// Drop all secrets and return to waiting for M1.
    fn reset(&mut self) {
        self.clear_secrets();
        self.state = SetupState::AwaitingM1;
        self.attempts.release(self.conn);
    }

    fn clear_secrets(&mut self) {
        self.srp = None;
        self.shared_secret = None;
        self.session_key = None;
    }
}

impl Drop for PairSetup {
    fn drop(&mut self) {
        self.attempts.release(self.conn);
    }
}

/// Wire error code for a pairing failure.
pub(crate) fn error_code(err: &Error) -> TlvErrorCode {
    match err {
        Error::Pairing(p) => TlvErrorCode::from(p),
        _ => TlvErrorCode::Unknown,
    }
}
