//! Admin pairing management: `AddPairing`, `RemovePairing`, `ListPairings`.
//!
//! Requests arrive on a verified session; only admin controllers may use them.

use hap_core::error::{Error, PairingError};
use hap_crypto::{
    ed25519::public_key_from_slice,
    tlv::{PairingMethod, Tlv8, TlvType},
};
use tracing::{debug, info};

use crate::identity::{IdentityStore, PairedController, Permissions};
use crate::pair_setup::error_code;

/// Result of one `/pairings` request.
pub struct PairingsResponse {
    /// TLV8 body to send back.
    pub body: Vec<u8>,
    /// Controllers that are no longer paired; their sessions must be closed.
    pub removed: Vec<String>,
}

/// Handle a `/pairings` request from `controller_id` (the verified session owner).
pub fn handle_pairings(
    request: &[u8],
    controller_id: Option<&str>,
    store: &IdentityStore,
) -> PairingsResponse {
    // Filled even when the request fails part way.
    let mut removed = Vec::new();
    let body = match process(request, controller_id, store, &mut removed) {
        Ok(body) => body.encode(),
        Err(err) => {
            debug!(error = %err, "pairings request rejected");
            Tlv8::error_response(2, error_code(&err)).encode()
        }
    };
    PairingsResponse { body, removed }
}

fn process(
    request: &[u8],
    controller_id: Option<&str>,
    store: &IdentityStore,
    removed: &mut Vec<String>,
) -> Result<Tlv8, Error> {
    let tlv = Tlv8::decode(request)?;
    if tlv.state() != Some(1) {
        return Err(PairingError::Sequence {
            expected: 1,
            actual: tlv.state().unwrap_or(0),
        }
        .into());
    }

    let is_admin = controller_id.is_some_and(|id| store.is_admin(id));
    if !is_admin {
        return Err(PairingError::AuthenticationFailed.into());
    }

    let method = tlv
        .method()
        .ok_or(PairingError::MissingTlv(TlvType::Method as u8))?;
    let done = Tlv8::new().with(TlvType::State, vec![0x02]);

    match PairingMethod::try_from(method)? {
        PairingMethod::AddPairing => {
            let id = tlv.require(TlvType::Identifier)?;
            let id = String::from_utf8(id.to_vec())
                .map_err(|_| PairingError::Protocol("pairing identifier is not UTF-8".to_string()))?;
            let public_key = public_key_from_slice(tlv.require(TlvType::PublicKey)?)
                .map_err(|e| PairingError::Protocol(e.to_string()))?;
            let permissions = tlv
                .get(TlvType::Permissions)
                .and_then(|p| p.first().copied())
                .map(Permissions::from_byte)
                .unwrap_or(Permissions::Regular);

            store.add_controller(PairedController {
                id: id.clone(),
                public_key,
                permissions,
            })?;
            info!(controller = %id, ?permissions, "pairing added");
            Ok(done)
        }
        PairingMethod::RemovePairing => {
            let id = tlv.require(TlvType::Identifier)?;
            let id = String::from_utf8_lossy(id).into_owned();
            let removal = store.remove_controller(&id);
            *removed = removal.removed;
            if let Some(err) = removal.error {
                return Err(err);
            }
            if removed.is_empty() {
                debug!(controller = %id, "remove of unknown pairing");
            }
            Ok(done)
        }
        PairingMethod::ListPairings => {
            let mut body = done;
            for (i, controller) in store.controllers().iter().enumerate() {
                if i > 0 {
                    body.push(TlvType::Separator, Vec::new());
                }
                body.push(TlvType::Identifier, controller.id.as_bytes().to_vec());
                body.push(TlvType::PublicKey, controller.public_key.to_vec());
                body.push(TlvType::Permissions, vec![controller.permissions.to_byte()]);
            }
            Ok(body)
        }
        _ => Err(PairingError::UnsupportedMethod(method).into()),
    }
}
