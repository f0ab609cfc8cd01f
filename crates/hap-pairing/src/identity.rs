//! Accessory identity and the set of paired controllers.
//!
//! The identifier and long-term key are generated once and persisted; the
//! controller records are cached in memory and written through to storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use hap_core::error::{Error, PairingError, StorageError};
use hap_core::event::PairingEvent;
use hap_crypto::ed25519::IdentityKeyPair;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::storage::Storage;

/// Storage key of the accessory identifier.
pub const IDENTIFIER_KEY: &str = "uuid";
/// Storage key of the accessory Ed25519 seed.
pub const KEYPAIR_KEY: &str = "keypair";
/// Prefix of every controller record key.
pub const PAIRING_PREFIX: &str = "pairing.";

/// Most controllers an accessory will hold.
pub const MAX_PAIRINGS: usize = 16;

const EVENT_CAPACITY: usize = 16;

/// Controller permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permissions {
    Regular,
    Admin,
}

impl Permissions {
    /// Value carried in the `Permissions` TLV.
    pub fn to_byte(self) -> u8 {
        match self {
            Permissions::Regular => 0x00,
            Permissions::Admin => 0x01,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        if b & 0x01 == 0x01 {
            Permissions::Admin
        } else {
            Permissions::Regular
        }
    }
}

/// A controller that completed pair-setup or was added by an admin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedController {
    pub id: String,
    pub public_key: [u8; 32],
    pub permissions: Permissions,
}

impl PairedController {
    pub fn is_admin(&self) -> bool {
        self.permissions == Permissions::Admin
    }
}

/// On-disk form of a controller record.
#[derive(Serialize, Deserialize)]
struct ControllerRecord {
    id: String,
    public_key: String,
    permissions: Permissions,
}

impl From<&PairedController> for ControllerRecord {
    fn from(c: &PairedController) -> Self {
        Self {
            id: c.id.clone(),
            public_key: hex::encode(c.public_key),
            permissions: c.permissions,
        }
    }
}

impl ControllerRecord {
    fn into_controller(self, key: &str) -> Result<PairedController, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let bytes = hex::decode(&self.public_key).map_err(|e| corrupt(e.to_string()))?;
        let public_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| corrupt("public key is not 32 bytes".to_string()))?;
        Ok(PairedController {
            id: self.id,
            public_key,
            permissions: self.permissions,
        })
    }
}

/// Outcome of [`IdentityStore::remove_controller`].
#[derive(Debug, Default)]
pub struct Removal {
    /// Controllers that are no longer paired.
    pub removed: Vec<String>,
    /// Storage failure that stopped the removal early.
    pub error: Option<Error>,
}

/// Accessory identity plus paired-controller records.
pub struct IdentityStore {
    storage: Arc<dyn Storage>,
    identifier: String,
    keypair: IdentityKeyPair,
    controllers: RwLock<BTreeMap<String, PairedController>>,
    events: broadcast::Sender<PairingEvent>,
}

impl IdentityStore {
    /// Load the identity from storage, generating and persisting it on first run.
    pub fn load_or_create(storage: Arc<dyn Storage>) -> Result<Self, Error> {
        let identifier = match storage.get(IDENTIFIER_KEY)? {
            Some(bytes) => String::from_utf8(bytes)
                .ok()
                .filter(|s| is_mac_identifier(s))
                .ok_or_else(|| StorageError::Corrupt {
                    key: IDENTIFIER_KEY.to_string(),
                    reason: "not a colon separated 48-bit identifier".to_string(),
                })?,
            None => {
                let identifier = generate_identifier();
                storage.set(IDENTIFIER_KEY, identifier.as_bytes())?;
                info!(identifier = %identifier, "generated accessory identifier");
                identifier
            }
        };

        let keypair = match storage.get(KEYPAIR_KEY)? {
            Some(bytes) => {
                let seed: [u8; 32] = bytes.try_into().map_err(|_| StorageError::Corrupt {
                    key: KEYPAIR_KEY.to_string(),
                    reason: "seed is not 32 bytes".to_string(),
                })?;
                IdentityKeyPair::from_seed(&seed)
            }
            None => {
                let keypair = IdentityKeyPair::generate();
                storage.set(KEYPAIR_KEY, &keypair.seed())?;
                info!("generated accessory long-term key");
                keypair
            }
        };

        let mut controllers = BTreeMap::new();
        for key in storage.all_keys()? {
            if !key.starts_with(PAIRING_PREFIX) {
                continue;
            }
            let Some(bytes) = storage.get(&key)? else {
                continue;
            };
            let record: ControllerRecord =
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            let controller = record.into_controller(&key)?;
            controllers.insert(controller.id.clone(), controller);
        }
        debug!(
            identifier = %identifier,
            controllers = controllers.len(),
            "loaded accessory identity"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            storage,
            identifier,
            keypair,
            controllers: RwLock::new(controllers),
            events,
        })
    }

    /// Accessory pairing identifier, e.g. `"AA:BB:CC:DD:EE:FF"`.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Accessory long-term key pair.
    pub fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }

    /// Receive `DevicePaired`/`DeviceUnpaired` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// True once at least one controller is paired.
    pub fn is_paired(&self) -> bool {
        !self.read().is_empty()
    }

    pub fn controller(&self, id: &str) -> Option<PairedController> {
        self.read().get(id).cloned()
    }

    pub fn controllers(&self) -> Vec<PairedController> {
        self.read().values().cloned().collect()
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.read().get(id).is_some_and(PairedController::is_admin)
    }

    /// Add a controller, or update the permissions of an existing one.
    ///
    /// Re-adding an identifier with a different key is refused.
    pub fn add_controller(&self, controller: PairedController) -> Result<(), Error> {
        let mut controllers = self.write();
        let is_new = match controllers.get(&controller.id) {
            Some(existing) if existing.public_key != controller.public_key => {
                return Err(PairingError::Protocol(format!(
                    "pairing {} already exists with a different key",
                    controller.id
                ))
                .into());
            }
            Some(_) => false,
            None if controllers.len() >= MAX_PAIRINGS => {
                return Err(PairingError::MaxPeers.into());
            }
            None => true,
        };

        let record = serde_json::to_vec(&ControllerRecord::from(&controller)).map_err(|e| {
            StorageError::Corrupt {
                key: record_key(&controller.id),
                reason: e.to_string(),
            }
        })?;
        self.storage.set(&record_key(&controller.id), &record)?;

        let id = controller.id.clone();
        controllers.insert(id.clone(), controller);
        drop(controllers);

        if is_new {
            info!(controller = %id, "controller paired");
            let _ = self.events.send(PairingEvent::DevicePaired { controller_id: id });
        } else {
            debug!(controller = %id, "controller permissions updated");
        }
        Ok(())
    }

    /// Remove a controller along with anything its removal takes down.
    ///
    /// Removing the last admin removes every remaining pairing as well. The
    /// requested controller goes first. A storage failure stops the removal,
    /// but controllers already deleted stay removed and are reported.
    pub fn remove_controller(&self, id: &str) -> Removal {
        let mut controllers = self.write();
        if !controllers.contains_key(id) {
            return Removal::default();
        }

        let admins_left = controllers
            .values()
            .filter(|c| c.id != id && c.is_admin())
            .count();
        let mut doomed = vec![id.to_string()];
        if admins_left == 0 {
            doomed.extend(controllers.keys().filter(|k| k.as_str() != id).cloned());
        }

        let mut removal = Removal::default();
        for controller_id in doomed {
            if let Err(e) = self.storage.delete(&record_key(&controller_id)) {
                warn!(controller = %controller_id, error = %e, "failed to delete pairing");
                removal.error = Some(e.into());
                break;
            }
            controllers.remove(&controller_id);
            removal.removed.push(controller_id);
        }
        drop(controllers);

        for controller_id in &removal.removed {
            info!(controller = %controller_id, "controller unpaired");
            let _ = self.events.send(PairingEvent::DeviceUnpaired {
                controller_id: controller_id.clone(),
            });
        }
        removal
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, PairedController>> {
        self.controllers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, PairedController>> {
        self.controllers.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn record_key(id: &str) -> String {
    format!("{}{}", PAIRING_PREFIX, hex::encode(id.as_bytes()))
}

fn generate_identifier() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn is_mac_identifier(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
}
