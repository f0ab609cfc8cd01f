//! Accessory attribute database.
//!
//! The server never interprets services or characteristics itself. It asks an
//! [`AccessoryDatabase`] for the `/accessories` document and for reads and
//! writes of individual characteristics.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use hap_core::error::{Error, ParseError};
use hap_core::ids::CharacteristicId;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Per-characteristic status codes reported in `/characteristics` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapStatus {
    Success,
    InsufficientPrivileges,
    ResourceBusy,
    ReadOnly,
    WriteOnly,
    NotificationNotSupported,
    ResourceDoesNotExist,
    InvalidValue,
}

impl HapStatus {
    pub fn code(self) -> i32 {
        match self {
            HapStatus::Success => 0,
            HapStatus::InsufficientPrivileges => -70401,
            HapStatus::ResourceBusy => -70403,
            HapStatus::ReadOnly => -70404,
            HapStatus::WriteOnly => -70405,
            HapStatus::NotificationNotSupported => -70406,
            HapStatus::ResourceDoesNotExist => -70409,
            HapStatus::InvalidValue => -70410,
        }
    }
}

/// Source of truth for the accessory attribute model.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait AccessoryDatabase: Send + Sync {
    /// The full `{"accessories": [...]}` document.
    async fn accessories_json(&self) -> Value;

    /// Current value of one characteristic.
    async fn read(&self, id: CharacteristicId) -> Result<Value, HapStatus>;

    /// Store a new value written by a controller.
    async fn write(&self, id: CharacteristicId, value: Value) -> Result<(), HapStatus>;

    /// Check that the characteristic can deliver events.
    async fn subscribe(&self, id: CharacteristicId) -> Result<(), HapStatus>;

    /// Run the accessory's identify routine.
    async fn identify(&self) -> Result<(), HapStatus>;
}

const IDENTIFY_TYPE: &str = "14";

/// [`AccessoryDatabase`] held entirely in a JSON document.
///
/// Characteristics carry `perms` (`pr`, `pw`, `ev`) and a `format` that
/// writes are checked against.
pub struct MemoryAccessories {
    document: Mutex<Value>,
}

impl MemoryAccessories {
    pub fn new(document: Value) -> Result<Self, ParseError> {
        if !document
            .get("accessories")
            .is_some_and(|a| a.is_array())
        {
            return Err(ParseError::MissingField("accessories"));
        }
        Ok(Self {
            document: Mutex::new(document),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&contents).map_err(|e| {
            ParseError::InvalidFormat(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self::new(document)?)
    }

    /// A single lightbulb with its accessory information service.
    ///
    /// The `On` characteristic is `1.10`.
    pub fn lightbulb(name: &str) -> Self {
        let document = json!({
            "accessories": [{
                "aid": 1,
                "services": [
                    {
                        "iid": 1,
                        "type": "3E",
                        "characteristics": [
                            {"iid": 2, "type": "14", "perms": ["pw"], "format": "bool"},
                            {"iid": 3, "type": "20", "perms": ["pr"], "format": "string", "value": "hap-rs"},
                            {"iid": 4, "type": "21", "perms": ["pr"], "format": "string", "value": "Lightbulb"},
                            {"iid": 5, "type": "23", "perms": ["pr"], "format": "string", "value": name},
                            {"iid": 6, "type": "30", "perms": ["pr"], "format": "string", "value": "0001"},
                            {"iid": 7, "type": "52", "perms": ["pr"], "format": "string", "value": env!("CARGO_PKG_VERSION")}
                        ]
                    },
                    {
                        "iid": 8,
                        "type": "43",
                        "primary": true,
                        "characteristics": [
                            {"iid": 9, "type": "23", "perms": ["pr"], "format": "string", "value": name},
                            {"iid": 10, "type": "25", "perms": ["pr", "pw", "ev"], "format": "bool", "value": false}
                        ]
                    }
                ]
            }]
        });
        Self {
            document: Mutex::new(document),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_characteristic(document: &mut Value, id: CharacteristicId) -> Option<&mut Value> {
    document
        .get_mut("accessories")?
        .as_array_mut()?
        .iter_mut()
        .find(|a| a.get("aid").and_then(Value::as_u64) == Some(id.aid))?
        .get_mut("services")?
        .as_array_mut()?
        .iter_mut()
        .filter_map(|s| s.get_mut("characteristics")?.as_array_mut())
        .flatten()
        .find(|c| c.get("iid").and_then(Value::as_u64) == Some(id.iid))
}

fn has_perm(characteristic: &Value, perm: &str) -> bool {
    characteristic
        .get("perms")
        .and_then(Value::as_array)
        .is_some_and(|perms| perms.iter().any(|p| p.as_str() == Some(perm)))
}

/// Normalize `value` to the characteristic's declared format.
fn coerce(format: &str, value: Value) -> Result<Value, HapStatus> {
    match (format, &value) {
        ("bool", Value::Bool(_)) => Ok(value),
        ("bool", Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(HapStatus::InvalidValue),
        },
        ("uint8" | "uint16" | "uint32" | "uint64", Value::Number(n)) if n.is_u64() => Ok(value),
        ("int", Value::Number(n)) if n.is_i64() => Ok(value),
        ("float", Value::Number(_)) => Ok(value),
        ("string" | "data" | "tlv8", Value::String(_)) => Ok(value),
        _ => Err(HapStatus::InvalidValue),
    }
}

#[async_trait]
impl AccessoryDatabase for MemoryAccessories {
    async fn accessories_json(&self) -> Value {
        self.lock().clone()
    }

    async fn read(&self, id: CharacteristicId) -> Result<Value, HapStatus> {
        let mut document = self.lock();
        let characteristic =
            find_characteristic(&mut document, id).ok_or(HapStatus::ResourceDoesNotExist)?;
        if !has_perm(characteristic, "pr") {
            return Err(HapStatus::WriteOnly);
        }
        Ok(characteristic.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn write(&self, id: CharacteristicId, value: Value) -> Result<(), HapStatus> {
        let identify = {
            let mut document = self.lock();
            let characteristic =
                find_characteristic(&mut document, id).ok_or(HapStatus::ResourceDoesNotExist)?;
            if !has_perm(characteristic, "pw") {
                return Err(HapStatus::ReadOnly);
            }
            let format = characteristic
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or("string");
            let value = coerce(format, value)?;
            let identify = characteristic.get("type").and_then(Value::as_str)
                == Some(IDENTIFY_TYPE)
                && value == Value::Bool(true);
            if !identify {
                characteristic["value"] = value;
            }
            identify
        };
        debug!(characteristic = %id, "characteristic written");
        if identify {
            self.identify().await?;
        }
        Ok(())
    }

    async fn subscribe(&self, id: CharacteristicId) -> Result<(), HapStatus> {
        let mut document = self.lock();
        let characteristic =
            find_characteristic(&mut document, id).ok_or(HapStatus::ResourceDoesNotExist)?;
        if has_perm(characteristic, "ev") {
            Ok(())
        } else {
            Err(HapStatus::NotificationNotSupported)
        }
    }

    async fn identify(&self) -> Result<(), HapStatus> {
        info!("identify requested");
        Ok(())
    }
}
