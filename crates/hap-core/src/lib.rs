//! # hap-core
//!
//! Core types and error definitions shared across the HAP accessory crates.
//!
//! This crate provides:
//! - Common error types
//! - Connection and characteristic identifiers
//! - Pairing lifecycle events
//! - Setup code parsing
//! - TOML configuration

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod setup_code;

pub use config::Config;
pub use error::{
    ConfigError, CryptoError, Error, PairingError, ParseError, Result, StorageError,
    TransportError,
};
pub use event::PairingEvent;
pub use ids::{CharacteristicId, ConnectionId};
pub use setup_code::SetupCode;
