//! # hap-pairing
//!
//! HomeKit pairing for the accessory side.
//!
//! This crate implements:
//! - Persistent accessory identity and paired-controller records
//! - Pair-setup (SRP-6a, M1-M6)
//! - Pair-verify (Curve25519 + Ed25519, M1-M4)
//! - Admin pairing management (add, remove, list)
//! - The matching controller-side flows

mod controller;
mod identity;
mod pair_setup;
mod pair_verify;
mod pairings;
mod storage;

pub use controller::{AccessoryInfo, ControllerIdentity, ControllerPairSetup, ControllerPairVerify};
pub use identity::{IdentityStore, PairedController, Permissions, Removal, MAX_PAIRINGS};
pub use pair_setup::{PairSetup, SetupAttempts, MAX_FAILED_ATTEMPTS};
pub use pair_verify::{PairVerify, VerifyResponse};
pub use pairings::{handle_pairings, PairingsResponse};
pub use storage::{FileStorage, MemoryStorage, Storage};
