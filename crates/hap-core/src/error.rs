//! Error types for the HAP accessory server.

use thiserror::Error;

/// Primary error type for all accessory operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by the pair-setup, pair-verify and pairings state machines.
///
/// Only the TLV error code derived from these ever reaches the controller.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Accessory is already paired")]
    Unavailable,

    #[error("Unexpected pairing message: expected M{expected}, got M{actual}")]
    Sequence { expected: u8, actual: u8 },

    #[error("Another pairing attempt is in progress")]
    Busy,

    #[error("Too many failed pairing attempts")]
    MaxTries,

    #[error("No room for additional pairings")]
    MaxPeers,

    #[error("Missing required TLV type: {0}")]
    MissingTlv(u8),

    #[error("Unsupported pairing method: {0}")]
    UnsupportedMethod(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("SRP proof mismatch")]
    ProofMismatch,

    #[error("Nonce counter exhausted")]
    NonceExhausted,
}

/// Parsing errors for TLV8 and HTTP input.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed TLV8: {0}")]
    MalformedTlv(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Errors from the key-value persistence backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors on an established connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Frame failed integrity check")]
    FrameIntegrity,

    #[error("Frame length {0} exceeds maximum")]
    FrameTooLarge(usize),

    #[error("Request of {0} bytes exceeds maximum")]
    RequestTooLarge(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid setup code: {0}")]
    InvalidSetupCode(String),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
