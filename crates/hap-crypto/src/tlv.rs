//! TLV8 encoding/decoding for HomeKit pairing messages.
//!
//! TLV8 format: [Type: 1 byte][Length: 1 byte][Value: 0-255 bytes]
//! Values longer than 255 bytes are fragmented across consecutive TLVs that
//! share a type, and reassembled on decode.
//!
//! Field order is preserved in both directions, and unknown types are kept
//! as raw bytes for the caller to use or ignore.

use hap_core::error::{PairingError, ParseError};

/// Longest value a single TLV item can carry.
const MAX_FRAGMENT: usize = 255;

/// TLV type constants for HomeKit pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0A,
    Permissions = 0x0B,
    FragmentData = 0x0C,
    FragmentLast = 0x0D,
    SessionId = 0x0E,
    Flags = 0x13,
    Separator = 0xFF,
}

/// Error codes carried in the `Error` TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvErrorCode {
    Unknown = 0x01,
    Authentication = 0x02,
    Backoff = 0x03,
    MaxPeers = 0x04,
    MaxTries = 0x05,
    Unavailable = 0x06,
    Busy = 0x07,
}

/// Pairing methods carried in the `Method` TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingMethod {
    PairSetup = 0x00,
    PairSetupWithAuth = 0x01,
    PairVerify = 0x02,
    AddPairing = 0x03,
    RemovePairing = 0x04,
    ListPairings = 0x05,
}

/// Parsed TLV8 message: an ordered list of `(type, value)` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlv8 {
    fields: Vec<(u8, Vec<u8>)>,
}

impl Tlv8 {
    /// Create empty TLV8 message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an ordered field list.
    pub fn from_fields(fields: Vec<(u8, Vec<u8>)>) -> Self {
        Self { fields }
    }

    /// Decode TLV8 from bytes.
    ///
    /// Consecutive TLVs with the same type are concatenated into one field.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let mut fields: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut i = 0;

        while i < data.len() {
            // Need at least 2 bytes for type and length
            if i + 2 > data.len() {
                return Err(ParseError::MalformedTlv("truncated header".to_string()));
            }

            let typ = data[i];
            let len = data[i + 1] as usize;
            i += 2;

            if i + len > data.len() {
                return Err(ParseError::MalformedTlv(format!(
                    "truncated value (expected {} bytes, got {})",
                    len,
                    data.len() - i
                )));
            }

            let value = &data[i..i + len];
            i += len;

            match fields.last_mut() {
                Some((last_type, existing)) if *last_type == typ => {
                    existing.extend_from_slice(value);
                }
                _ => fields.push((typ, value.to_vec())),
            }
        }

        Ok(Self { fields })
    }

    /// Encode to bytes.
    ///
    /// Values > 255 bytes are fragmented across multiple TLVs.
    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.encoded_len());

        for (typ, value) in &self.fields {
            if value.is_empty() {
                result.push(*typ);
                result.push(0);
                continue;
            }
            for chunk in value.chunks(MAX_FRAGMENT) {
                result.push(*typ);
                result.push(chunk.len() as u8);
                result.extend_from_slice(chunk);
            }
        }

        result
    }

    fn encoded_len(&self) -> usize {
        self.fields
            .iter()
            .map(|(_, v)| v.len() + 2 * v.len().div_ceil(MAX_FRAGMENT).max(1))
            .sum()
    }

    /// All fields in wire order.
    pub fn fields(&self) -> &[(u8, Vec<u8>)] {
        &self.fields
    }

    /// Consume into the ordered field list.
    pub fn into_fields(self) -> Vec<(u8, Vec<u8>)> {
        self.fields
    }

    /// First value for type.
    pub fn get(&self, typ: TlvType) -> Option<&[u8]> {
        self.get_raw(typ as u8)
    }

    /// First value for raw type.
    pub fn get_raw(&self, typ: u8) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == typ)
            .map(|(_, v)| v.as_slice())
    }

    /// Value for type, or `MissingTlv`.
    pub fn require(&self, typ: TlvType) -> Result<&[u8], PairingError> {
        self.get(typ).ok_or(PairingError::MissingTlv(typ as u8))
    }

    /// Replace the first field of this type, or append one.
    pub fn set(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(t, _)| *t == typ as u8) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((typ as u8, value)),
        }
    }

    /// Append a field, keeping any earlier field of the same type.
    pub fn push(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        self.fields.push((typ as u8, value.into()));
    }

    /// Builder form of [`Tlv8::push`].
    pub fn with(mut self, typ: TlvType, value: impl Into<Vec<u8>>) -> Self {
        self.push(typ, value);
        self
    }

    /// Check if type is present.
    pub fn contains(&self, typ: TlvType) -> bool {
        self.get(typ).is_some()
    }

    /// Get state value (single byte).
    pub fn state(&self) -> Option<u8> {
        self.get(TlvType::State).and_then(|v| v.first().copied())
    }

    /// Get method value (single byte).
    pub fn method(&self) -> Option<u8> {
        self.get(TlvType::Method).and_then(|v| v.first().copied())
    }

    /// Get error value (single byte).
    pub fn error(&self) -> Option<TlvErrorCode> {
        self.get(TlvType::Error)
            .and_then(|v| v.first().copied())
            .and_then(TlvErrorCode::from_byte)
    }

    /// Get retry delay value in seconds.
    /// The value is little-endian encoded (1-2 bytes).
    pub fn retry_delay(&self) -> Option<u16> {
        self.get(TlvType::RetryDelay).map(|v| match v.len() {
            0 => 0,
            1 => v[0] as u16,
            _ => u16::from_le_bytes([v[0], v[1]]),
        })
    }

    /// Split on `Separator` fields into one message per record.
    ///
    /// Used for `ListPairings` responses.
    pub fn split_records(&self) -> Vec<Tlv8> {
        let mut records = vec![Tlv8::new()];
        for (typ, value) in &self.fields {
            if *typ == TlvType::Separator as u8 {
                records.push(Tlv8::new());
            } else if let Some(current) = records.last_mut() {
                current.fields.push((*typ, value.clone()));
            }
        }
        records.retain(|r| !r.fields.is_empty());
        records
    }

    /// Response carrying only `State` and `Error`.
    pub fn error_response(state: u8, code: TlvErrorCode) -> Self {
        Tlv8::new()
            .with(TlvType::State, vec![state])
            .with(TlvType::Error, vec![code as u8])
    }

    /// Create M1 pair-setup request.
    pub fn pair_setup_m1() -> Self {
        Tlv8::new()
            .with(TlvType::State, vec![0x01])
            .with(TlvType::Method, vec![PairingMethod::PairSetup as u8])
    }

    /// Create M1 pair-verify request with public key.
    pub fn pair_verify_m1(public_key: &[u8; 32]) -> Self {
        Tlv8::new()
            .with(TlvType::State, vec![0x01])
            .with(TlvType::PublicKey, public_key.to_vec())
    }
}

impl TlvType {
    /// Convert from raw byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Method),
            0x01 => Some(Self::Identifier),
            0x02 => Some(Self::Salt),
            0x03 => Some(Self::PublicKey),
            0x04 => Some(Self::Proof),
            0x05 => Some(Self::EncryptedData),
            0x06 => Some(Self::State),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::RetryDelay),
            0x09 => Some(Self::Certificate),
            0x0A => Some(Self::Signature),
            0x0B => Some(Self::Permissions),
            0x0C => Some(Self::FragmentData),
            0x0D => Some(Self::FragmentLast),
            0x0E => Some(Self::SessionId),
            0x13 => Some(Self::Flags),
            0xFF => Some(Self::Separator),
            _ => None,
        }
    }
}

impl TlvErrorCode {
    /// Convert from raw byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::Authentication),
            0x03 => Some(Self::Backoff),
            0x04 => Some(Self::MaxPeers),
            0x05 => Some(Self::MaxTries),
            0x06 => Some(Self::Unavailable),
            0x07 => Some(Self::Busy),
            _ => None,
        }
    }
}

impl From<&PairingError> for TlvErrorCode {
    /// Collapse internal failure detail into the code sent to the peer.
    ///
    /// Every cryptographic failure maps to `Authentication`, whichever check
    /// tripped.
    fn from(err: &PairingError) -> Self {
        match err {
            PairingError::AuthenticationFailed => TlvErrorCode::Authentication,
            PairingError::Unavailable => TlvErrorCode::Unavailable,
            PairingError::Busy => TlvErrorCode::Busy,
            PairingError::MaxTries => TlvErrorCode::MaxTries,
            PairingError::MaxPeers => TlvErrorCode::MaxPeers,
            PairingError::Sequence { .. }
            | PairingError::MissingTlv(_)
            | PairingError::UnsupportedMethod(_)
            | PairingError::Protocol(_) => TlvErrorCode::Unknown,
        }
    }
}

impl TryFrom<u8> for PairingMethod {
    type Error = PairingError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x00 => Ok(Self::PairSetup),
            0x01 => Ok(Self::PairSetupWithAuth),
            0x02 => Ok(Self::PairVerify),
            0x03 => Ok(Self::AddPairing),
            0x04 => Ok(Self::RemovePairing),
            0x05 => Ok(Self::ListPairings),
            other => Err(PairingError::UnsupportedMethod(other)),
        }
    }
}
