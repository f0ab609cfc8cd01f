//! Accessory setup code (the PIN a user types on the controller).

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Default setup code digits.
pub const DEFAULT_SETUP_CODE: &str = "00102003";

/// Codes the protocol forbids because they are trivially guessable.
const DISALLOWED_CODES: &[&str] = &[
    "00000000", "11111111", "22222222", "33333333", "44444444", "55555555", "66666666",
    "77777777", "88888888", "99999999", "12345678", "87654321",
];

/// An eight digit setup code.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupCode {
    digits: [u8; 8],
}

impl SetupCode {
    /// Parse `"00102003"` or `"001-02-003"`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        let digits: String = if trimmed.len() == 10 {
            let bytes = trimmed.as_bytes();
            if bytes[3] != b'-' || bytes[6] != b'-' {
                return Err(ConfigError::InvalidSetupCode(
                    "expected XXX-XX-XXX".to_string(),
                ));
            }
            trimmed.chars().filter(|c| *c != '-').collect()
        } else {
            trimmed.to_string()
        };

        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidSetupCode(
                "setup code must be 8 digits".to_string(),
            ));
        }
        if DISALLOWED_CODES.contains(&digits.as_str()) {
            return Err(ConfigError::InvalidSetupCode(
                "setup code is too simple".to_string(),
            ));
        }

        let mut out = [0u8; 8];
        out.copy_from_slice(digits.as_bytes());
        Ok(Self { digits: out })
    }

    /// The password fed into SRP: always the dashed `XXX-XX-XXX` form.
    pub fn srp_password(&self) -> String {
        let d = |r: std::ops::Range<usize>| String::from_utf8_lossy(&self.digits[r]).into_owned();
        format!("{}-{}-{}", d(0..3), d(3..5), d(5..8))
    }

    /// The undashed digits.
    pub fn digits(&self) -> String {
        String::from_utf8_lossy(&self.digits).into_owned()
    }
}

impl Default for SetupCode {
    fn default() -> Self {
        let mut digits = [0u8; 8];
        digits.copy_from_slice(DEFAULT_SETUP_CODE.as_bytes());
        Self { digits }
    }
}

impl FromStr for SetupCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.srp_password())
    }
}

// Keep the code out of logs.
impl fmt::Debug for SetupCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SetupCode(***-**-***)")
    }
}
