//! Identifiers shared between the pairing and server crates.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Identity of one accepted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Characteristic address: accessory instance id plus characteristic instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId {
    pub aid: u64,
    pub iid: u64,
}

impl CharacteristicId {
    pub fn new(aid: u64, iid: u64) -> Self {
        Self { aid, iid }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.aid, self.iid)
    }
}

impl FromStr for CharacteristicId {
    type Err = ParseError;

    /// Parse the `aid.iid` form used in `/characteristics?id=` queries.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (aid, iid) = s
            .split_once('.')
            .ok_or_else(|| ParseError::InvalidValue(format!("characteristic id: {}", s)))?;
        let aid = aid
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidValue(format!("accessory id: {}", aid)))?;
        let iid = iid
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidValue(format!("instance id: {}", iid)))?;
        Ok(Self { aid, iid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[test]
    fn characteristic_id_parses_dotted_form() {
        let id: CharacteristicId = "1.10".parse().unwrap();
        assert_eq!(id, CharacteristicId::new(1, 10));
        assert_eq!(id.to_string(), "1.10");
    }

    #[test]
    fn characteristic_id_rejects_garbage() {
        assert!("1".parse::<CharacteristicId>().is_err());
        assert!("a.2".parse::<CharacteristicId>().is_err());
        assert!("1.".parse::<CharacteristicId>().is_err());
    }
}
