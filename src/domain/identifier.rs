//! Service and characteristic identifiers
//!
//! Both are 128-bit UUIDs entered by the user as text. Only the canonical
//! hyphenated 8-4-4-4-12 form is accepted (hex digits in either case), so
//! a typo is caught before any radio operation is attempted.

use crate::error::GattError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const CANONICAL_LEN: usize = 36;
const HYPHEN_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Parse canonical UUID text
fn parse_canonical(text: &str) -> Result<Uuid, GattError> {
    let invalid = || GattError::InvalidIdentifier(text.to_string());

    if text.len() != CANONICAL_LEN {
        return Err(invalid());
    }

    let well_formed = text.char_indices().all(|(i, c)| {
        if HYPHEN_POSITIONS.contains(&i) {
            c == '-'
        } else {
            c.is_ascii_hexdigit()
        }
    });
    if !well_formed {
        return Err(invalid());
    }

    Uuid::parse_str(text).map_err(|_| invalid())
}

/// Identifier of a GATT service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub fn parse(text: &str) -> Result<Self, GattError> {
        parse_canonical(text).map(Self)
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for ServiceId {
    type Err = GattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Identifier of a GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub fn parse(text: &str) -> Result<Self, GattError> {
        parse_canonical(text).map(Self)
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl FromStr for CharacteristicId {
    type Err = GattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
