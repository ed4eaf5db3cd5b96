use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub type Amount = u128;
pub type RewardId = u64;

/// One whole unit of the native currency, in base units.
pub const UNIT: Amount = 1_000_000_000_000_000_000;

pub const ADDRESS_LEN: usize = 20;

/// 20-byte account identity. Renders as `0x`-prefixed lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// The null address. Never a valid transfer destination.
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    /// Deterministic account derived from a human-readable label.
    pub fn from_label(label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"room-ledger/account");
        hasher.update(label.as_bytes());
        Self::from_digest(hasher.finalize().into())
    }

    /// Keeps the trailing 20 bytes of a 32-byte digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest[32 - ADDRESS_LEN..]);
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("address must be {ADDRESS_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(digits).map_err(|e| AddressParseError::Hex(format!("{e}")))?;
        if raw.len() != ADDRESS_LEN {
            return Err(AddressParseError::Length(raw.len()));
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid amount {0:?}: expected base units or a decimal followed by \"unit\"")]
pub struct AmountParseError(String);

/// Parses `"250"` as base units and `"0.5 unit"` / `"2units"` as whole units.
pub fn parse_amount(text: &str) -> Result<Amount, AmountParseError> {
    let err = || AmountParseError(text.to_string());
    let trimmed = text.trim();
    let Some(number) = trimmed
        .strip_suffix("units")
        .or_else(|| trimmed.strip_suffix("unit"))
    else {
        return trimmed.parse().map_err(|_| err());
    };
    let number = number.trim();
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    const DECIMALS: usize = 18;
    if (whole.is_empty() && frac.is_empty()) || frac.len() > DECIMALS {
        return Err(err());
    }
    let whole: Amount = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| err())?
    };
    let frac_units: Amount = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<DECIMALS$}");
        padded.parse().map_err(|_| err())?
    };
    whole
        .checked_mul(UNIT)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(err)
}

/// Amounts travel as decimal strings in JSON; `u128` overflows most JSON readers.
pub(crate) mod serde_amount {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::{parse_amount, Amount};

    pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        parse_amount(&encoded).map_err(D::Error::custom)
    }
}
