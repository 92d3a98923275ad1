//! API key scope masks and key kinds.
//!
//! A key's access mask is a bitfield of external API scopes. Minimum and
//! application requirements are thresholds on the raw value; recommendations
//! are scope sets and need every recommended bit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bitmask of external API scopes granted by a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMask(pub u64);

impl KeyMask {
    /// A mask granting nothing.
    pub const EMPTY: Self = Self(0);

    /// Create a mask from raw bits.
    #[must_use]
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Check whether this mask grants every scope in `required`.
    #[must_use]
    pub const fn has_access(self, required: Self) -> bool {
        self.0 & required.0 == required.0
    }

    /// Check whether this mask reaches the `minimum` threshold.
    #[must_use]
    pub const fn meets(self, minimum: Self) -> bool {
        self.0 >= minimum.0
    }
}

impl fmt::Display for KeyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for KeyMask {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

/// Kind of API key, as reported by the key authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Key scoped to a single character.
    Character,
    /// Key covering every character on an account.
    Account,
    /// Corporation key.
    Corporation,
}

impl KeyKind {
    /// Check whether a key of this kind can stand in for `required`.
    ///
    /// Account keys cover everything a Character key covers, so they are
    /// accepted wherever a Character key is asked for.
    #[must_use]
    pub fn satisfies(self, required: Self) -> bool {
        self == required || (required == Self::Character && self == Self::Account)
    }

    /// Whether this kind of key may prove ownership of several identities.
    #[must_use]
    pub fn is_multi_identity(self) -> bool {
        !matches!(self, Self::Character)
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Character => write!(f, "Character"),
            Self::Account => write!(f, "Account"),
            Self::Corporation => write!(f, "Corporation"),
        }
    }
}

/// Error returned when parsing an unknown key kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown key kind: {0}")]
pub struct KeyKindParseError(pub String);

impl FromStr for KeyKind {
    type Err = KeyKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "character" => Ok(Self::Character),
            "account" => Ok(Self::Account),
            "corporation" => Ok(Self::Corporation),
            _ => Err(KeyKindParseError(s.to_string())),
        }
    }
}
