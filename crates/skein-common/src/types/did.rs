use crate::types::string::StrError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// A decentralized identifier, the permanent id of a repository's account.
///
/// Only the generic DID syntax is checked; method-specific rules are left to
/// resolvers.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID validation per the AT Protocol DID syntax.
///
/// Allows `%` in the identifier but not as the final character. Percent
/// escapes are not checked for well-formedness.
pub static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

/// Longest DID accepted
pub const MAX_DID_LEN: usize = 2048;

impl Did {
    /// Parse and validate a DID
    pub fn new(did: impl AsRef<str>) -> Result<Self, StrError> {
        let did = did.as_ref();
        if did.len() > MAX_DID_LEN {
            Err(StrError::too_long("did", did, MAX_DID_LEN, did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(StrError::regex("did", did, SmolStr::new_static("invalid")))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// The DID method, e.g. `plc` or `web`
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = StrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}", self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl From<Did> for SmolStr {
    fn from(value: Did) -> Self {
        value.0
    }
}
