use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BidsError;

macro_rules! source_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

source_key!(
    /// Raw subject identifier, the last `-` token of an extracted archive directory.
    SubjectKey
);
source_key!(
    /// Raw session directory name.
    SessionKey
);
source_key!(
    /// Raw scan directory name (`mr_<id>`).
    ScanKey
);

/// Canonical BIDS sequence number, rendered zero-padded to four digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BidsIndex(u32);

impl BidsIndex {
    pub const FIRST: BidsIndex = BidsIndex(1);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BidsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0>4}", self.0)
    }
}

impl FromStr for BidsIndex {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(BidsError::InvalidIdentity(value.to_string()));
        }
        trimmed
            .parse::<u32>()
            .map(Self)
            .map_err(|_| BidsError::InvalidIdentity(value.to_string()))
    }
}

impl TryFrom<String> for BidsIndex {
    type Error = BidsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BidsIndex> for String {
    fn from(value: BidsIndex) -> Self {
        value.to_string()
    }
}

/// Hands out `0001, 0002, ...` in call order.
#[derive(Debug, Clone, Copy)]
pub struct Sequence {
    next: BidsIndex,
}

impl Sequence {
    pub fn new() -> Self {
        Self {
            next: BidsIndex::FIRST,
        }
    }

    pub fn advance(&mut self) -> BidsIndex {
        let current = self.next;
        self.next = current.next();
        current
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Full identity of one scan inside the mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanIdentity {
    pub subject: SubjectKey,
    pub session: SessionKey,
    pub scan: ScanKey,
}

impl ScanIdentity {
    /// Recovers an identity from a `<site>-<subject>/<session>/<scan>` relative path.
    pub fn from_series_dir(series_dir: &str) -> Result<Self, BidsError> {
        let parts = series_dir
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        if parts.len() != 3 {
            return Err(BidsError::InvalidIdentity(series_dir.to_string()));
        }
        let subject = parts[0]
            .rsplit('-')
            .next()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BidsError::InvalidIdentity(series_dir.to_string()))?;
        Ok(Self {
            subject: SubjectKey::from(subject),
            session: SessionKey::from(parts[1]),
            scan: ScanKey::from(parts[2]),
        })
    }
}

impl fmt::Display for ScanIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.session, self.scan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionTool {
    Dcm2niix,
    Dimon,
}

impl fmt::Display for ConversionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionTool::Dcm2niix => write!(f, "dcm2niix"),
            ConversionTool::Dimon => write!(f, "dimon"),
        }
    }
}

impl FromStr for ConversionTool {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dcm2niix" => Ok(ConversionTool::Dcm2niix),
            "dimon" => Ok(ConversionTool::Dimon),
            _ => Err(BidsError::UnsupportedTool(value.to_string())),
        }
    }
}

/// Name of an image with every extension after the first dot removed.
pub fn clean_name(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}
