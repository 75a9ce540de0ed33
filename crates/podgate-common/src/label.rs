//! Pod labels
//!
//! A label is the lowercase base32 rendering of a manifest's SHA-256 digest.
//! It is the pod's id, the registry key, and the first path segment the
//! proxy routes on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Exact length of a pod label
pub const LABEL_LEN: usize = 52;

/// Label alphabet: `[a-zA-Z2-7]`
#[inline]
pub fn is_label_char(b: u8) -> bool {
    b.is_ascii_alphabetic() || (b'2'..=b'7').contains(&b)
}

/// True if `s` is exactly one well-formed label
pub fn is_label(s: &str) -> bool {
    s.len() == LABEL_LEN && s.bytes().all(is_label_char)
}

/// Rejected label
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pod label: {0:?}")]
pub struct LabelError(pub String);

/// Validated pod label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodLabel(String);

impl PodLabel {
    /// Validate and wrap a label
    pub fn parse(s: impl Into<String>) -> Result<Self, LabelError> {
        let s = s.into();
        if is_label(&s) {
            Ok(Self(s))
        } else {
            Err(LabelError(s))
        }
    }

    /// Label for a SHA-256 digest
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(data_encoding::BASE32_NOPAD.encode(digest).to_ascii_lowercase())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PodLabel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PodLabel {
    type Error = LabelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<PodLabel> for String {
    fn from(label: PodLabel) -> Self {
        label.0
    }
}
