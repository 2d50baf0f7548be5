//! Document revisions
//!
//! Provides [`Revision`], the 32-byte content digest of a protocol document's
//! canonical bytes. Revisions are the optimistic-lock token drafts are pinned
//! to.

use crate::canonical::canonical_bytes;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

const UNKNOWN_TEXT: &str = "unknown";

/// A 32-byte content digest (Blake3) of a document's canonical bytes
///
/// The all-zero digest is the sentinel [`Revision::UNKNOWN`] token used for
/// drafts created before revision tracking existed. It displays and
/// serializes as `"unknown"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision([u8; 32]);

impl Revision {
    /// Sentinel for "revision not known"
    pub const UNKNOWN: Self = Self([0; 32]);

    /// Create a revision from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Underlying digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create revision from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RevisionError> {
        if bytes.len() != 32 {
            return Err(RevisionError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Compute the revision of a document
    ///
    /// Pure function of canonical content: key order and whitespace of the
    /// source text never matter, any value change does.
    #[must_use]
    pub fn compute(document: &Value) -> Self {
        Self::compute_bytes(&canonical_bytes(document))
    }

    /// Digest of already-canonical bytes
    #[inline]
    #[must_use]
    pub fn compute_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Short string representation (first 16 hex chars)
    #[must_use]
    pub fn short(&self) -> String {
        if self.is_unknown() {
            return UNKNOWN_TEXT.to_string();
        }
        hex::encode(&self.0[..8])
    }

    /// Check for the sentinel token
    #[inline]
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        let mut i = 0;
        while i < 32 {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str(UNKNOWN_TEXT)
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == UNKNOWN_TEXT {
            return Ok(Self::UNKNOWN);
        }
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl serde::Serialize for Revision {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Revision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct RevisionVisitor;

        impl serde::de::Visitor<'_> for RevisionVisitor {
            type Value = Revision;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 64-char hex revision or \"unknown\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Revision::UNKNOWN)
            }
        }

        deserializer.deserialize_any(RevisionVisitor)
    }
}

/// Errors that can occur when parsing revisions
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    /// Invalid digest length
    #[error("invalid revision length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
