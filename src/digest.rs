//! Digest engine.
//!
//! BLAKE3 is the only primitive. [`Digest`] is the 32-byte output; request and
//! result digests are domain separated so a request can never collide with a
//! result carrying the same bytes.

use std::fmt::{self, Display, Formatter};
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::version::{HASH_ALGORITHM_VERSION, HASH_PRIMITIVE};

pub const DIGEST_LEN: usize = 32;
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

/// Backend compiled into this build. The `blake3` crate is linked statically,
/// so there is no runtime fallback path.
pub const HASH_BACKEND: &str = "vendored";
/// Major line of the linked `blake3` crate.
pub const HASH_VERSION: &str = "1";

const REQUEST_DOMAIN: &[u8] = b"req:";
const RESULT_DOMAIN: &[u8] = b"res:";

/// Known-answer vectors checked by `doctor` and `validate-replacement`.
pub const TEST_VECTORS: &[(&str, &str)] = &[
    (
        "",
        "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262",
    ),
    (
        "hello",
        "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f",
    ),
];

/// A 32-byte BLAKE3 digest, displayed as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Hash raw content (CAS objects, stdout/stderr, output files).
    #[inline]
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest of canonical request bytes.
    #[must_use]
    pub fn of_request(canonical: &[u8]) -> Self {
        Self::with_domain(REQUEST_DOMAIN, canonical)
    }

    /// Digest of canonical result bytes.
    #[must_use]
    pub fn of_result(canonical: &[u8]) -> Self {
        Self::with_domain(RESULT_DOMAIN, canonical)
    }

    fn with_domain(domain: &[u8], data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain);
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    /// Streams a file through the hasher.
    pub fn of_file(path: &Path) -> Result<Self, DigestError> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DigestError> {
        if bytes.len() != DIGEST_LEN {
            return Err(DigestError::InvalidLength {
                expected: DIGEST_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// First 16 hex characters, for log lines and derived ids.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DigestError::InvalidLength {
                expected: DIGEST_HEX_LEN,
                actual: s.len(),
            });
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DigestError::NotLowercaseHex);
        }
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("invalid digest length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("digest must be lowercase hex")]
    NotLowercaseHex,

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("I/O error while hashing: {0}")]
    Io(#[from] std::io::Error),
}

/// Which primitive and backend produced a digest. Stored next to every result
/// so a consumer can refuse to compare digests from different backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestInfo {
    pub hash_primitive: String,
    pub hash_backend: String,
    pub hash_algorithm_version: u32,
}

impl DigestInfo {
    pub fn current() -> Self {
        Self {
            hash_primitive: HASH_PRIMITIVE.to_string(),
            hash_backend: HASH_BACKEND.to_string(),
            hash_algorithm_version: HASH_ALGORITHM_VERSION,
        }
    }

    pub fn is_comparable_with(&self, other: &DigestInfo) -> bool {
        self == other
    }
}

impl Default for DigestInfo {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HashHealth {
    pub hash_primitive: &'static str,
    pub hash_backend: &'static str,
    pub hash_version: &'static str,
    pub hash_available: bool,
    pub compat_warning: bool,
}

/// Runtime facts about the hashing backend.
pub fn hash_health() -> HashHealth {
    let available = self_test();
    HashHealth {
        hash_primitive: HASH_PRIMITIVE,
        hash_backend: HASH_BACKEND,
        hash_version: HASH_VERSION,
        hash_available: available,
        compat_warning: !available || HASH_BACKEND != "vendored",
    }
}

/// Runs the known-answer vectors.
pub fn self_test() -> bool {
    TEST_VECTORS
        .iter()
        .all(|(input, expected)| Digest::of(input.as_bytes()).to_hex() == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert!(self_test());
        assert_eq!(
            Digest::of(b"hello").to_string(),
            "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f"
        );
    }

    #[test]
    fn test_domains_differ() {
        let bytes = b"{\"a\":1}";
        assert_ne!(Digest::of_request(bytes), Digest::of_result(bytes));
        assert_ne!(Digest::of_request(bytes), Digest::of(bytes));
    }

    #[test]
    fn test_parse_roundtrip() {
        let d = Digest::of(b"payload");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "abc".parse::<Digest>(),
            Err(DigestError::InvalidLength { .. })
        ));
        let upper = Digest::of(b"x").to_string().to_uppercase();
        assert!(matches!(
            upper.parse::<Digest>(),
            Err(DigestError::NotLowercaseHex)
        ));
        let not_hex = "g".repeat(DIGEST_HEX_LEN);
        assert!(not_hex.parse::<Digest>().is_err());
    }

    #[test]
    fn test_of_file_matches_of() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"file contents").unwrap();
        assert_eq!(Digest::of_file(&path).unwrap(), Digest::of(b"file contents"));
    }

    #[test]
    fn test_health_is_clean() {
        let h = hash_health();
        assert_eq!(h.hash_primitive, "blake3");
        assert_eq!(h.hash_backend, "vendored");
        assert!(h.hash_available);
        assert!(!h.compat_warning);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let d = Digest::of(b"s");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
