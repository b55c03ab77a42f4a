//! Digest helpers.
//!
//! The engine works with two digest algorithms: MD5 for per-piece hashes
//! and declared task digests, SHA-256 for task fingerprints and the
//! aggregate piece signature. [`DigestAccumulator`] hides the choice behind
//! one incremental interface so the cache detector can hand its partially
//! fed hasher to a resumed fetch.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed digest value: {0}")]
    Malformed(String),
}

/// Digest algorithms understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn parse(name: &str) -> Result<Self, DigestError> {
        match name {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

/// A declared digest in `algo:hex` form, e.g. `md5:9e107d9d372bb6826bd81d3542a419d6`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl DeclaredDigest {
    pub fn parse(value: &str) -> Result<Self, DigestError> {
        let (algo, hex) = value
            .split_once(':')
            .ok_or_else(|| DigestError::Malformed(value.to_string()))?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigestError::Malformed(value.to_string()));
        }
        Ok(Self {
            algorithm: DigestAlgorithm::parse(algo)?,
            hex: hex.to_ascii_lowercase(),
        })
    }

}

impl std::fmt::Display for DeclaredDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Incremental hasher over either supported algorithm.
///
/// Created once per trigger and threaded through cache detection and the
/// rate-limited origin reader, so the final source digest covers the
/// verified cached prefix plus the freshly fetched remainder.
pub enum DigestAccumulator {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl DigestAccumulator {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// MD5 of a byte slice as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// SHA-256 over the concatenation of the given string parts, as lowercase hex.
///
/// Used for task fingerprints and for the aggregate piece signature (the
/// per-piece hex digests concatenated in index order).
pub fn sha256_hex_concat<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}
