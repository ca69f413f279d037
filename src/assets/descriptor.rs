//! Asset identity: checksums and descriptors
//!
//! An asset is identified by the digest of its content, never by the URL it
//! happens to be served from.

use std::fmt;
use std::hash::{Hash, Hasher as _};
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};

use crate::common::{Error, Result};

/// Digest algorithm, inferred from the length of the hex checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Start an incremental hash
    pub fn hasher(self) -> ContentHasher {
        match self {
            Self::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Self::Sha512 => ContentHasher::Sha512(Sha512::new()),
        }
    }
}

/// Incremental hasher fed while bytes stream in
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Sha512(h) => h.update(bytes),
        }
    }

    /// Finish and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Expected content digest of an asset, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(String);

impl Checksum {
    /// Parse a hex digest; 64 characters is SHA-256, 128 is SHA-512
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value.trim().to_ascii_lowercase();
        let valid_len = hex.len() == 64 || hex.len() == 128;
        if !valid_len || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidChecksum(value.to_string()));
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        if self.0.len() == 128 {
            DigestAlgorithm::Sha512
        } else {
            DigestAlgorithm::Sha256
        }
    }

    /// Hash a file on disk with this checksum's algorithm (blocking)
    pub fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        hash_file(path, self.algorithm())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stream a file through a hasher without loading it whole (blocking)
pub fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// A remote artifact: where to get it and what it must hash to
///
/// Equality and hashing use the checksum only, so two descriptors that
/// point at mirrors of the same file are the same asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawDescriptor")]
pub struct AssetDescriptor {
    pub url: String,
    pub checksum: Checksum,
}

impl AssetDescriptor {
    pub fn new(url: impl Into<String>, checksum: &str) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            checksum: Checksum::parse(checksum)?,
        })
    }

    /// Last path segment of the URL, for log messages
    pub fn file_name(&self) -> &str {
        self.url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.url)
    }
}

impl PartialEq for AssetDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.checksum == other.checksum
    }
}

impl Eq for AssetDescriptor {}

impl Hash for AssetDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.checksum.hash(state);
    }
}

/// On-disk spelling of a descriptor: `url` plus one of `sha256`/`sha512`/`checksum`
#[derive(Deserialize)]
struct RawDescriptor {
    url: String,
    #[serde(alias = "sha256", alias = "sha512")]
    checksum: String,
}

impl TryFrom<RawDescriptor> for AssetDescriptor {
    type Error = Error;

    fn try_from(raw: RawDescriptor) -> Result<Self> {
        Self::new(raw.url, &raw.checksum)
    }
}

/// Lifecycle of an asset inside one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    NotFetched,
    Fetching,
    Verified,
    Corrupt,
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFetched => write!(f, "not fetched"),
            Self::Fetching => write!(f, "fetching"),
            Self::Verified => write!(f, "verified"),
            Self::Corrupt => write!(f, "corrupt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_checksum_algorithm_from_length() {
        let c = Checksum::parse(EMPTY_SHA256).unwrap();
        assert_eq!(c.algorithm(), DigestAlgorithm::Sha256);

        let c = Checksum::parse(&"ab".repeat(64)).unwrap();
        assert_eq!(c.algorithm(), DigestAlgorithm::Sha512);
    }

    #[test]
    fn test_checksum_normalizes_case() {
        let c = Checksum::parse(&EMPTY_SHA256.to_uppercase()).unwrap();
        assert_eq!(c.as_str(), EMPTY_SHA256);
    }

    #[test]
    fn test_checksum_rejects_garbage() {
        assert!(matches!(
            Checksum::parse("abc"),
            Err(Error::InvalidChecksum(_))
        ));
        assert!(Checksum::parse(&"zz".repeat(32)).is_err());
        assert!(Checksum::parse(&"a".repeat(96)).is_err());
    }

    #[test]
    fn test_descriptor_identity_is_checksum() {
        let a = AssetDescriptor::new("http://one.example/k.deb", EMPTY_SHA256).unwrap();
        let b = AssetDescriptor::new("http://mirror.example/other.deb", EMPTY_SHA256).unwrap();
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_descriptor_from_yaml() {
        let d: AssetDescriptor = serde_yaml::from_str(&format!(
            "url: http://example.com/rootfs.cpio.gz\nsha256: {}\n",
            EMPTY_SHA256
        ))
        .unwrap();
        assert_eq!(d.file_name(), "rootfs.cpio.gz");
        assert_eq!(d.checksum.as_str(), EMPTY_SHA256);

        let bad: std::result::Result<AssetDescriptor, _> =
            serde_yaml::from_str("url: http://example.com/x\nsha256: nothex\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_hash_file_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(hash_file(&path, DigestAlgorithm::Sha256).unwrap(), EMPTY_SHA256);
    }
}
