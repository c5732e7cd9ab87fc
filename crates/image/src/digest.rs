use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};

/// Represents a content-addressable digest (e.g., "sha256:abc123...")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hash: String,
}

impl Digest {
    /// Parse a digest string in format "algorithm:hash"
    pub fn parse(digest: &str) -> Result<Self> {
        let (algorithm, hash) = digest.split_once(':').with_context(|| {
            format!(
                "Invalid digest format (expected 'algorithm:hash'): {}",
                digest
            )
        })?;

        if algorithm.is_empty() || hash.is_empty() {
            anyhow::bail!("Invalid digest format (empty component): {}", digest);
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid digest hash (expected hex): {}", digest);
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hash.to_ascii_lowercase(),
        })
    }

    /// sha256 digest of `bytes`
    pub fn sha256(bytes: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hash: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Get the algorithm part (e.g., "sha256")
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Get the hash part
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Short form used in logs
    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }

    /// Convert digest to blob storage path within an OCI layout directory
    pub fn to_blob_path(&self, layout_dir: &Path) -> PathBuf {
        layout_dir
            .join("blobs")
            .join(&self.algorithm)
            .join(&self.hash)
    }

    /// Check `bytes` against this digest. Only sha256 is supported.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        self.algorithm == "sha256" && Self::sha256(bytes).hash == self.hash
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl std::str::FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
