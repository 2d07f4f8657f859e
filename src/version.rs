//! Version id strategies
//!
//! Versions are content-addressed: the id is the hex SHA-256 of the
//! plaintext. Hashing a local file is deferred until the id is first asked
//! for and then cached, since probes and writes both need it.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;

use crate::crypto;
use crate::providers::DriveError;

const HASH_READ_SIZE: usize = 64 * 1024;

pub enum VersionStrategy {
    /// Id is the SHA-256 of the content, computed from `source` on first use
    ContentHash {
        source: Option<PathBuf>,
        hash: OnceCell<String>,
    },
    /// Caller-chosen id; no content hash is recorded
    Fixed(String),
}

impl VersionStrategy {
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        VersionStrategy::ContentHash {
            source: Some(path.into()),
            hash: OnceCell::new(),
        }
    }

    pub fn for_bytes(data: &[u8]) -> Self {
        VersionStrategy::ContentHash {
            source: None,
            hash: OnceCell::new_with(Some(crypto::sha256_hex(data))),
        }
    }

    pub fn fixed(id: impl Into<String>) -> Self {
        VersionStrategy::Fixed(id.into())
    }

    pub async fn version_id(&self) -> Result<String, DriveError> {
        match self {
            VersionStrategy::Fixed(id) => Ok(id.clone()),
            VersionStrategy::ContentHash { .. } => {
                self.content_hash().await?.ok_or_else(|| {
                    DriveError::InvalidConfig("Content hash strategy without content".into())
                })
            }
        }
    }

    /// Hex SHA-256 of the content, `None` for fixed ids
    pub async fn content_hash(&self) -> Result<Option<String>, DriveError> {
        match self {
            VersionStrategy::Fixed(_) => Ok(None),
            VersionStrategy::ContentHash { source, hash } => {
                let value = hash
                    .get_or_try_init(|| async {
                        match source {
                            Some(path) => hash_file(path).await,
                            None => Err(DriveError::InvalidConfig(
                                "Content hash strategy without content".into(),
                            )),
                        }
                    })
                    .await?;
                Ok(Some(value.clone()))
            }
        }
    }
}

/// Streaming SHA-256 of a local file
pub async fn hash_file(path: &Path) -> Result<String, DriveError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
