//! Checksum verification for downloaded artifacts.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Buffer size for reading chunks while hashing.
const HASH_BUFFER_SIZE: usize = 8192;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl FromStr for HashAlgorithm {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(UpdateError::InvalidInput(format!(
                "unsupported hash algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Hash a file, returning lowercase hex.
pub async fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String, UpdateError> {
    match algorithm {
        HashAlgorithm::Sha256 => digest_file::<Sha256>(path).await,
        HashAlgorithm::Sha512 => digest_file::<Sha512>(path).await,
    }
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String, UpdateError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file's digest with `expected_hex` (case-insensitive).
///
/// IO failures count as a mismatch.
pub async fn verify_file(path: &Path, expected_hex: &str, algorithm: HashAlgorithm) -> bool {
    let actual = match compute_file_hash(path, algorithm).await {
        Ok(actual) => actual,
        Err(e) => {
            warn!("Cannot hash {:?}: {}", path, e);
            return false;
        }
    };

    let expected = expected_hex.trim().to_ascii_lowercase();
    let matches: bool = actual.as_bytes().ct_eq(expected.as_bytes()).into();
    debug!(
        "{} verification of {:?}: {}",
        algorithm,
        path,
        if matches { "ok" } else { "mismatch" }
    );
    matches
}
