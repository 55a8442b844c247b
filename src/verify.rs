//! File verification against provider-published digests.

use crate::error::DumpError;
use crate::types::{Checksum, ChecksumAlgorithm};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Incremental digest over one of the supported algorithms.
pub(crate) enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub(crate) fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub(crate) fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => format!("{:x}", h.finalize()),
            Hasher::Sha1(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Computes the digest of a local file.
///
/// The file is read in 1MB chunks on a blocking task, so neither memory use
/// nor the async runtime depends on file size.
pub async fn compute_file_digest(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<String, DumpError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Hasher::new(algorithm);
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finalize_hex())
    })
    .await
    .map_err(|e| DumpError::Io(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Verifies a local file against its expected digest.
///
/// # Returns
///
/// `Ok(true)` on a match and `Ok(false)` on a mismatch. A missing digest is
/// reported as [`DumpError::ChecksumUnavailable`], which callers treat as a
/// warning rather than a failure.
pub async fn verify(path: &Path, expected: Option<&Checksum>) -> Result<bool, DumpError> {
    let file_display_name = display_name(path);

    let expected = match expected {
        Some(expected) => expected,
        None => return Err(DumpError::ChecksumUnavailable(file_display_name)),
    };

    let actual = compute_file_digest(path, expected.algorithm).await?;
    if actual.eq_ignore_ascii_case(&expected.hex) {
        info!("✅ Checksum verified for {}", file_display_name);
        Ok(true)
    } else {
        warn!(
            "❌ Checksum mismatch for {}: expected {}, got {}",
            file_display_name, expected.hex, actual
        );
        Ok(false)
    }
}

/// Like [`verify`], but turns a mismatch into [`DumpError::ChecksumMismatch`]
/// and a missing digest into a logged warning.
pub async fn ensure_verified(path: &Path, expected: Option<&Checksum>) -> Result<(), DumpError> {
    let file_display_name = display_name(path);

    let expected = match expected {
        Some(expected) => expected,
        None => {
            warn!(
                "⚠️  {}; accepting file unverified",
                DumpError::ChecksumUnavailable(file_display_name)
            );
            return Ok(());
        }
    };

    let actual = compute_file_digest(path, expected.algorithm).await?;
    if actual.eq_ignore_ascii_case(&expected.hex) {
        info!("✅ Checksum verified for {}", file_display_name);
        Ok(())
    } else {
        Err(DumpError::ChecksumMismatch {
            file: file_display_name,
            expected: expected.hex.clone(),
            actual,
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}
