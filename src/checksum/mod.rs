//! Streaming MD5 + SHA-256 digests over files and in-memory buffers.

use crate::common::error::{Result, TransferError};
use md5::Digest as _;
use sha2::Digest as _;
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUF_SIZE: usize = 256 * 1024;

/// Hex-encoded MD5 and SHA-256 of a file, computed in a single streaming
/// pass, plus the byte count read.
pub async fn digest_file(path: &Path) -> Result<(String, String, u64)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::Internal(e.into()))?;

    let mut md5 = md5::Md5::new();
    let mut sha256 = sha2::Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::Internal(e.into()))?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hex::encode(md5.finalize()), hex::encode(sha256.finalize()), size))
}

/// Hex-encoded MD5 of an in-memory buffer, for quick per-chunk checks.
pub fn digest_buffer(bytes: &[u8]) -> String {
    let mut md5 = md5::Md5::new();
    md5.update(bytes);
    hex::encode(md5.finalize())
}

/// Both digests of an in-memory buffer in one pass, for the chunk-ack path
/// where a caller already wants both without re-reading the buffer.
pub fn digest_buffer_both(bytes: &[u8]) -> (String, String) {
    let mut md5 = md5::Md5::new();
    let mut sha256 = sha2::Sha256::new();
    md5.update(bytes);
    sha256.update(bytes);
    (hex::encode(md5.finalize()), hex::encode(sha256.finalize()))
}

/// Verifies a file's digests, case-insensitively. Either digest may be
/// omitted; a missing one is skipped rather than treated as a mismatch. If
/// both are provided both must match.
pub async fn verify_file(path: &Path, md5_expected: Option<&str>, sha256_expected: Option<&str>) -> Result<bool> {
    if md5_expected.is_none() && sha256_expected.is_none() {
        return Ok(true);
    }
    let (md5_actual, sha256_actual, _size) = digest_file(path).await?;

    if let Some(expected) = md5_expected {
        if !expected.eq_ignore_ascii_case(&md5_actual) {
            return Ok(false);
        }
    }
    if let Some(expected) = sha256_expected {
        if !expected.eq_ignore_ascii_case(&sha256_actual) {
            return Ok(false);
        }
    }
    Ok(true)
}
