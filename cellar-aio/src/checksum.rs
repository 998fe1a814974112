// cellar-aio/src/checksum.rs
use std::path::Path;

use cellar_common::error::{CellarError, FetchErrorKind, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Hex sha256 of a file, read asynchronously.
pub async fn sha256_file_async(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = Vec::with_capacity(64 * 1024);
    let mut total_bytes_read = 0u64;

    loop {
        buffer.clear();
        let n = file.read_buf(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total_bytes_read += n as u64;
    }

    let actual = hex::encode(hasher.finalize());
    debug!(
        "Calculated SHA256 of {}: {} ({} bytes read)",
        path.display(),
        actual,
        total_bytes_read
    );
    Ok(actual)
}

/// Compares case-insensitively; a mismatch is a fetch error against `url`.
pub async fn verify_checksum_async(path: &Path, expected: &str, url: &str) -> Result<()> {
    let actual = sha256_file_async(path).await?;
    debug!("Expected SHA256:   {}", expected);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CellarError::fetch(
            FetchErrorKind::ChecksumMismatch,
            url,
            format!("expected {expected}, got {actual}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello\n")
    const HELLO: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[tokio::test]
    async fn matches_ignoring_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "hello\n").unwrap();
        verify_checksum_async(&path, &HELLO.to_uppercase(), "file:///f")
            .await
            .unwrap();
        assert_eq!(sha256_file_async(&path).await.unwrap(), HELLO);
    }

    #[tokio::test]
    async fn mismatch_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "tampered\n").unwrap();
        let err = verify_checksum_async(&path, HELLO, "https://example.org/f")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CellarError::Fetch {
                kind: FetchErrorKind::ChecksumMismatch,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 2);
    }
}
