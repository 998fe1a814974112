// cellar-net/src/http.rs
use std::path::{Path, PathBuf};

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::{CellarError, FetchErrorKind, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::fs::File as TokioFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::validation::{file_url_path, validate_url};

const USER_AGENT_STRING: &str = concat!("cellar/", env!("CARGO_PKG_VERSION"), " (Rust)");
const READ_CHUNK: usize = 64 * 1024;

/// A verified file in the download cache.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub path: PathBuf,
    /// The URL the bytes came from; `None` when the cache already held them.
    pub url: Option<String>,
    pub size_bytes: u64,
}

impl Downloaded {
    pub fn from_cache(&self) -> bool {
        self.url.is_none()
    }
}

pub fn build_http_client(config: &Config) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(config.fetch_timeout)
        .connect_timeout(config.connect_timeout)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| CellarError::Generic(format!("Failed to build HTTP client: {e}")))
}

/// Fetches `url` (falling back to `mirrors` in order) into the download
/// cache under `owner` and checks it against `sha256_expected`.
///
/// A cached copy is re-verified before reuse and discarded when corrupt.
/// Every attempt downloads into its own temporary file that is only renamed
/// into the cache once the digest matches, so a mismatching or half-written
/// file is never visible to callers, even with concurrent fetches of the
/// same URL. A checksum mismatch stops the fallback chain; network failures
/// move on to the next mirror.
pub async fn fetch_to_cache(
    owner: &str,
    url: &str,
    sha256_expected: &str,
    mirrors: &[String],
    config: &Config,
    cache: &Cache,
) -> Result<Downloaded> {
    let cache_path = cache.download_path(owner, url);
    debug!(
        "Preparing to fetch '{}' from {} into {}",
        owner,
        url,
        cache_path.display()
    );

    if cache_path.is_file() {
        match sha256_of(&cache_path).await {
            Ok(actual) if actual.eq_ignore_ascii_case(sha256_expected) => {
                debug!("Using valid cached file: {}", cache_path.display());
                let size_bytes = tokio::fs::metadata(&cache_path).await?.len();
                return Ok(Downloaded {
                    path: cache_path,
                    url: None,
                    size_bytes,
                });
            }
            Ok(actual) => {
                debug!(
                    "Cached file {} has digest {}, expected {}. Redownloading.",
                    cache_path.display(),
                    actual,
                    sha256_expected
                );
                if let Err(e) = cache.clear_file(&cache_path) {
                    warn!("Failed to remove corrupt cached file {}: {}", cache_path.display(), e);
                }
            }
            Err(e) => debug!("Could not hash cached file {}: {}", cache_path.display(), e),
        }
    }

    tokio::fs::create_dir_all(cache.get_dir()).await?;
    let client = build_http_client(config)?;

    let urls_to_try = std::iter::once(url).chain(mirrors.iter().map(String::as_str));
    let mut last_error: Option<CellarError> = None;
    for current_url in urls_to_try {
        let parsed = validate_url(current_url)?;
        debug!("Attempting download from: {}", current_url);
        let attempt = if parsed.scheme() == "file" {
            copy_and_verify(&file_url_path(&parsed)?, current_url, &cache_path, sha256_expected).await
        } else {
            download_and_verify(&client, current_url, &cache_path, sha256_expected).await
        };
        match attempt {
            Ok(size_bytes) => {
                debug!("Downloaded and verified {}", cache_path.display());
                return Ok(Downloaded {
                    path: cache_path,
                    url: Some(current_url.to_string()),
                    size_bytes,
                });
            }
            Err(e @ CellarError::Fetch { kind: FetchErrorKind::ChecksumMismatch, .. }) => {
                error!("{}", e);
                return Err(e);
            }
            Err(e) => {
                error!("Download attempt failed from {}: {}", current_url, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        CellarError::fetch(FetchErrorKind::Network, url, "all download attempts failed")
    }))
}

/// A fresh, uniquely named file next to `final_path`. Removed on drop
/// unless persisted.
fn temp_file_for(final_path: &Path) -> Result<TempPath> {
    let dir = final_path.parent().ok_or_else(|| {
        CellarError::Generic(format!("Cannot get parent directory for {}", final_path.display()))
    })?;
    let file_name = final_path.file_name().unwrap_or_default().to_string_lossy();
    let temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".download")
        .tempfile_in(dir)?;
    Ok(temp.into_temp_path())
}

fn classify(url: &str, e: &reqwest::Error) -> CellarError {
    let kind = if e.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::Network
    };
    CellarError::fetch(kind, url, e.to_string())
}

async fn download_and_verify(
    client: &Client,
    url: &str,
    final_path: &Path,
    sha256_expected: &str,
) -> Result<u64> {
    let response = client.get(url).send().await.map_err(|e| {
        debug!("HTTP request failed for {url}: {e}");
        classify(url, &e)
    })?;
    let status = response.status();
    debug!("Received HTTP status: {} for {}", status, url);
    if !status.is_success() {
        let message = match status {
            StatusCode::NOT_FOUND => "resource not found (404)".to_string(),
            StatusCode::FORBIDDEN => "access forbidden (403)".to_string(),
            other => format!("HTTP status {other}"),
        };
        return Err(CellarError::fetch(FetchErrorKind::Network, url, message));
    }

    let temp_path = temp_file_for(final_path)?;
    debug!("Downloading to temporary path: {}", temp_path.display());
    let mut file = TokioFile::create(&temp_path).await?;
    let mut hasher = Sha256::new();
    let mut size_bytes: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return Err(classify(url, &e)),
        };
        hasher.update(&chunk);
        size_bytes += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    finish(temp_path, final_path, url, sha256_expected, hasher)?;
    Ok(size_bytes)
}

async fn copy_and_verify(
    source: &Path,
    url: &str,
    final_path: &Path,
    sha256_expected: &str,
) -> Result<u64> {
    let mut input = TokioFile::open(source).await.map_err(|e| {
        CellarError::fetch(FetchErrorKind::Network, url, format!("cannot open {}: {e}", source.display()))
    })?;
    let temp_path = temp_file_for(final_path)?;
    let mut output = TokioFile::create(&temp_path).await?;
    let mut hasher = Sha256::new();
    let mut size_bytes: u64 = 0;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
        output.write_all(&buf[..n]).await?;
    }
    output.flush().await?;
    drop(output);

    finish(temp_path, final_path, url, sha256_expected, hasher)?;
    Ok(size_bytes)
}

fn finish(
    temp_path: TempPath,
    final_path: &Path,
    url: &str,
    sha256_expected: &str,
    hasher: Sha256,
) -> Result<()> {
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(sha256_expected) {
        return Err(CellarError::fetch(
            FetchErrorKind::ChecksumMismatch,
            url,
            format!("expected {sha256_expected}, got {actual}"),
        ));
    }
    temp_path.persist(final_path).map_err(|e| {
        error!(
            "Failed to move {} to {}: {}",
            e.path.display(),
            final_path.display(),
            e.error
        );
        CellarError::from(e.error)
    })
}

async fn sha256_of(path: &Path) -> Result<String> {
    let mut file = TokioFile::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
