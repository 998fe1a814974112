// cellar-net/src/validation.rs
use std::path::PathBuf;

use cellar_common::error::{CellarError, FetchErrorKind, Result};
use tracing::warn;
use url::Url;

/// Checks a download URL. `https` and `file` are accepted, `http` is
/// accepted with a warning, anything else is an unsupported protocol.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| {
        CellarError::fetch(
            FetchErrorKind::UnsupportedProtocol,
            url_str,
            format!("not a valid URL: {e}"),
        )
    })?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        "http" => {
            warn!("Downloading {} over plain http", url_str);
            Ok(url)
        }
        other => Err(CellarError::fetch(
            FetchErrorKind::UnsupportedProtocol,
            url_str,
            format!("scheme '{other}' is not supported"),
        )),
    }
}

/// Checks a VCS head URL: the download schemes plus `ssh`, `git` and
/// absolute local paths.
pub fn validate_vcs_url(url_str: &str) -> Result<()> {
    if url_str.starts_with('/') {
        return Ok(());
    }
    match Url::parse(url_str) {
        Ok(url) if matches!(url.scheme(), "ssh" | "git") => Ok(()),
        Ok(_) => validate_url(url_str).map(|_| ()),
        Err(e) => Err(CellarError::fetch(
            FetchErrorKind::UnsupportedProtocol,
            url_str,
            format!("not a valid repository URL: {e}"),
        )),
    }
}

/// Local path of a `file://` URL.
pub fn file_url_path(url: &Url) -> Result<PathBuf> {
    url.to_file_path().map_err(|_| {
        CellarError::fetch(
            FetchErrorKind::UnsupportedProtocol,
            url.as_str(),
            "file URL does not name a local path",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_policy() {
        assert!(validate_url("https://www.nektar.info/src/nektar-v5.2.0.tar.bz2").is_ok());
        assert!(validate_url("http://mirror.example.org/x.tar.gz").is_ok());
        assert!(validate_url("file:///srv/mirror/x.tar.gz").is_ok());
        let err = validate_url("ftp://example.org/x.tar.gz").unwrap_err();
        assert!(matches!(
            err,
            CellarError::Fetch {
                kind: FetchErrorKind::UnsupportedProtocol,
                ..
            }
        ));
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn vcs_urls() {
        assert!(validate_vcs_url("https://gitlab.nektar.info/nektar/nektar.git").is_ok());
        assert!(validate_vcs_url("ssh://git@example.org/x.git").is_ok());
        assert!(validate_vcs_url("/srv/git/nektar").is_ok());
        assert!(validate_vcs_url("ftp://example.org/x.git").is_err());
    }
}
