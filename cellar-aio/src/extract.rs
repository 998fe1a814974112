// cellar-aio/src/extract.rs
// Archive extraction. Decoding runs on the blocking pool.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use cellar_common::error::{CellarError, Result};
use flate2::read::GzDecoder;
use tracing::{debug, error};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    TarXz,
    Tar,
    Zip,
}

impl ArchiveKind {
    /// Picks the format from the file name, falling back to magic bytes.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let by_name = [
            (".tar.gz", Self::TarGz),
            (".tgz", Self::TarGz),
            (".tar.bz2", Self::TarBz2),
            (".tbz", Self::TarBz2),
            (".tbz2", Self::TarBz2),
            (".tar.xz", Self::TarXz),
            (".txz", Self::TarXz),
            (".tar", Self::Tar),
            (".zip", Self::Zip),
        ]
        .into_iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, kind)| kind);
        if by_name.is_some() {
            return by_name;
        }
        let sniffed = infer::get_from_path(path).ok().flatten()?;
        debug!("Sniffed {} as {}", path.display(), sniffed.mime_type());
        match sniffed.extension() {
            "gz" => Some(Self::TarGz),
            "bz2" => Some(Self::TarBz2),
            "xz" => Some(Self::TarXz),
            "tar" => Some(Self::Tar),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }
}

pub async fn extract_archive_async(
    archive_path: &Path,
    target_dir: &Path,
    strip_components: usize,
) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target_dir, strip_components))
        .await
        .map_err(|e| CellarError::Generic(format!("JoinError in archive extraction: {e}")))?
}

/// Extracts `archive_path` into `target_dir`, dropping the first
/// `strip_components` path components of every entry.
pub fn extract_archive(archive_path: &Path, target_dir: &Path, strip_components: usize) -> Result<()> {
    let kind = ArchiveKind::detect(archive_path).ok_or_else(|| {
        CellarError::Generic(format!(
            "Unsupported archive type: {}",
            archive_path.display()
        ))
    })?;
    debug!(
        "Extracting '{}' ({:?}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );
    std::fs::create_dir_all(target_dir)?;
    let file = BufReader::new(File::open(archive_path)?);
    match kind {
        ArchiveKind::TarGz => unpack_tar(GzDecoder::new(file), target_dir, strip_components),
        ArchiveKind::TarBz2 => unpack_tar(BzDecoder::new(file), target_dir, strip_components),
        ArchiveKind::TarXz => unpack_tar(XzDecoder::new(file), target_dir, strip_components),
        ArchiveKind::Tar => unpack_tar(file, target_dir, strip_components),
        ArchiveKind::Zip => unpack_zip(file, target_dir, strip_components),
    }
}

fn stripped_target(target_dir: &Path, entry_path: &Path, strip: usize) -> Result<Option<PathBuf>> {
    let stripped: Vec<_> = entry_path.components().skip(strip).collect();
    if stripped.is_empty() {
        return Ok(None);
    }
    let mut target = target_dir.to_path_buf();
    for comp in stripped {
        match comp {
            Component::Normal(p) => target.push(p),
            Component::CurDir => {}
            _ => {
                error!("Unsafe component {:?} in archive path {}", comp, entry_path.display());
                return Err(CellarError::Generic(format!(
                    "Unsafe path component in {}",
                    entry_path.display()
                )));
            }
        }
    }
    Ok(Some(target))
}

fn unpack_tar<R: Read>(reader: R, target_dir: &Path, strip: usize) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let Some(target) = stripped_target(target_dir, &entry_path, strip)? else {
            continue;
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target).map_err(|e| {
            CellarError::Generic(format!("Failed to unpack {}: {e}", entry_path.display()))
        })?;
    }
    Ok(())
}

fn unpack_zip<R: Read + std::io::Seek>(reader: R, target_dir: &Path, strip: usize) -> Result<()> {
    let mut archive =
        ZipArchive::new(reader).map_err(|e| CellarError::Generic(format!("Failed to open ZIP: {e}")))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| CellarError::Generic(format!("Failed to access ZIP entry: {e}")))?;
        let Some(entry_path) = file.enclosed_name() else {
            return Err(CellarError::Generic(format!(
                "Invalid ZIP entry path {}",
                file.name()
            )));
        };
        let Some(outpath) = stripped_target(target_dir, &entry_path, strip)? else {
            continue;
        };
        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(p) = outpath.parent() {
            std::fs::create_dir_all(p)?;
        }
        let mut outfile = File::create(&outpath)?;
        std::io::copy(&mut file, &mut outfile)?;
        #[cfg(unix)]
        {
            if let Some(mode) = file.unix_mode() {
                crate::fs::set_permissions(&outpath, mode)?;
            }
        }
    }
    Ok(())
}

/// The directory holding the sources: the single top-level directory when
/// the archive had one, otherwise `dir` itself.
pub fn source_root(dir: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dir.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let enc = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_tar_gz_and_finds_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nektar-v5.2.0.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("nektar-v5.2.0/CMakeLists.txt", "project(nektar)\n"),
                ("nektar-v5.2.0/library/a.cpp", "int a;\n"),
            ],
        );
        let out = dir.path().join("stage");
        extract_archive(&archive, &out, 0).unwrap();
        let root = source_root(&out).unwrap();
        assert!(root.ends_with("nektar-v5.2.0"));
        assert!(root.join("library/a.cpp").is_file());

        let stripped = dir.path().join("stripped");
        extract_archive(&archive, &stripped, 1).unwrap();
        assert!(stripped.join("CMakeLists.txt").is_file());
    }

    #[test]
    fn sniffs_gzip_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("download");
        write_tar_gz(&archive, &[("x/y.txt", "y")]);
        assert_eq!(ArchiveKind::detect(&archive), Some(ArchiveKind::TarGz));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("notes.txt");
        std::fs::write(&bogus, "plain text").unwrap();
        assert!(extract_archive(&bogus, &dir.path().join("out"), 0).is_err());
    }
}
