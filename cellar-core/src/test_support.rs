// cellar-core/src/test_support.rs
//! Fixtures shared by the unit tests: the nektar descriptor, throwaway
//! tarballs and formulas whose build steps are plain `sh` scripts.

use std::fs::File;
use std::path::{Path, PathBuf};

use cellar_common::config::Config;
use cellar_common::model::Formula;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

pub(crate) const NEKTAR_TOML: &str = r#"
name = "nektar"
desc = "Nektar++ spectral/hp element framework"
homepage = "https://www.nektar.info/"
version = "5.2.0"

[source]
url = "https://www.nektar.info/src/nektar-v5.2.0.tar.bz2"
sha256 = "0e5b4b2e3a8f0a0a62f3d1c8f7a0c5e1b4f6e2d9c3b8a7f6e5d4c3b2a1f0e9d8"

[[dependencies]]
name = "cmake"
level = "build"
kind = "build-tool"

[[dependencies]]
name = "boost"

[[dependencies]]
name = "zlib"

[[dependencies]]
name = "mpi"
level = "recommended"

[[dependencies]]
name = "petsc"
level = "optional"

[[dependencies]]
name = "python"
level = "optional"
kind = "language-runtime"

[[options]]
name = "demos"
description = "Compile Nektar++ demo executables"

[install]
system = "cmake"
components = ["ThirdParty", "lib", "solvers", "util", "dev"]
flags = [
    { key = "NEKTAR_BUILD_TESTS", value = "OFF" },
    { key = "ZLIB_ROOT", value = "{opt:zlib}" },
    { key = "NEKTAR_BUILD_DEMOS", option = "demos" },
    { key = "NEKTAR_USE_MPI", dependency = "mpi" },
    { key = "NEKTAR_USE_PETSC", dependency = "petsc" },
    { key = "PETSC_DIR", when_dependency = "petsc", value = "{opt:petsc}/real" },
]

[install.bindings]
name = "python"
when_dependency = "python"

[[install.bindings.steps]]
name = "python-bindings"
program = "python3"
args = ["-m", "pip", "install", "--prefix={prefix}", "{build}/python"]
"#;

pub(crate) fn nektar() -> Formula {
    Formula::from_toml_str(NEKTAR_TOML).unwrap()
}

/// Config rooted in a scratch dir with a PATH that only has the system shell
/// tools.
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::with_root(root.join("prefix"));
    config.base_path = vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")];
    config.jobs = 2;
    config.make_jobs = 2;
    config
}

pub(crate) fn sha256_hex(path: &Path) -> String {
    hex::encode(Sha256::digest(std::fs::read(path).unwrap()))
}

pub(crate) fn file_url(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

/// Writes a `.tar.gz` holding `files` under the directory `top`.
pub(crate) fn write_tar_gz(path: &Path, top: &str, files: &[(&str, &str)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = File::create(path).unwrap();
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{top}/{name}"), contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// A formula built by custom `sh` steps from the tarball at `tarball`.
/// `extra` is appended verbatim to the TOML document.
pub(crate) fn toy_formula(name: &str, tarball: &Path, extra: &str) -> Formula {
    let raw = format!(
        r#"
name = "{name}"
version = "1.0"

[source]
url = "{url}"
sha256 = "{sha}"

[install]
system = "custom"

[[install.steps]]
name = "install"
program = "sh"
args = ["-c", "mkdir -p {{prefix}}/bin && cp build.sh {{prefix}}/bin/{name} && echo built > {{prefix}}/BUILT"]
dir = "source"
{extra}
"#,
        url = file_url(tarball),
        sha = sha256_hex(tarball),
    );
    Formula::from_toml_str(&raw).unwrap()
}
