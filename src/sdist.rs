//! Source distribution tarballs.
//!
//! An sdist is a gzipped tarball with the package manifest at the archive
//! root; it is the only package format. Creation walks the project tree,
//! expansion guards against path escapes.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::{Archive, Builder};
use thiserror::Error;
use walkdir::WalkDir;

use crate::manifest::{ManifestError, PackageManifest};
use crate::PROJECT_MANIFEST;

#[derive(Error, Debug)]
pub enum SdistError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("archive entry {0:?} escapes the extraction root")]
    PathEscape(String),

    #[error("archive has no {PROJECT_MANIFEST} at its root")]
    MissingManifest,

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Directories never included in an sdist.
const EXCLUDED_DIRS: &[&str] = &["_build", ".git", ".mortar"];

/// Package a project directory as `<name>@<version>~<rev>.tar.gz` inside
/// `out_dir`. Returns the archive path.
pub fn create(
    project_dir: &Path,
    manifest: &PackageManifest,
    out_dir: &Path,
) -> Result<PathBuf, SdistError> {
    fs::create_dir_all(out_dir)?;
    let out_path = out_dir.join(format!("{}.tar.gz", manifest.id));

    let file = File::create(&out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    for entry in WalkDir::new(project_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
        })
    {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(project_dir)
            .expect("walkdir yields children of the root");
        builder.append_path_with_name(entry.path(), rel)?;
    }

    builder.into_inner()?.finish()?;
    Ok(out_path)
}

/// Expand a gzipped tarball into `dest`, rejecting entries that would land
/// outside it.
pub fn expand_tgz(tgz: &Path, dest: &Path) -> Result<(), SdistError> {
    fs::create_dir_all(dest)?;
    let file = File::open(tgz)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !is_safe_relative(&rel) {
            return Err(SdistError::PathEscape(rel.display().to_string()));
        }
        let target = dest.join(&rel);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
    }
    Ok(())
}

/// Read the package manifest out of an sdist without expanding it.
pub fn read_manifest(tgz: &Path) -> Result<PackageManifest, SdistError> {
    let file = File::open(tgz)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        if path.to_str() == Some(PROJECT_MANIFEST) {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return Ok(PackageManifest::parse(&text)?);
        }
    }
    Err(SdistError::MissingManifest)
}

fn is_safe_relative(p: &Path) -> bool {
    !p.is_absolute()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_project(dir: &Path) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(
            dir.join(PROJECT_MANIFEST),
            "{ name: 'hello', version: '1.0.0', libraries: [{ name: 'hello' }] }",
        )
        .unwrap();
        fs::write(dir.join("src/hello.c"), "int answer(void) { return 42; }\n").unwrap();
        fs::create_dir_all(dir.join("_build")).unwrap();
        fs::write(dir.join("_build/junk.o"), "junk").unwrap();
    }

    #[test]
    fn create_expand_round_trip() {
        let tmp = tempdir().unwrap();
        let proj = tmp.path().join("proj");
        sample_project(&proj);

        let manifest = PackageManifest::load(&proj.join(PROJECT_MANIFEST)).unwrap();
        let tgz = create(&proj, &manifest, &tmp.path().join("dist")).unwrap();
        assert!(tgz.file_name().unwrap().to_str().unwrap().starts_with("hello@1.0.0~0"));

        let out = tmp.path().join("out");
        expand_tgz(&tgz, &out).unwrap();
        assert!(out.join("src/hello.c").exists());
        assert!(out.join(PROJECT_MANIFEST).exists());
        assert!(!out.join("_build").exists(), "build dirs are excluded");
    }

    #[test]
    fn manifest_readable_without_expansion() {
        let tmp = tempdir().unwrap();
        let proj = tmp.path().join("proj");
        sample_project(&proj);

        let manifest = PackageManifest::load(&proj.join(PROJECT_MANIFEST)).unwrap();
        let tgz = create(&proj, &manifest, &tmp.path().join("dist")).unwrap();

        let read = read_manifest(&tgz).unwrap();
        assert_eq!(read.id, manifest.id);
    }

    #[test]
    fn hash_is_stable() {
        let tmp = tempdir().unwrap();
        let f = tmp.path().join("data");
        fs::write(&f, b"hello mortar").unwrap();
        let a = sha256_file(&f).unwrap();
        let b = sha256_file(&f).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
