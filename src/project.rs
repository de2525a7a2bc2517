//! The project being built: a package rooted in a working directory.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::manifest::{DepKind, DependencyExpr, ManifestError, PackageManifest};
use crate::PROJECT_MANIFEST;

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("no {PROJECT_MANIFEST} found in {0}")]
    NoManifest(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// A project directory plus its parsed manifest.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub manifest: PackageManifest,
}

impl Project {
    pub fn open(dir: &Path) -> Result<Self, ProjectError> {
        let manifest_path = dir.join(PROJECT_MANIFEST);
        if !manifest_path.is_file() {
            return Err(ProjectError::NoManifest(dir.display().to_string()));
        }
        let manifest = PackageManifest::load(&manifest_path)?;
        Ok(Self {
            root: dir.to_path_buf(),
            manifest,
        })
    }

    /// Root requirements for a solve: the project's lib dependencies, plus
    /// test/app dependencies when those build kinds are enabled.
    pub fn root_requirements(&self, want_tests: bool, want_apps: bool) -> Vec<DependencyExpr> {
        let mut kinds = vec![DepKind::Lib];
        if want_tests {
            kinds.push(DepKind::Test);
        }
        if want_apps {
            kinds.push(DepKind::App);
        }
        self.manifest
            .dependencies_of_kind(&kinds)
            .into_iter()
            .cloned()
            .collect()
    }
}
