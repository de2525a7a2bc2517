//! Toolchain descriptors.
//!
//! A toolchain names the compilers, archiver and flags the planner emits
//! commands for. Descriptors are TOML files; with no `--toolchain` the host
//! default (`cc`/`c++`/`ar`) is used. The identity string participates in
//! every command fingerprint, so two toolchains with different identities
//! never share cache entries.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("could not read toolchain file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid toolchain file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Toolchain {
    /// C compiler executable.
    pub c_compiler: String,
    /// C++ compiler executable; also drives linking.
    pub cxx_compiler: String,
    /// Static archiver.
    pub archiver: String,
    /// Extra flags for every compilation.
    pub compile_flags: Vec<String>,
    /// Extra flags for every link.
    pub link_flags: Vec<String>,
    /// Declared compiler identity. When absent the identity is probed once
    /// per plan from `<cxx-compiler> --version`.
    pub identity: Option<String>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            c_compiler: "cc".to_string(),
            cxx_compiler: "c++".to_string(),
            archiver: "ar".to_string(),
            compile_flags: Vec::new(),
            link_flags: Vec::new(),
            identity: None,
        }
    }
}

impl Toolchain {
    pub fn load(path: &Path) -> Result<Self, ToolchainError> {
        let text = std::fs::read_to_string(path).map_err(|source| ToolchainError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ToolchainError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Compiler used for one source file, by extension.
    pub fn compiler_for(&self, source: &Path) -> &str {
        match source.extension().and_then(|e| e.to_str()) {
            Some("c") => &self.c_compiler,
            _ => &self.cxx_compiler,
        }
    }

    /// Stable identity string for fingerprints: declared, or probed from the
    /// compiler's own version banner, or the executable names as a fallback.
    pub fn resolve_identity(&self) -> String {
        if let Some(id) = &self.identity {
            return id.clone();
        }
        if let Ok(out) = Command::new(&self.cxx_compiler).arg("--version").output() {
            if out.status.success() {
                if let Some(first) = String::from_utf8_lossy(&out.stdout).lines().next() {
                    return first.trim().to_string();
                }
            }
        }
        format!("{}/{}/{}", self.c_compiler, self.cxx_compiler, self.archiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gcc.toml");
        std::fs::write(
            &path,
            r#"
            c-compiler = "gcc-13"
            cxx-compiler = "g++-13"
            compile-flags = ["-O2", "-fPIC"]
            identity = "gcc 13.2.0"
            "#,
        )
        .unwrap();

        let tc = Toolchain::load(&path).unwrap();
        assert_eq!(tc.c_compiler, "gcc-13");
        assert_eq!(tc.archiver, "ar");
        assert_eq!(tc.compile_flags, vec!["-O2", "-fPIC"]);
        assert_eq!(tc.resolve_identity(), "gcc 13.2.0");
    }

    #[test]
    fn unknown_keys_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "cc-compiler = \"cc\"").unwrap();
        assert!(matches!(
            Toolchain::load(&path),
            Err(ToolchainError::Parse { .. })
        ));
    }

    #[test]
    fn compiler_selection_by_extension() {
        let tc = Toolchain::default();
        assert_eq!(tc.compiler_for(&PathBuf::from("a.c")), "cc");
        assert_eq!(tc.compiler_for(&PathBuf::from("a.cpp")), "c++");
        assert_eq!(tc.compiler_for(&PathBuf::from("a.cc")), "c++");
    }

    #[test]
    fn declared_identity_wins() {
        let tc = Toolchain {
            identity: Some("test-cc 1.0".to_string()),
            ..Toolchain::default()
        };
        assert_eq!(tc.resolve_identity(), "test-cc 1.0");
    }
}
