//! mortar - source-based package manager and build driver for C/C++.
//!
//! Resolves a project's declared dependencies against package repositories,
//! fetches source distributions into a local store, plans a build graph and
//! drives the host toolchain to produce artifacts.

pub mod build;
pub mod cancel;
pub mod cmd;
pub mod dym;
pub mod error;
pub mod fetch;
pub mod index;
pub mod manifest;
pub mod project;
pub mod repo;
pub mod sdist;
pub mod solve;
pub mod store;
pub mod toolchain;
pub mod types;

use std::path::{Path, PathBuf};

use dirs::home_dir;

/// User agent sent on every HTTP request.
pub const USER_AGENT: &str = concat!("mortar/", env!("CARGO_PKG_VERSION"));

/// File name of the project manifest at a project root.
pub const PROJECT_MANIFEST: &str = "mortar.json5";

/// Default cache root: ~/.mortar (overridable with `--crs-cache-dir` or
/// `MORTAR_CACHE_DIR`).
pub fn default_cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var("MORTAR_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mortar")
}

/// Index database path under a cache root.
pub fn index_db_path(cache_root: &Path) -> PathBuf {
    cache_root.join("index.db")
}

/// Expanded package trees live under `<cache>/pkgs/<name>/<version>~<rev>/`.
pub fn pkgs_path(cache_root: &Path) -> PathBuf {
    cache_root.join("pkgs")
}

/// Compile cache path under a cache root.
pub fn compile_cache_path(cache_root: &Path) -> PathBuf {
    cache_root.join("compile-cache.db")
}
