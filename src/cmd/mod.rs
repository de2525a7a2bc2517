//! Command implementations behind the CLI front-end.

pub mod build;
pub mod pkg;
pub mod repo;

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::fetch::Fetcher;
use crate::index::{IndexDb, SyncMode};
use crate::repo::{IfExists, IfMissing};
use crate::solve::Resolved;
use crate::store::PackageStore;

/// The built-in default remote, disabled with `--no-default-repo`.
pub const DEFAULT_REMOTE: &str = "https://repo.mortar-build.dev";

/// Global options shared by every command, resolved from flags.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub cache_root: PathBuf,
    pub sync_mode: SyncMode,
    pub dry_run: bool,
    pub use_repos: Vec<String>,
    pub no_default_repo: bool,
    pub if_exists: IfExists,
    pub if_missing: IfMissing,
    pub project_dir: PathBuf,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            cache_root: crate::default_cache_root(),
            sync_mode: SyncMode::Always,
            dry_run: false,
            use_repos: Vec::new(),
            no_default_repo: false,
            if_exists: IfExists::Fail,
            if_missing: IfMissing::Fail,
            project_dir: PathBuf::from("."),
        }
    }
}

/// Process-wide handles, created once at command entry and passed down
/// explicitly. Ad-hoc `--use-repo` remotes registered here are removed again
/// when the context is dropped unless they pre-existed.
pub struct Context {
    pub index: IndexDb,
    pub store: PackageStore,
    pub fetcher: Fetcher,
    pub token: CancelToken,
    pub opts: GlobalOpts,
    ephemeral_remotes: Vec<String>,
}

impl Context {
    pub fn new(opts: GlobalOpts) -> Result<Self> {
        let index = IndexDb::open(&crate::index_db_path(&opts.cache_root))
            .context("opening the package index")?;
        let store = PackageStore::open(crate::pkgs_path(&opts.cache_root))
            .context("opening the package store")?;
        let fetcher = Fetcher::new();
        let token = CancelToken::new();

        let mut ctx = Self {
            index,
            store,
            fetcher,
            token,
            opts,
            ephemeral_remotes: Vec::new(),
        };
        ctx.register_remotes()?;
        Ok(ctx)
    }

    fn register_remotes(&mut self) -> Result<()> {
        if !self.opts.no_default_repo && self.index.remote_by_url(DEFAULT_REMOTE)?.is_none() {
            self.index.upsert_remote(DEFAULT_REMOTE, 0)?;
        }
        for url in self.opts.use_repos.clone() {
            if self.index.remote_by_url(&url)?.is_none() {
                // Ad-hoc remotes outrank configured ones for this invocation.
                self.index.upsert_remote(&url, 1000)?;
                self.ephemeral_remotes.push(url);
            }
        }
        Ok(())
    }

    /// Sync every registered remote according to the session's sync mode.
    pub fn sync_remotes(&mut self) -> Result<()> {
        let remotes = self.index.remotes()?;
        for remote in remotes {
            let token = self.token.clone();
            self.index
                .sync(&self.fetcher, &remote, self.opts.sync_mode, &token)
                .with_context(|| format!("syncing {}", remote.url))?;
        }
        Ok(())
    }

    /// Populate the store with every package of a resolved set, fetching
    /// missing ones concurrently on a private pool.
    pub fn prefetch(&self, resolved: &Resolved, jobs: usize) -> Result<()> {
        let missing: Vec<_> = resolved
            .packages
            .values()
            .filter(|p| !self.store.has(&p.id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        debug!(count = missing.len(), "prefetching packages");

        let workers = jobs.max(1).min(missing.len());
        let queue = std::sync::Mutex::new(missing);
        let queue = &queue;
        let store = &self.store;
        let fetcher = &self.fetcher;
        let token = &self.token;

        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for _ in 0..workers {
                handles.push(scope.spawn(move || -> Result<()> {
                    loop {
                        let Some(pkg) = queue.lock().expect("prefetch queue poisoned").pop()
                        else {
                            return Ok(());
                        };
                        store
                            .get_or_populate(&pkg.id, token, |tmp| {
                                fetcher
                                    .fetch_package(
                                        &pkg.remote_url,
                                        &pkg.id,
                                        &pkg.archive_sha256,
                                        tmp,
                                        token,
                                    )
                                    .map_err(Into::into)
                            })
                            .with_context(|| format!("fetching {}", pkg.id))?;
                    }
                }));
            }
            for handle in handles {
                handle.join().expect("prefetch worker panicked")?;
            }
            Ok(())
        })
    }

    /// IDs a plan keeps alive, for store GC.
    pub fn live_set(resolved: &Resolved) -> HashSet<crate::types::PkgId> {
        resolved.ids().cloned().collect()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for url in std::mem::take(&mut self.ephemeral_remotes) {
            let _ = self.index.remove_remote(&url);
        }
    }
}
