//! Package and catalog acquisition.
//!
//! Resolves a remote URL plus package ID to verified bytes on disk. HTTP(S)
//! remotes stream through a process-wide connection pool with per-host
//! concurrency caps; `file://` remotes expand directly from the source
//! archive. Transient transport failures retry with exponential backoff;
//! hash mismatches are fatal and never populate the store.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::sdist::{self, SdistError};
use crate::types::PkgId;

/// Default number of delivery attempts for transient transport failures.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Base backoff; doubles per retry.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Concurrent requests allowed against one host.
const PER_HOST_CAP: usize = 6;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport failure fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Archive(#[from] SdistError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("unsupported remote URL {0:?}")]
    BadUrl(String),
}

impl FetchError {
    /// Transient errors are retried; everything else aborts immediately.
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Archive URL for a publication: `<remote>/pkg/<name>/<version>~<rev>/pkg.tgz`.
pub fn pkg_archive_url(remote: &str, id: &PkgId) -> String {
    format!(
        "{}/pkg/{}/{}/pkg.tgz",
        remote.trim_end_matches('/'),
        id.name,
        id.dir_name()
    )
}

/// Catalog URL for a remote: `<remote>/repo.db`.
pub fn catalog_url(remote: &str) -> String {
    format!("{}/repo.db", remote.trim_end_matches('/'))
}

/// Counting semaphore keyed by host name. Leases release on drop, so every
/// exit path gives the slot back.
struct HostLimiter {
    counts: Mutex<HashMap<String, usize>>,
    freed: Condvar,
    cap: usize,
}

impl HostLimiter {
    fn new(cap: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            freed: Condvar::new(),
            cap,
        }
    }

    fn acquire<'a>(&'a self, host: &str, token: &CancelToken) -> Result<HostLease<'a>, Cancelled> {
        let mut counts = self.counts.lock().expect("host limiter poisoned");
        loop {
            token.check()?;
            let inflight = counts.entry(host.to_string()).or_insert(0);
            if *inflight < self.cap {
                *inflight += 1;
                return Ok(HostLease {
                    limiter: self,
                    host: host.to_string(),
                });
            }
            let (guard, _timeout) = self
                .freed
                .wait_timeout(counts, Duration::from_millis(100))
                .expect("host limiter poisoned");
            counts = guard;
        }
    }
}

struct HostLease<'a> {
    limiter: &'a HostLimiter,
    host: String,
}

impl Drop for HostLease<'_> {
    fn drop(&mut self) {
        let mut counts = self.limiter.counts.lock().expect("host limiter poisoned");
        if let Some(n) = counts.get_mut(&self.host) {
            *n = n.saturating_sub(1);
        }
        self.limiter.freed.notify_all();
    }
}

/// Process-wide fetch handle: one HTTP connection pool, one host limiter.
/// Created at command entry and passed explicitly.
pub struct Fetcher {
    client: reqwest::blocking::Client,
    hosts: HostLimiter,
    attempts: u32,
    backoff_base: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .expect("HTTP client construction cannot fail");
        Self {
            client,
            hosts: HostLimiter::new(PER_HOST_CAP),
            attempts: DEFAULT_ATTEMPTS,
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Shrink retry delays; used by tests.
    pub fn with_fast_retries(mut self) -> Self {
        self.backoff_base = Duration::from_millis(1);
        self
    }

    /// Fetch and expand one package archive into `dest`, verifying its
    /// SHA-256 against `expected_sha256` before expansion.
    pub fn fetch_package(
        &self,
        remote_url: &str,
        id: &PkgId,
        expected_sha256: &str,
        dest: &Path,
        token: &CancelToken,
    ) -> Result<(), FetchError> {
        let url = pkg_archive_url(remote_url, id);

        if let Some(local) = file_url_path(remote_url) {
            // Local repository: expand straight from the source archive.
            let tgz = local
                .join("pkg")
                .join(id.name.as_str())
                .join(id.dir_name())
                .join("pkg.tgz");
            verify_local(&tgz, expected_sha256)?;
            sdist::expand_tgz(&tgz, dest)?;
            debug!(id = %id, from = %tgz.display(), "expanded package from local repository");
            return Ok(());
        }

        let tmp = tempfile::NamedTempFile::new_in(
            dest.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        let actual = self.download_verified(&url, tmp.path(), token)?;
        if actual != expected_sha256 {
            return Err(FetchError::HashMismatch {
                url,
                expected: expected_sha256.to_string(),
                actual,
            });
        }
        sdist::expand_tgz(tmp.path(), dest)?;
        debug!(id = %id, url, "package downloaded and expanded");
        Ok(())
    }

    /// Fetch a remote's catalog snapshot (`repo.db`) to `dest`.
    pub fn fetch_catalog(
        &self,
        remote_url: &str,
        dest: &Path,
        token: &CancelToken,
    ) -> Result<(), FetchError> {
        if let Some(local) = file_url_path(remote_url) {
            let src = local.join("repo.db");
            std::fs::copy(&src, dest)?;
            return Ok(());
        }
        self.download_verified(&catalog_url(remote_url), dest, token)?;
        Ok(())
    }

    /// Download `url` into `dest` with retries, returning the SHA-256 of the
    /// received bytes.
    fn download_verified(
        &self,
        url: &str,
        dest: &Path,
        token: &CancelToken,
    ) -> Result<String, FetchError> {
        let host = host_of(url)?;
        let _lease = self.hosts.acquire(&host, token)?;

        let mut delay = self.backoff_base;
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            token.check()?;
            match self.download_once(url, dest) {
                Ok(sha) => return Ok(sha),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(url, attempt, error = %e, "transient fetch failure; retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("retry loop records an error before exhausting"))
    }

    fn download_once(&self, url: &str, dest: &Path) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = File::create(dest)?;
        let mut hasher = Sha256::new();
        let mut reader = resp;
        let mut buffer = [0u8; 65536];
        loop {
            let n = reader.read(&mut buffer).map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            hasher.update(&buffer[..n]);
        }
        file.flush()?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn verify_local(tgz: &Path, expected: &str) -> Result<(), FetchError> {
    let actual = sdist::sha256_file(tgz)?;
    if actual != expected {
        return Err(FetchError::HashMismatch {
            url: tgz.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// `file://` remote → local directory path.
pub fn file_url_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

fn host_of(url: &str) -> Result<String, FetchError> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| FetchError::BadUrl(url.to_string()))?;
    let host = rest.split(['/', ':']).next().unwrap_or("");
    if host.is_empty() {
        return Err(FetchError::BadUrl(url.to_string()));
    }
    Ok(host.to_string())
}
