//! Local store of expanded package source trees.
//!
//! Keyed by `<name>/<version>~<revision>/`. Population is two-phase: the
//! package is expanded into a sibling `.download.tmp-*` directory and then
//! renamed into place, so a present entry is always complete. Concurrent
//! populations of one ID deduplicate through a per-ID in-process lock plus
//! an on-disk lock file beside the destination; the loser waits for the
//! winner's rename and returns with no work done.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::types::PkgId;

/// Lock files older than this are assumed to be left over from a crashed
/// process and are broken.
const STALE_LOCK_AGE: Duration = Duration::from_secs(10 * 60);

const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    // anyhow::Error is not a std Error, so it cannot be a #[source];
    // classification recurses into the field instead.
    #[error("populating {id} failed: {source:#}")]
    Populate { id: PkgId, source: anyhow::Error },
}

/// Handle to the on-disk package store. Cheap to clone.
#[derive(Clone)]
pub struct PackageStore {
    root: PathBuf,
    inflight: Arc<Mutex<HashMap<PkgId, Arc<Mutex<()>>>>>,
}

impl PackageStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an expanded package lives (whether or not it is present).
    pub fn path_of(&self, id: &PkgId) -> PathBuf {
        self.root.join(id.name.as_str()).join(id.dir_name())
    }

    /// Cheap presence check; a present entry is complete and validated.
    pub fn has(&self, id: &PkgId) -> bool {
        self.path_of(id).is_dir()
    }

    /// Return the expanded tree for `id`, invoking `populate` to produce it
    /// when absent. `populate` receives a scratch directory and must fill it
    /// with the expanded package; the store renames it into place.
    ///
    /// Among concurrent callers for one ID, `populate` runs at most once.
    pub fn get_or_populate<F>(
        &self,
        id: &PkgId,
        token: &CancelToken,
        populate: F,
    ) -> Result<PathBuf, StoreError>
    where
        F: FnOnce(&Path) -> anyhow::Result<()>,
    {
        let dest = self.path_of(id);
        if dest.is_dir() {
            return Ok(dest);
        }

        // One attempt per ID within this process.
        let gate = {
            let mut map = self.inflight.lock().expect("store lock poisoned");
            map.entry(id.clone()).or_default().clone()
        };
        let _in_process = gate.lock().expect("store gate poisoned");

        if dest.is_dir() {
            return Ok(dest);
        }

        let parent = dest
            .parent()
            .expect("store entries always have a parent")
            .to_path_buf();
        fs::create_dir_all(&parent)?;

        let lock_path = parent.join(format!("{}.lock", id.dir_name()));
        let _fs_lock = self.acquire_fs_lock(&dest, &lock_path, token)?;

        if dest.is_dir() {
            // Another process won the race while we waited.
            return Ok(dest);
        }

        // A crash mid-download leaves only the tmp directory; clear it.
        let tmp = parent.join(format!(".download.tmp-{}", id.dir_name()));
        if tmp.exists() {
            debug!(id = %id, "removing leftover partial download");
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        match populate(&tmp) {
            Ok(()) => {}
            Err(source) => {
                let _ = fs::remove_dir_all(&tmp);
                if source.chain().any(|c| c.is::<Cancelled>()) {
                    return Err(StoreError::Cancelled(Cancelled));
                }
                return Err(StoreError::Populate {
                    id: id.clone(),
                    source,
                });
            }
        }

        fs::rename(&tmp, &dest)?;
        debug!(id = %id, path = %dest.display(), "package installed into store");
        Ok(dest)
    }

    fn acquire_fs_lock(
        &self,
        dest: &Path,
        lock_path: &Path,
        token: &CancelToken,
    ) -> Result<FsLock, StoreError> {
        loop {
            token.check()?;
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(_) => {
                    return Ok(FsLock {
                        path: lock_path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if dest.is_dir() {
                        // Winner finished; we will re-check and return.
                        return Ok(FsLock {
                            path: PathBuf::new(),
                        });
                    }
                    if lock_is_stale(lock_path) {
                        warn!(lock = %lock_path.display(), "breaking stale store lock");
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove entries not in `live` and not currently locked. Returns the
    /// removed IDs.
    pub fn gc(&self, live: &std::collections::HashSet<PkgId>) -> Result<Vec<PkgId>, StoreError> {
        let mut removed = Vec::new();
        for name_entry in read_dir_or_empty(&self.root)? {
            let name_dir = name_entry.path();
            if !name_dir.is_dir() {
                continue;
            }
            let Some(name) = name_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for ver_entry in read_dir_or_empty(&name_dir)? {
                let ver_dir = ver_entry.path();
                let Some(dir_name) = ver_dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if dir_name.starts_with(".download.tmp-") {
                    let _ = fs::remove_dir_all(&ver_dir);
                    continue;
                }
                let Ok(id) = format!("{name}@{dir_name}").parse::<PkgId>() else {
                    continue;
                };
                if live.contains(&id) {
                    continue;
                }
                let lock = name_dir.join(format!("{dir_name}.lock"));
                if lock.exists() && !lock_is_stale(&lock) {
                    continue;
                }
                fs::remove_dir_all(&ver_dir)?;
                removed.push(id);
            }
        }
        Ok(removed)
    }
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn lock_is_stale(lock: &Path) -> bool {
    let Ok(meta) = fs::metadata(lock) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Removes the lock file on drop; all exit paths release the lock.
struct FsLock {
    path: PathBuf,
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}
