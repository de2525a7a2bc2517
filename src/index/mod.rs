//! Persistent catalog of known package revisions, per remote.
//!
//! One row per `(remote, package-id)`: the package manifest plus the content
//! hash of its source archive. Writers serialize through SQLite transactions;
//! readers see a stable snapshot via [`IndexDb::snapshot`].

pub mod migrate;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::fetch::{FetchError, Fetcher};
use crate::manifest::{ManifestError, PackageManifest};
use crate::types::{Name, PkgId, Version, VersionRange};

use migrate::{apply_migrations, MigrateError, MigrationStep};

const INDEX_META: &str = "mortar_meta";

/// Catalogs older than this are considered explicitly stale under
/// `cached-okay` and re-fetched opportunistically.
const CATALOG_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("stored manifest for {id} is corrupt: {source}")]
    CorruptManifest {
        id: String,
        #[source]
        source: ManifestError,
    },

    #[error("catalog fetch from {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("no cached catalog for {url} and sync mode forbids fetching")]
    CacheAbsent { url: String },

    #[error("remote {url} is not registered")]
    UnknownRemote { url: String },

    #[error(
        "package {id} is advertised with different contents by {left} and {right}; \
         refusing the conflicting publication"
    )]
    IdCollision {
        id: PkgId,
        left: String,
        right: String,
    },

    #[error("package {0} is not in the index")]
    NotFound(PkgId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository remote: where catalogs and archives come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub id: i64,
    pub url: String,
    pub priority: i64,
    pub last_sync: Option<i64>,
}

/// Catalog refresh policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Unconditionally re-fetch the remote catalog.
    #[default]
    Always,
    /// Use the local cache when present and not explicitly stale.
    CachedOkay,
    /// Fail when the cache is absent.
    Never,
}

/// One candidate publication known to the index.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: PkgId,
    pub remote_url: String,
    pub priority: i64,
    /// Remote insertion order; ties on equal priority break ascending.
    pub remote_seq: i64,
    pub manifest: PackageManifest,
    pub archive_sha256: String,
}

/// In-memory snapshot of the whole catalog, taken at solver entry.
///
/// Candidates per name are sorted by `(version desc, revision desc,
/// priority desc, insertion order)`.
#[derive(Debug, Clone, Default)]
pub struct Universe {
    pub packages: BTreeMap<Name, Vec<Candidate>>,
}

impl Universe {
    pub fn candidates(&self, name: &Name) -> &[Candidate] {
        self.packages.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn known_names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(Name::as_str)
    }
}

fn sort_candidates(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| {
        b.id.version
            .cmp(&a.id.version)
            .then(b.id.revision.cmp(&a.id.revision))
            .then(b.priority.cmp(&a.priority))
            .then(a.remote_seq.cmp(&b.remote_seq))
    });
}

const MIGRATIONS: &[MigrationStep] = &[
    // v1: remotes + packages.
    |tx| {
        tx.execute_batch(
            "CREATE TABLE remotes (
                 remote_id INTEGER PRIMARY KEY AUTOINCREMENT,
                 url TEXT NOT NULL UNIQUE,
                 priority INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE packages (
                 remote_id INTEGER NOT NULL REFERENCES remotes(remote_id) ON DELETE CASCADE,
                 name TEXT NOT NULL,
                 version TEXT NOT NULL,
                 revision INTEGER NOT NULL,
                 manifest TEXT NOT NULL,
                 archive_sha256 TEXT NOT NULL,
                 PRIMARY KEY (remote_id, name, version, revision)
             );
             CREATE INDEX idx_packages_name ON packages(name);",
        )
    },
    // v2: per-remote sync bookkeeping.
    |tx| {
        tx.execute_batch("ALTER TABLE remotes ADD COLUMN last_sync INTEGER")
    },
];

pub struct IndexDb {
    conn: Connection,
}

impl IndexDb {
    /// Open (and migrate) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        apply_migrations(&mut conn, INDEX_META, MIGRATIONS)?;
        Ok(Self { conn })
    }

    /// Register a remote, or update the priority of an existing one.
    pub fn upsert_remote(&self, url: &str, priority: i64) -> Result<Remote, IndexError> {
        self.conn.execute(
            "INSERT INTO remotes (url, priority) VALUES (?1, ?2)
             ON CONFLICT(url) DO UPDATE SET priority = excluded.priority",
            params![url, priority],
        )?;
        self.remote_by_url(url)?
            .ok_or_else(|| IndexError::UnknownRemote {
                url: url.to_string(),
            })
    }

    pub fn remote_by_url(&self, url: &str) -> Result<Option<Remote>, IndexError> {
        let row = self
            .conn
            .query_row(
                "SELECT remote_id, url, priority, last_sync FROM remotes WHERE url = ?1",
                [url],
                |r| {
                    Ok(Remote {
                        id: r.get(0)?,
                        url: r.get(1)?,
                        priority: r.get(2)?,
                        last_sync: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remove a remote and all of its catalog rows. Returns false when the
    /// remote was not registered.
    pub fn remove_remote(&self, url: &str) -> Result<bool, IndexError> {
        let n = self
            .conn
            .execute("DELETE FROM remotes WHERE url = ?1", [url])?;
        Ok(n > 0)
    }

    pub fn remotes(&self) -> Result<Vec<Remote>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT remote_id, url, priority, last_sync FROM remotes ORDER BY remote_id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(Remote {
                id: r.get(0)?,
                url: r.get(1)?,
                priority: r.get(2)?,
                last_sync: r.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Refresh one remote's catalog according to `mode`.
    ///
    /// Under `CachedOkay` a present, fresh cache short-circuits; a stale
    /// cache is refreshed opportunistically, degrading back to the cache
    /// with a warning when the network is down. A missing cache behaves as
    /// `Always` (logged at debug level).
    pub fn sync(
        &mut self,
        fetcher: &Fetcher,
        remote: &Remote,
        mode: SyncMode,
        token: &CancelToken,
    ) -> Result<(), IndexError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let cache_age = remote.last_sync.map(|t| now.saturating_sub(t) as u64);

        match mode {
            SyncMode::Never => {
                if remote.last_sync.is_none() {
                    return Err(IndexError::CacheAbsent {
                        url: remote.url.clone(),
                    });
                }
                return Ok(());
            }
            SyncMode::CachedOkay => match cache_age {
                Some(age) if age < CATALOG_MAX_AGE.as_secs() => {
                    debug!(url = %remote.url, "catalog cache is fresh; skipping sync");
                    return Ok(());
                }
                Some(_) => {
                    debug!(url = %remote.url, "catalog cache is stale; refreshing");
                }
                None => {
                    debug!(url = %remote.url, "no cached catalog; behaving as sync-mode=always");
                }
            },
            SyncMode::Always => {}
        }

        let tmp = tempfile::NamedTempFile::new()?;
        match fetcher.fetch_catalog(&remote.url, tmp.path(), token) {
            Ok(()) => {}
            Err(e) => {
                if mode == SyncMode::CachedOkay && remote.last_sync.is_some() {
                    warn!(url = %remote.url, error = %e, "catalog refresh failed; using cached data");
                    return Ok(());
                }
                return Err(IndexError::Fetch {
                    url: remote.url.clone(),
                    source: e,
                });
            }
        }

        self.import_catalog(remote, tmp.path(), now)
    }

    /// Replace one remote's rows from a downloaded `repo.db` snapshot.
    fn import_catalog(
        &mut self,
        remote: &Remote,
        catalog: &Path,
        now: i64,
    ) -> Result<(), IndexError> {
        struct Row {
            name: String,
            version: String,
            revision: u32,
            manifest: String,
            archive_sha256: String,
        }

        let snap = Connection::open_with_flags(
            catalog,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let mut stmt = snap.prepare(
            "SELECT name, version, revision, manifest, archive_sha256 FROM packages",
        )?;
        let rows: Vec<Row> = stmt
            .query_map([], |r| {
                Ok(Row {
                    name: r.get(0)?,
                    version: r.get(1)?,
                    revision: r.get(2)?,
                    manifest: r.get(3)?,
                    archive_sha256: r.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(snap);

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM packages WHERE remote_id = ?1",
            [remote.id],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO packages (remote_id, name, version, revision, manifest, archive_sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut conflict = tx.prepare(
                "SELECT r.url FROM packages p JOIN remotes r ON r.remote_id = p.remote_id
                 WHERE p.remote_id != ?1 AND p.name = ?2 AND p.version = ?3 AND p.revision = ?4
                   AND p.archive_sha256 != ?5
                 LIMIT 1",
            )?;
            for row in &rows {
                let other: Option<String> = conflict
                    .query_row(
                        params![remote.id, row.name, row.version, row.revision, row.archive_sha256],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(other_url) = other {
                    let id = PkgId::new(
                        Name::new(row.name.clone()).unwrap_or_else(|_| {
                            Name::new("invalid").expect("static name")
                        }),
                        Version::parse(&row.version)
                            .unwrap_or_else(|_| Version::new(0, 0, 0)),
                        row.revision,
                    );
                    return Err(IndexError::IdCollision {
                        id,
                        left: remote.url.clone(),
                        right: other_url,
                    });
                }
                insert.execute(params![
                    remote.id,
                    row.name,
                    row.version,
                    row.revision,
                    row.manifest,
                    row.archive_sha256,
                ])?;
            }
        }
        tx.execute(
            "UPDATE remotes SET last_sync = ?1 WHERE remote_id = ?2",
            params![now, remote.id],
        )?;
        tx.commit()?;

        debug!(url = %remote.url, packages = rows.len(), "catalog imported");
        Ok(())
    }

    /// Insert or replace one publication row for a remote. Used by `repo
    /// import` flows and tests; network syncs go through [`IndexDb::sync`].
    pub fn upsert_package(
        &self,
        remote: &Remote,
        manifest: &PackageManifest,
        archive_sha256: &str,
    ) -> Result<(), IndexError> {
        let id = &manifest.id;
        let other: Option<String> = self
            .conn
            .query_row(
                "SELECT r.url FROM packages p JOIN remotes r ON r.remote_id = p.remote_id
                 WHERE p.remote_id != ?1 AND p.name = ?2 AND p.version = ?3 AND p.revision = ?4
                   AND p.archive_sha256 != ?5
                 LIMIT 1",
                params![
                    remote.id,
                    id.name.as_str(),
                    id.version.to_string(),
                    id.revision,
                    archive_sha256
                ],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(other_url) = other {
            return Err(IndexError::IdCollision {
                id: id.clone(),
                left: remote.url.clone(),
                right: other_url,
            });
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO packages
             (remote_id, name, version, revision, manifest, archive_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                remote.id,
                id.name.as_str(),
                id.version.to_string(),
                id.revision,
                manifest.to_json_string(),
                archive_sha256,
            ],
        )?;
        Ok(())
    }

    /// All candidates for `name` admitted by `range`, sorted by
    /// `(version desc, revision desc, priority desc, insertion order)`.
    pub fn lookup(&self, name: &Name, range: &VersionRange) -> Result<Vec<Candidate>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT p.name, p.version, p.revision, p.manifest, p.archive_sha256,
                    r.url, r.priority, r.remote_id
             FROM packages p JOIN remotes r ON r.remote_id = p.remote_id
             WHERE p.name = ?1",
        )?;
        let mut cands = Vec::new();
        let rows = stmt.query_map([name.as_str()], |r| {
            Ok((
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?;
        for row in rows {
            let (version, revision, manifest_text, sha, url, priority, seq) = row?;
            let Ok(version) = Version::parse(&version) else {
                continue;
            };
            if !range.contains(&version) {
                continue;
            }
            let id = PkgId::new(name.clone(), version, revision);
            let manifest = PackageManifest::parse(&manifest_text).map_err(|source| {
                IndexError::CorruptManifest {
                    id: id.to_string(),
                    source,
                }
            })?;
            cands.push(Candidate {
                id,
                remote_url: url,
                priority,
                remote_seq: seq,
                manifest,
                archive_sha256: sha,
            });
        }
        sort_candidates(&mut cands);
        Ok(cands)
    }

    /// The manifest of one exact publication (any advertising remote; all
    /// remotes are asserted byte-equal for one ID).
    pub fn manifest_of(&self, id: &PkgId) -> Result<PackageManifest, IndexError> {
        let cands = self.lookup(&id.name, &VersionRange::exact(&id.version))?;
        cands
            .into_iter()
            .find(|c| c.id == *id)
            .map(|c| c.manifest)
            .ok_or_else(|| IndexError::NotFound(id.clone()))
    }

    /// Every archive hash advertised for one ID, with the remote URL.
    pub fn archive_sources(&self, id: &PkgId) -> Result<Vec<(String, String)>, IndexError> {
        let cands = self.lookup(&id.name, &VersionRange::exact(&id.version))?;
        Ok(cands
            .into_iter()
            .filter(|c| c.id == *id)
            .map(|c| (c.remote_url, c.archive_sha256))
            .collect())
    }

    /// All package names in the index; feeds did-you-mean suggestions.
    pub fn all_names(&self) -> Result<Vec<String>, IndexError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT name FROM packages ORDER BY name")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Substring search over names, for `pkg search`.
    pub fn search(&self, pattern: &str) -> Result<Vec<Candidate>, IndexError> {
        let names = self.all_names()?;
        let mut out = Vec::new();
        for name in names {
            if !name.contains(pattern) {
                continue;
            }
            let name = match Name::new(name) {
                Ok(n) => n,
                Err(_) => continue,
            };
            out.extend(self.lookup(&name, &VersionRange::any())?);
        }
        Ok(out)
    }

    /// Materialize the whole catalog; the solver reads only this snapshot,
    /// so a concurrent sync cannot affect an in-flight solve.
    pub fn snapshot(&self) -> Result<Universe, IndexError> {
        let mut universe = Universe::default();
        for name in self.all_names()? {
            let Ok(name) = Name::new(name) else { continue };
            let cands = self.lookup(&name, &VersionRange::any())?;
            universe.packages.insert(name, cands);
        }
        Ok(universe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PackageManifest;

    fn manifest(name: &str, version: &str, revision: u32) -> PackageManifest {
        PackageManifest::parse(&format!(
            "{{ name: '{name}', version: '{version}', revision: {revision}, \
             libraries: [{{ name: '{name}' }}] }}"
        ))
        .unwrap()
    }

    #[test]
    fn upsert_and_lookup_ordering() {
        let db = IndexDb::open_in_memory().unwrap();
        let remote = db.upsert_remote("https://repo.example.com", 0).unwrap();

        db.upsert_package(&remote, &manifest("bar", "1.2.0", 0), "aaa")
            .unwrap();
        db.upsert_package(&remote, &manifest("bar", "1.3.0", 0), "bbb")
            .unwrap();
        db.upsert_package(&remote, &manifest("bar", "1.3.0", 1), "ccc")
            .unwrap();

        let name = Name::new("bar").unwrap();
        let cands = db
            .lookup(&name, &VersionRange::parse("^1").unwrap())
            .unwrap();
        let ids: Vec<String> = cands.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, vec!["bar@1.3.0~1", "bar@1.3.0~0", "bar@1.2.0~0"]);
    }

    #[test]
    fn priority_breaks_ties_between_remotes() {
        let db = IndexDb::open_in_memory().unwrap();
        let low = db.upsert_remote("https://low.example.com", 1).unwrap();
        let high = db.upsert_remote("https://high.example.com", 9).unwrap();

        db.upsert_package(&low, &manifest("foo", "1.0.0", 0), "samehash")
            .unwrap();
        db.upsert_package(&high, &manifest("foo", "1.0.0", 0), "samehash")
            .unwrap();

        let name = Name::new("foo").unwrap();
        let cands = db.lookup(&name, &VersionRange::any()).unwrap();
        assert_eq!(cands[0].remote_url, "https://high.example.com");
    }

    #[test]
    fn cross_remote_hash_disagreement_is_rejected() {
        let db = IndexDb::open_in_memory().unwrap();
        let a = db.upsert_remote("https://a.example.com", 0).unwrap();
        let b = db.upsert_remote("https://b.example.com", 0).unwrap();

        db.upsert_package(&a, &manifest("foo", "1.0.0", 0), "hash-a")
            .unwrap();
        let err = db
            .upsert_package(&b, &manifest("foo", "1.0.0", 0), "hash-b")
            .unwrap_err();
        assert!(matches!(err, IndexError::IdCollision { .. }));
    }

    #[test]
    fn manifest_round_trips_through_db() {
        let db = IndexDb::open_in_memory().unwrap();
        let remote = db.upsert_remote("https://repo.example.com", 0).unwrap();
        let man = manifest("zlib", "1.2.13", 2);
        db.upsert_package(&remote, &man, "xyz").unwrap();

        let fetched = db.manifest_of(&man.id).unwrap();
        assert_eq!(fetched, man);
    }

    #[test]
    fn never_mode_requires_cache() {
        let mut db = IndexDb::open_in_memory().unwrap();
        let remote = db.upsert_remote("https://repo.example.com", 0).unwrap();
        let fetcher = Fetcher::new();
        let err = db
            .sync(&fetcher, &remote, SyncMode::Never, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, IndexError::CacheAbsent { .. }));
    }

    #[test]
    fn snapshot_contains_all_names() {
        let db = IndexDb::open_in_memory().unwrap();
        let remote = db.upsert_remote("https://repo.example.com", 0).unwrap();
        db.upsert_package(&remote, &manifest("foo", "1.0.0", 0), "a")
            .unwrap();
        db.upsert_package(&remote, &manifest("bar", "2.0.0", 0), "b")
            .unwrap();

        let universe = db.snapshot().unwrap();
        assert_eq!(universe.packages.len(), 2);
        assert_eq!(
            universe
                .candidates(&Name::new("foo").unwrap())
                .first()
                .unwrap()
                .id
                .to_string(),
            "foo@1.0.0~0"
        );
    }
}
