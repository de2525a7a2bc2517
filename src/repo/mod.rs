//! Local package repositories.
//!
//! A repository is a directory serving the same wire format remote hosts do:
//! a `repo.db` catalog snapshot at the root and archives under
//! `pkg/<name>/<version>~<rev>/pkg.tgz`. Pointing a `file://` remote at one
//! makes it consumable by the index and fetcher unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::index::migrate::{apply_migrations, MigrateError, MigrationStep};
use crate::manifest::PackageManifest;
use crate::sdist::{self, SdistError};
use crate::types::{Name, PkgId, Version};

const REPO_META: &str = "repo_meta";

const MIGRATIONS: &[MigrationStep] = &[|tx| {
    tx.execute_batch(
        "CREATE TABLE repo_info (name TEXT NOT NULL);
         CREATE TABLE packages (
             name TEXT NOT NULL,
             version TEXT NOT NULL,
             revision INTEGER NOT NULL,
             manifest TEXT NOT NULL,
             archive_sha256 TEXT NOT NULL,
             PRIMARY KEY (name, version, revision)
         );",
    )
}];

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error(transparent)]
    Sdist(#[from] SdistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} already exists in the repository")]
    AlreadyExists(PkgId),

    #[error("{0} is not in the repository")]
    NotFound(PkgId),

    #[error("no repository at {0} (missing repo.db)")]
    NotARepo(String),
}

/// Collision policy for operations that may hit an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    Replace,
    #[default]
    Fail,
    Ignore,
}

/// Absence policy for operations that may miss their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfMissing {
    #[default]
    Fail,
    Ignore,
}

pub struct LocalRepo {
    root: PathBuf,
    conn: Connection,
}

impl LocalRepo {
    /// Create a new repository directory with an empty catalog.
    pub fn init(root: &Path, name: &str) -> Result<Self, RepoError> {
        fs::create_dir_all(root)?;
        let mut conn = Connection::open(root.join("repo.db"))?;
        apply_migrations(&mut conn, REPO_META, MIGRATIONS)?;
        conn.execute("DELETE FROM repo_info", [])?;
        conn.execute("INSERT INTO repo_info (name) VALUES (?1)", [name])?;
        info!(path = %root.display(), name, "initialized repository");
        Ok(Self {
            root: root.to_path_buf(),
            conn,
        })
    }

    /// Open an existing repository.
    pub fn open(root: &Path) -> Result<Self, RepoError> {
        let db = root.join("repo.db");
        if !db.is_file() {
            return Err(RepoError::NotARepo(root.display().to_string()));
        }
        let mut conn = Connection::open(db)?;
        apply_migrations(&mut conn, REPO_META, MIGRATIONS)?;
        Ok(Self {
            root: root.to_path_buf(),
            conn,
        })
    }

    pub fn name(&self) -> Result<String, RepoError> {
        let name = self
            .conn
            .query_row("SELECT name FROM repo_info", [], |r| r.get(0))
            .optional()?
            .unwrap_or_default();
        Ok(name)
    }

    fn archive_path(&self, id: &PkgId) -> PathBuf {
        self.root
            .join("pkg")
            .join(id.name.as_str())
            .join(id.dir_name())
            .join("pkg.tgz")
    }

    fn has(&self, id: &PkgId) -> Result<bool, RepoError> {
        let n: u32 = self.conn.query_row(
            "SELECT count(*) FROM packages WHERE name = ?1 AND version = ?2 AND revision = ?3",
            params![id.name.as_str(), id.version.to_string(), id.revision],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Import an sdist archive, reading its manifest and copying the tarball
    /// into the repository layout.
    pub fn import(&self, sdist_path: &Path, if_exists: IfExists) -> Result<PkgId, RepoError> {
        let manifest = sdist::read_manifest(sdist_path)?;
        let id = manifest.id.clone();

        if self.has(&id)? {
            match if_exists {
                IfExists::Fail => return Err(RepoError::AlreadyExists(id)),
                IfExists::Ignore => return Ok(id),
                IfExists::Replace => {}
            }
        }

        let dest = self.archive_path(&id);
        fs::create_dir_all(dest.parent().expect("archive path has a parent"))?;
        fs::copy(sdist_path, &dest)?;
        let sha = sdist::sha256_file(&dest)?;

        self.conn.execute(
            "INSERT OR REPLACE INTO packages (name, version, revision, manifest, archive_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.name.as_str(),
                id.version.to_string(),
                id.revision,
                manifest.to_json_string(),
                sha,
            ],
        )?;
        info!(id = %id, "imported package");
        Ok(id)
    }

    /// Drop one publication from the catalog and remove its archive.
    pub fn remove(&self, id: &PkgId, if_missing: IfMissing) -> Result<(), RepoError> {
        let n = self.conn.execute(
            "DELETE FROM packages WHERE name = ?1 AND version = ?2 AND revision = ?3",
            params![id.name.as_str(), id.version.to_string(), id.revision],
        )?;
        if n == 0 {
            return match if_missing {
                IfMissing::Fail => Err(RepoError::NotFound(id.clone())),
                IfMissing::Ignore => Ok(()),
            };
        }
        let archive = self.archive_path(id);
        if archive.exists() {
            fs::remove_file(&archive)?;
        }
        Ok(())
    }

    /// Every catalogued publication, ascending by (name, version, revision).
    pub fn list(&self) -> Result<Vec<PkgId>, RepoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version, revision FROM packages")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
            ))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            let (name, version, revision) = row?;
            let (Ok(name), Ok(version)) = (Name::new(name), Version::parse(&version)) else {
                continue;
            };
            ids.push(PkgId::new(name, version, revision));
        }
        ids.sort();
        Ok(ids)
    }

    /// Re-verify that every advertised archive exists and hashes to its
    /// catalog row. Returns human-readable problems; empty means valid.
    pub fn validate(&self) -> Result<Vec<String>, RepoError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, version, revision, archive_sha256 FROM packages",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;

        let mut problems = Vec::new();
        for row in rows {
            let (name, version, revision, expected) = row?;
            let display = format!("{name}@{version}~{revision}");
            let (Ok(name), Ok(version)) = (Name::new(name), Version::parse(&version)) else {
                problems.push(format!("{display}: malformed catalog row"));
                continue;
            };
            let id = PkgId::new(name, version, revision);
            let archive = self.archive_path(&id);
            if !archive.is_file() {
                problems.push(format!("{id}: archive missing at {}", archive.display()));
                continue;
            }
            let actual = sdist::sha256_file(&archive)?;
            if actual != expected {
                problems.push(format!(
                    "{id}: archive hash {actual} does not match catalog ({expected})"
                ));
            }
        }
        Ok(problems)
    }

    /// The `file://` URL remotes use to address this repository.
    pub fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_sdist(dir: &Path, name: &str, version: &str) -> PathBuf {
        let proj = dir.join(format!("{name}-proj"));
        fs::create_dir_all(proj.join("src")).unwrap();
        fs::write(
            proj.join(crate::PROJECT_MANIFEST),
            format!("{{ name: '{name}', version: '{version}', libraries: [{{ name: '{name}' }}] }}"),
        )
        .unwrap();
        fs::write(proj.join("src/a.c"), "int a;\n").unwrap();
        let manifest = PackageManifest::load(&proj.join(crate::PROJECT_MANIFEST)).unwrap();
        sdist::create(&proj, &manifest, &dir.join("dist")).unwrap()
    }

    #[test]
    fn init_import_list_validate() {
        let tmp = tempdir().unwrap();
        let repo = LocalRepo::init(&tmp.path().join("repo"), "testing").unwrap();
        assert_eq!(repo.name().unwrap(), "testing");

        let tgz = sample_sdist(tmp.path(), "zlib", "1.2.13");
        let id = repo.import(&tgz, IfExists::Fail).unwrap();
        assert_eq!(id.to_string(), "zlib@1.2.13~0");

        assert_eq!(repo.list().unwrap(), vec![id.clone()]);
        assert!(repo.validate().unwrap().is_empty());

        // Archive landed in wire-format layout.
        assert!(tmp
            .path()
            .join("repo/pkg/zlib/1.2.13~0/pkg.tgz")
            .is_file());
    }

    #[test]
    fn if_exists_policies() {
        let tmp = tempdir().unwrap();
        let repo = LocalRepo::init(&tmp.path().join("repo"), "t").unwrap();
        let tgz = sample_sdist(tmp.path(), "fmt", "10.0.0");

        repo.import(&tgz, IfExists::Fail).unwrap();
        assert!(matches!(
            repo.import(&tgz, IfExists::Fail),
            Err(RepoError::AlreadyExists(_))
        ));
        repo.import(&tgz, IfExists::Ignore).unwrap();
        repo.import(&tgz, IfExists::Replace).unwrap();
    }

    #[test]
    fn remove_respects_if_missing() {
        let tmp = tempdir().unwrap();
        let repo = LocalRepo::init(&tmp.path().join("repo"), "t").unwrap();
        let id: PkgId = "ghost@1.0.0~0".parse().unwrap();

        assert!(matches!(
            repo.remove(&id, IfMissing::Fail),
            Err(RepoError::NotFound(_))
        ));
        repo.remove(&id, IfMissing::Ignore).unwrap();
    }

    #[test]
    fn validate_reports_corruption() {
        let tmp = tempdir().unwrap();
        let repo = LocalRepo::init(&tmp.path().join("repo"), "t").unwrap();
        let tgz = sample_sdist(tmp.path(), "brotli", "1.1.0");
        let id = repo.import(&tgz, IfExists::Fail).unwrap();

        fs::write(
            tmp.path().join("repo/pkg/brotli/1.1.0~0/pkg.tgz"),
            "corrupted",
        )
        .unwrap();
        let problems = repo.validate().unwrap();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains(&id.to_string()));
    }
}
