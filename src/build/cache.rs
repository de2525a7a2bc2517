//! Compile cache: fingerprint → output hash.
//!
//! Append-only. A hit means the exact command with the exact inputs already
//! ran successfully; the executor re-uses the outputs on disk without
//! spawning the compiler.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::index::migrate::{apply_migrations, MigrateError, MigrationStep};

use super::fingerprint::Fingerprint;

const CACHE_META: &str = "cache_meta";

const MIGRATIONS: &[MigrationStep] = &[|tx| {
    tx.execute_batch(
        "CREATE TABLE entries (
             fingerprint TEXT PRIMARY KEY,
             output_hash TEXT NOT NULL,
             recorded_at INTEGER NOT NULL
         );",
    )
}];

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CompileCache {
    conn: Connection,
}

impl CompileCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        apply_migrations(&mut conn, CACHE_META, MIGRATIONS)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let mut conn = Connection::open_in_memory()?;
        apply_migrations(&mut conn, CACHE_META, MIGRATIONS)?;
        Ok(Self { conn })
    }

    pub fn lookup(&self, fp: Fingerprint) -> Result<Option<String>, CacheError> {
        let hit = self
            .conn
            .query_row(
                "SELECT output_hash FROM entries WHERE fingerprint = ?1",
                [fp.to_hex()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit)
    }

    /// Record a successful run. First writer wins; the binding for one
    /// fingerprint never changes afterwards.
    pub fn record(&self, fp: Fingerprint, output_hash: &str) -> Result<(), CacheError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.conn.execute(
            "INSERT OR IGNORE INTO entries (fingerprint, output_hash, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![fp.to_hex(), output_hash, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::fingerprint::node_fingerprint;
    use tempfile::tempdir;

    fn fp(tag: &str) -> Fingerprint {
        let dir = tempdir().unwrap();
        let f = dir.path().join("x");
        std::fs::write(&f, tag).unwrap();
        node_fingerprint(tag, &[], &[f]).unwrap()
    }

    #[test]
    fn lookup_miss_then_hit() {
        let cache = CompileCache::open_in_memory().unwrap();
        let key = fp("one");
        assert!(cache.lookup(key).unwrap().is_none());

        cache.record(key, "out-hash").unwrap();
        assert_eq!(cache.lookup(key).unwrap().as_deref(), Some("out-hash"));
    }

    #[test]
    fn bindings_are_immutable() {
        let cache = CompileCache::open_in_memory().unwrap();
        let key = fp("two");
        cache.record(key, "first").unwrap();
        cache.record(key, "second").unwrap();
        assert_eq!(cache.lookup(key).unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn persists_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compile-cache.db");
        let key = fp("three");

        {
            let cache = CompileCache::open(&path).unwrap();
            cache.record(key, "hash").unwrap();
        }
        let cache = CompileCache::open(&path).unwrap();
        assert_eq!(cache.lookup(key).unwrap().as_deref(), Some("hash"));
    }
}
