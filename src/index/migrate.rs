//! Versioned schema migrations for SQLite databases.
//!
//! A database carries its schema version in a one-row meta table. Opening a
//! database applies every migration step past the stored version, each step
//! inside its own transaction together with the version bump, so a crash
//! between steps leaves a consistent, resumable database.

use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid meta table name {0:?}")]
    BadMetaName(String),

    #[error(
        "database schema version {found} is newer than this build understands ({known}); \
         upgrade mortar or delete the database"
    )]
    FutureVersion { found: u32, known: u32 },
}

/// One migration step. Runs inside an exclusive transaction.
pub type MigrationStep = fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>;

fn check_meta_name(meta: &str) -> Result<(), MigrateError> {
    let ok = !meta.is_empty()
        && meta
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MigrateError::BadMetaName(meta.to_string()))
    }
}

/// Read the stored schema version: `None` when the meta table is absent.
pub fn migration_version(conn: &Connection, meta: &str) -> Result<Option<u32>, MigrateError> {
    check_meta_name(meta)?;
    let exists: u32 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [meta],
        |r| r.get(0),
    )?;
    if exists == 0 {
        return Ok(None);
    }
    let version: u32 = conn.query_row(&format!("SELECT version FROM {meta}"), [], |r| r.get(0))?;
    Ok(Some(version))
}

/// Apply every step past the stored version. Returns the number of steps run.
pub fn apply_migrations(
    conn: &mut Connection,
    meta: &str,
    steps: &[MigrationStep],
) -> Result<usize, MigrateError> {
    check_meta_name(meta)?;

    let stored = match migration_version(conn, meta)? {
        Some(v) => v,
        None => {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {meta} (version INTEGER NOT NULL);
                 INSERT INTO {meta} (version) VALUES (0);"
            ))?;
            0
        }
    };

    let known = steps.len() as u32;
    if stored > known {
        return Err(MigrateError::FutureVersion {
            found: stored,
            known,
        });
    }

    let mut applied = 0usize;
    for (i, step) in steps.iter().enumerate().skip(stored as usize) {
        let tx = conn.transaction()?;
        step(&tx)?;
        tx.execute(
            &format!("UPDATE {meta} SET version = ?1"),
            [(i + 1) as u32],
        )?;
        tx.commit()?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_one(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch(
            "CREATE TABLE foo (bar TEXT);
             CREATE TABLE baz (quux INTEGER);",
        )
    }

    fn step_two(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute_batch("ALTER TABLE foo ADD COLUMN extra INTEGER")
    }

    #[test]
    fn runs_simple_migrations() {
        let mut conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&mut conn, "test_meta", &[step_one]).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(migration_version(&conn, "test_meta").unwrap(), Some(1));

        conn.execute_batch(
            "INSERT INTO foo VALUES ('I am a string');
             INSERT INTO baz VALUES (42);",
        )
        .unwrap();
    }

    #[test]
    fn reopen_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");

        let mut conn = Connection::open(&path).unwrap();
        assert_eq!(
            apply_migrations(&mut conn, "test_meta", &[step_one, step_two]).unwrap(),
            2
        );
        drop(conn);

        let mut conn = Connection::open(&path).unwrap();
        assert_eq!(migration_version(&conn, "test_meta").unwrap(), Some(2));
        assert_eq!(
            apply_migrations(&mut conn, "test_meta", &[step_one, step_two]).unwrap(),
            0
        );
    }

    #[test]
    fn applies_only_missing_suffix() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, "m", &[step_one]).unwrap();
        let applied = apply_migrations(&mut conn, "m", &[step_one, step_two]).unwrap();
        assert_eq!(applied, 1);

        // Column from step_two exists now.
        conn.execute("INSERT INTO foo (bar, extra) VALUES ('x', 1)", [])
            .unwrap();
    }

    #[test]
    fn future_version_is_an_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, "m", &[step_one, step_two]).unwrap();
        let err = apply_migrations(&mut conn, "m", &[step_one]).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::FutureVersion { found: 2, known: 1 }
        ));
    }

    #[test]
    fn meta_name_is_validated() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = apply_migrations(&mut conn, "bad name; --", &[]).unwrap_err();
        assert!(matches!(err, MigrateError::BadMetaName(_)));
    }
}
