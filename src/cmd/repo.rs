//! `repo {init,import,remove,validate,ls}`: managing a local repository.

use std::path::Path;

use anyhow::{bail, Context as _, Result};

use crate::error::UserError;
use crate::repo::{IfExists, IfMissing, LocalRepo};
use crate::types::PkgId;

pub fn init(dir: &Path, name: &str, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("would initialize repository {name:?} at {}", dir.display());
        return Ok(());
    }
    let repo = LocalRepo::init(dir, name).context("initializing repository")?;
    println!("initialized {} ({})", repo.url(), name);
    Ok(())
}

pub fn import(dir: &Path, sdists: &[std::path::PathBuf], if_exists: IfExists, dry_run: bool) -> Result<()> {
    if sdists.is_empty() {
        bail!(UserError("no sdist files given".to_string()));
    }
    let repo = LocalRepo::open(dir)?;
    for sdist in sdists {
        if dry_run {
            println!("would import {}", sdist.display());
            continue;
        }
        let id = repo
            .import(sdist, if_exists)
            .with_context(|| format!("importing {}", sdist.display()))?;
        println!("imported {id}");
    }
    Ok(())
}

pub fn remove(dir: &Path, ids: &[String], if_missing: IfMissing, dry_run: bool) -> Result<()> {
    let repo = LocalRepo::open(dir)?;
    for raw in ids {
        let id: PkgId = raw
            .parse()
            .with_context(|| format!("bad package ID {raw:?}"))?;
        if dry_run {
            println!("would remove {id}");
            continue;
        }
        repo.remove(&id, if_missing)?;
        println!("removed {id}");
    }
    Ok(())
}

pub fn validate(dir: &Path) -> Result<()> {
    let repo = LocalRepo::open(dir)?;
    let problems = repo.validate()?;
    if problems.is_empty() {
        println!("repository is valid ({} packages)", repo.list()?.len());
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    bail!(UserError(format!(
        "repository validation found {} problem(s)",
        problems.len()
    )));
}

pub fn ls(dir: &Path) -> Result<()> {
    let repo = LocalRepo::open(dir)?;
    for id in repo.list()? {
        println!("{id}");
    }
    Ok(())
}
