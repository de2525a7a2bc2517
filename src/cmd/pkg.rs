//! `pkg {create,search,prefetch,solve,repo ...}`.

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};

use crate::dym::did_you_mean;
use crate::error::UserError;
use crate::index::SyncMode;
use crate::manifest::DependencyExpr;
use crate::project::Project;
use crate::repo::IfMissing;
use crate::sdist;
use crate::solve;
use crate::types::{PkgId, VersionRange};

use super::Context;

/// Package the current project as an sdist tarball.
pub fn create(ctx: &Context, output: Option<&PathBuf>) -> Result<PathBuf> {
    let project = Project::open(&ctx.opts.project_dir)?;
    let out_dir = output.cloned().unwrap_or_else(|| project.root.clone());
    if ctx.opts.dry_run {
        println!(
            "would package {} into {}",
            project.manifest.id,
            out_dir.display()
        );
        return Ok(out_dir);
    }
    let path = sdist::create(&project.root, &project.manifest, &out_dir)
        .context("creating source distribution")?;
    println!("created {}", path.display());
    Ok(path)
}

/// Query the remote index by name substring.
pub fn search(ctx: &mut Context, pattern: &str) -> Result<()> {
    ctx.sync_remotes()?;
    let hits = ctx.index.search(pattern)?;
    if hits.is_empty() {
        let names = ctx.index.all_names()?;
        if let Some(s) = did_you_mean(pattern, names.iter().map(String::as_str)) {
            bail!(UserError(format!(
                "no packages match {pattern:?} (did you mean {s:?}?)"
            )));
        }
        bail!(UserError(format!("no packages match {pattern:?}")));
    }
    for cand in hits {
        println!("{}  ({})", cand.id, cand.remote_url);
    }
    Ok(())
}

/// Populate the store for explicit package IDs.
pub fn prefetch(ctx: &mut Context, ids: &[String]) -> Result<()> {
    ctx.sync_remotes()?;

    let mut parsed = Vec::new();
    for raw in ids {
        let id: PkgId = raw
            .parse()
            .with_context(|| format!("bad package ID {raw:?}"))?;
        parsed.push(id);
    }

    let mut resolved = solve::Resolved::default();
    for id in parsed {
        let cands = ctx
            .index
            .lookup(&id.name, &VersionRange::exact(&id.version))?;
        let Some(cand) = cands.into_iter().find(|c| c.id == id) else {
            let names = ctx.index.all_names()?;
            let mut msg = format!("{id} is not in the index");
            if let Some(s) = did_you_mean(id.name.as_str(), names.iter().map(String::as_str)) {
                msg.push_str(&format!(" (did you mean {s:?}?)"));
            }
            bail!(UserError(msg));
        };
        resolved.packages.insert(
            cand.id.name.clone(),
            solve::ResolvedPkg {
                id: cand.id.clone(),
                remote_url: cand.remote_url.clone(),
                manifest: cand.manifest.clone(),
                archive_sha256: cand.archive_sha256.clone(),
            },
        );
    }

    if ctx.opts.dry_run {
        for pkg in resolved.packages.values() {
            println!("would fetch {}", pkg.id);
        }
        return Ok(());
    }

    ctx.prefetch(&resolved, num_cpus::get())?;
    for pkg in resolved.packages.values() {
        println!("{} -> {}", pkg.id, ctx.store.path_of(&pkg.id).display());
    }
    Ok(())
}

/// Resolve requirements and print the set.
pub fn solve_requirements(ctx: &mut Context, reqs: &[String]) -> Result<()> {
    if reqs.is_empty() {
        bail!(UserError("no requirements given".to_string()));
    }
    let roots: Vec<DependencyExpr> = reqs
        .iter()
        .map(|r| DependencyExpr::parse_requirement(r).map_err(Into::into))
        .collect::<Result<_>>()?;

    ctx.sync_remotes()?;
    let universe = ctx.index.snapshot()?;
    let resolved = solve::solve(&universe, &roots).context("resolving requirements")?;
    for pkg in resolved.packages.values() {
        println!("{}  ({})", pkg.id, pkg.remote_url);
    }
    Ok(())
}

/// `pkg repo add <url>`.
pub fn repo_add(ctx: &mut Context, url: &str, priority: i64) -> Result<()> {
    if ctx.opts.dry_run {
        println!("would add remote {url}");
        return Ok(());
    }
    let remote = ctx.index.upsert_remote(url, priority)?;
    let token = ctx.token.clone();
    ctx.index
        .sync(&ctx.fetcher, &remote, SyncMode::Always, &token)
        .with_context(|| format!("syncing new remote {url}"))?;
    println!("added {url}");
    Ok(())
}

/// `pkg repo remove <url>`.
pub fn repo_remove(ctx: &mut Context, url: &str) -> Result<()> {
    if ctx.opts.dry_run {
        println!("would remove remote {url}");
        return Ok(());
    }
    let removed = ctx.index.remove_remote(url)?;
    if !removed && ctx.opts.if_missing == IfMissing::Fail {
        bail!(UserError(format!("{url} is not a registered remote")));
    }
    Ok(())
}

/// `pkg repo update`: unconditional re-sync of all remotes.
pub fn repo_update(ctx: &mut Context) -> Result<()> {
    let remotes = ctx.index.remotes()?;
    for remote in remotes {
        let token = ctx.token.clone();
        ctx.index
            .sync(&ctx.fetcher, &remote, SyncMode::Always, &token)
            .with_context(|| format!("syncing {}", remote.url))?;
        println!("updated {}", remote.url);
    }
    Ok(())
}

/// `pkg repo ls`.
pub fn repo_ls(ctx: &Context) -> Result<()> {
    for remote in ctx.index.remotes()? {
        println!("{}  priority={}", remote.url, remote.priority);
    }
    Ok(())
}
