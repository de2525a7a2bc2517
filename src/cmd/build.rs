//! `build`, `compile-file` and `build-deps`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tracing::info;

use crate::build::{self, BuildOutcome, BuildPlan, ExecOptions, NodeStatus, PlanParams};
use crate::cancel::Cancelled;
use crate::error::{BuildFailed, TestsFailed, UserError};
use crate::manifest::DependencyExpr;
use crate::project::Project;
use crate::solve::{self, Resolved};
use crate::toolchain::Toolchain;

use super::Context;

#[derive(Debug, Clone, Default)]
pub struct BuildOpts {
    pub toolchain: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub output: Option<PathBuf>,
    pub no_tests: bool,
    pub no_apps: bool,
    pub tweaks_dir: Option<PathBuf>,
    pub keep_going: bool,
    pub node_timeout_secs: Option<u64>,
}

impl BuildOpts {
    fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get)
    }

    fn load_toolchain(&self) -> Result<Toolchain> {
        match &self.toolchain {
            Some(path) => Toolchain::load(path).map_err(Into::into),
            None => Ok(Toolchain::default()),
        }
    }

    fn out_dir(&self, project_root: &Path) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| project_root.join("_build"))
    }
}

/// Build the current project: solve, fetch, plan, execute.
pub fn build(ctx: &mut Context, opts: &BuildOpts) -> Result<()> {
    let project = Project::open(&ctx.opts.project_dir.clone())?;
    let roots = project.root_requirements(!opts.no_tests, !opts.no_apps);
    let resolved = resolve(ctx, &roots)?;

    if ctx.opts.dry_run {
        return dry_run(ctx, Some(&project), &resolved, opts);
    }

    ctx.prefetch(&resolved, opts.jobs())?;
    let toolchain = opts.load_toolchain()?;
    let plan = make_plan(ctx, Some(&project), &resolved, &toolchain, opts)?;
    run_plan(ctx, &plan, opts)
}

/// Compile only the named source files of the current project.
pub fn compile_file(ctx: &mut Context, files: &[PathBuf], opts: &BuildOpts) -> Result<()> {
    let project = Project::open(&ctx.opts.project_dir.clone())?;
    let roots = project.root_requirements(!opts.no_tests, !opts.no_apps);
    let resolved = resolve(ctx, &roots)?;

    if ctx.opts.dry_run {
        return dry_run(ctx, Some(&project), &resolved, opts);
    }

    ctx.prefetch(&resolved, opts.jobs())?;
    let toolchain = opts.load_toolchain()?;
    let full = make_plan(ctx, Some(&project), &resolved, &toolchain, opts)?;
    let plan = full.restrict_to_sources(files);
    if plan.nodes.is_empty() {
        bail!(UserError(format!(
            "none of the named files are compiled sources of this project: {}",
            files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    run_plan(ctx, &plan, opts)
}

/// Build only the declared dependencies, optionally from a deps file, and
/// optionally emit a CMake consumption file.
pub fn build_deps(
    ctx: &mut Context,
    deps_file: Option<&Path>,
    reqs: &[String],
    cmake_out: Option<&Path>,
    opts: &BuildOpts,
) -> Result<()> {
    let roots = gather_dep_roots(ctx, deps_file, reqs)?;
    if roots.is_empty() {
        bail!(UserError("no dependencies requested".to_string()));
    }
    let resolved = resolve(ctx, &roots)?;

    if ctx.opts.dry_run {
        return dry_run(ctx, None, &resolved, opts);
    }

    ctx.prefetch(&resolved, opts.jobs())?;
    let toolchain = opts.load_toolchain()?;
    let plan = make_plan(ctx, None, &resolved, &toolchain, opts)?;
    run_plan(ctx, &plan, opts)?;

    if let Some(cmake_path) = cmake_out {
        emit_cmake(ctx, &resolved, &plan, cmake_path)?;
        info!(path = %cmake_path.display(), "wrote CMake dependency file");
    }
    Ok(())
}

fn gather_dep_roots(
    ctx: &Context,
    deps_file: Option<&Path>,
    reqs: &[String],
) -> Result<Vec<DependencyExpr>> {
    if !reqs.is_empty() {
        return reqs
            .iter()
            .map(|r| DependencyExpr::parse_requirement(r).map_err(Into::into))
            .collect();
    }
    if let Some(path) = deps_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading deps file {}", path.display()))?;
        let doc = crate::manifest::json::parse_text(&text)?;
        let entries = crate::manifest::json::array(&doc, "$")?;
        let mut roots = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let s = crate::manifest::json::string(entry, &format!("$[{i}]"))?;
            roots.push(DependencyExpr::parse_requirement(s)?);
        }
        return Ok(roots);
    }
    // Fall back to the project manifest's lib dependencies.
    let project = Project::open(&ctx.opts.project_dir)?;
    Ok(project.root_requirements(false, false))
}

fn resolve(ctx: &mut Context, roots: &[DependencyExpr]) -> Result<Resolved> {
    ctx.sync_remotes()?;
    let universe = ctx.index.snapshot()?;
    let resolved = solve::solve(&universe, roots).context("resolving dependencies")?;
    info!(packages = resolved.packages.len(), "dependencies resolved");
    Ok(resolved)
}

fn make_plan(
    ctx: &Context,
    project: Option<&Project>,
    resolved: &Resolved,
    toolchain: &Toolchain,
    opts: &BuildOpts,
) -> Result<BuildPlan> {
    let project_root = project
        .map(|p| p.root.clone())
        .unwrap_or_else(|| ctx.opts.project_dir.clone());
    let plan = build::plan::plan(&PlanParams {
        project,
        resolved,
        store: &ctx.store,
        toolchain,
        out_dir: opts.out_dir(&project_root),
        want_tests: !opts.no_tests,
        want_apps: !opts.no_apps,
        tweaks_dir: opts.tweaks_dir.clone(),
        node_timeout: opts.node_timeout_secs.map(Duration::from_secs),
    })
    .context("planning the build")?;
    Ok(plan)
}

fn dry_run(
    ctx: &Context,
    project: Option<&Project>,
    resolved: &Resolved,
    opts: &BuildOpts,
) -> Result<()> {
    println!("resolved set:");
    for pkg in resolved.packages.values() {
        println!("  {}  ({})", pkg.id, pkg.remote_url);
    }

    let all_present = resolved.ids().all(|id| ctx.store.has(id));
    if !all_present {
        println!("(some packages are not in the store; skipping plan preview)");
        return Ok(());
    }

    let toolchain = opts.load_toolchain()?;
    let plan = make_plan(ctx, project, resolved, &toolchain, opts)?;
    println!("would run {} build steps:", plan.nodes.len());
    for node in &plan.nodes {
        println!("  [{}] {}", node.kind.as_str(), node.label);
    }
    Ok(())
}

fn run_plan(ctx: &Context, plan: &BuildPlan, opts: &BuildOpts) -> Result<()> {
    let cache = build::CompileCache::open(&crate::compile_cache_path(&ctx.opts.cache_root))?;
    let exec_opts = ExecOptions {
        jobs: opts.jobs(),
        keep_going: opts.keep_going,
        token: ctx.token.clone(),
        ..ExecOptions::default()
    };

    let stdout = std::io::stdout();
    let mut report = |node: &build::BuildNode, result: &build::NodeResult| {
        let mut out = stdout.lock();
        match &result.status {
            NodeStatus::Ok | NodeStatus::CachedOk => {
                if !result.stdout.is_empty() || !result.stderr.is_empty() {
                    let _ = writeln!(out, "{}:", node.label);
                }
            }
            NodeStatus::Failed { code } => {
                let _ = writeln!(
                    out,
                    "FAILED [{}] {} (exit {:?})",
                    node.kind.as_str(),
                    node.label,
                    code
                );
            }
            NodeStatus::TimedOut => {
                let _ = writeln!(out, "TIMEOUT [{}] {}", node.kind.as_str(), node.label);
            }
            NodeStatus::Skipped | NodeStatus::Cancelled => {}
        }
        if !result.stdout.is_empty() {
            let _ = write!(out, "{}", result.stdout);
        }
        if !result.stderr.is_empty() {
            let _ = write!(out, "{}", result.stderr);
        }
    };

    let outcome = build::execute(plan, &cache, &exec_opts, &mut report)?;
    summarize(&outcome)
}

fn summarize(outcome: &BuildOutcome) -> Result<()> {
    if outcome.cancelled {
        return Err(Cancelled.into());
    }
    println!(
        "{} steps: {} run, {} cached, {} failed",
        outcome.results.len(),
        outcome.spawned,
        outcome.cached,
        outcome.failed_nodes.len() + outcome.failed_tests.len(),
    );
    if !outcome.failed_nodes.is_empty() {
        return Err(BuildFailed {
            failed: outcome.failed_nodes.len(),
        }
        .into());
    }
    if !outcome.failed_tests.is_empty() {
        return Err(TestsFailed {
            failed: outcome.failed_tests.len(),
        }
        .into());
    }
    Ok(())
}

fn emit_cmake(
    ctx: &Context,
    resolved: &Resolved,
    plan: &BuildPlan,
    path: &Path,
) -> Result<()> {
    let mut text = String::from("# Generated by `mortar build-deps --cmake`.\n");
    text.push_str("add_library(mortar-deps INTERFACE)\n");

    for pkg in resolved.packages.values() {
        let root = ctx.store.path_of(&pkg.id);
        for lib in &pkg.manifest.libraries {
            let include = root.join(&lib.path).join("include");
            if include.is_dir() {
                text.push_str(&format!(
                    "target_include_directories(mortar-deps INTERFACE \"{}\")\n",
                    include.display()
                ));
            }
        }
    }
    for node in &plan.nodes {
        if node.kind == build::NodeKind::Archive {
            text.push_str(&format!(
                "target_link_libraries(mortar-deps INTERFACE \"{}\")\n",
                node.outputs[0].display()
            ));
        }
    }
    std::fs::write(path, text)?;
    Ok(())
}
