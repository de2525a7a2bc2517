//! mortar CLI front-end.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use mortar::cmd::{self, build::BuildOpts, Context, GlobalOpts};
use mortar::error;
use mortar::index::SyncMode;
use mortar::repo::{IfExists, IfMissing};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RepoSyncModeArg {
    Always,
    CachedOkay,
    Never,
}

impl From<RepoSyncModeArg> for SyncMode {
    fn from(v: RepoSyncModeArg) -> Self {
        match v {
            RepoSyncModeArg::Always => SyncMode::Always,
            RepoSyncModeArg::CachedOkay => SyncMode::CachedOkay,
            RepoSyncModeArg::Never => SyncMode::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IfExistsArg {
    Replace,
    Fail,
    Ignore,
}

impl From<IfExistsArg> for IfExists {
    fn from(v: IfExistsArg) -> Self {
        match v {
            IfExistsArg::Replace => IfExists::Replace,
            IfExistsArg::Fail => IfExists::Fail,
            IfExistsArg::Ignore => IfExists::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IfMissingArg {
    Fail,
    Ignore,
}

impl From<IfMissingArg> for IfMissing {
    fn from(v: IfMissingArg) -> Self {
        match v {
            IfMissingArg::Fail => IfMissing::Fail,
            IfMissingArg::Ignore => IfMissing::Ignore,
        }
    }
}

#[derive(Parser)]
#[command(name = "mortar")]
#[command(author, version, about = "Source-based package manager and build driver for C/C++")]
struct Cli {
    /// Override the store/index root
    #[arg(long, global = true, value_name = "PATH")]
    crs_cache_dir: Option<PathBuf>,

    /// Log verbosity
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Plan only; perform no mutations
    #[arg(long, global = true)]
    dry_run: bool,

    /// Index sync policy
    #[arg(long, global = true, value_enum, default_value = "always")]
    repo_sync_mode: RepoSyncModeArg,

    /// Add an ad-hoc remote for this invocation (repeatable)
    #[arg(long, global = true, value_name = "URL")]
    use_repo: Vec<String>,

    /// Disable the built-in default remote
    #[arg(long, global = true)]
    no_default_repo: bool,

    /// Collision policy
    #[arg(long, global = true, value_enum, default_value = "fail")]
    if_exists: IfExistsArg,

    /// Absence policy
    #[arg(long, global = true, value_enum, default_value = "fail")]
    if_missing: IfMissingArg,

    /// Project root (default: current directory)
    #[arg(long, global = true, value_name = "PATH")]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct BuildFlags {
    /// Toolchain descriptor file
    #[arg(long, value_name = "FILE")]
    toolchain: Option<PathBuf>,

    /// Parallel build jobs (default: host cores)
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    /// Artifact output directory (default: <project>/_build)
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Skip compiling and running tests
    #[arg(long)]
    no_tests: bool,

    /// Skip building applications
    #[arg(long)]
    no_apps: bool,

    /// Extra include root applied to every compilation
    #[arg(long, value_name = "DIR")]
    tweaks_dir: Option<PathBuf>,

    /// Continue building nodes unrelated to failures
    #[arg(long)]
    keep_going: bool,

    /// Per-step wall-clock limit, in seconds
    #[arg(long, value_name = "SECS")]
    step_timeout: Option<u64>,
}

impl From<&BuildFlags> for BuildOpts {
    fn from(f: &BuildFlags) -> Self {
        BuildOpts {
            toolchain: f.toolchain.clone(),
            jobs: f.jobs,
            output: f.output.clone(),
            no_tests: f.no_tests,
            no_apps: f.no_apps,
            tweaks_dir: f.tweaks_dir.clone(),
            keep_going: f.keep_going,
            node_timeout_secs: f.step_timeout,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the current project
    Build {
        #[command(flatten)]
        flags: BuildFlags,
    },
    /// Compile named files only
    CompileFile {
        /// Source files to compile
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: BuildFlags,
    },
    /// Build only declared dependencies
    BuildDeps {
        /// Requirements, e.g. zlib@^1.2 (defaults to the project manifest)
        reqs: Vec<String>,
        /// JSON5 file holding a list of requirement strings
        #[arg(long, value_name = "FILE")]
        deps_file: Option<PathBuf>,
        /// Emit a CMake consumption file at this path
        #[arg(long, value_name = "FILE")]
        cmake: Option<PathBuf>,
        #[command(flatten)]
        flags: BuildFlags,
    },
    /// Package operations
    Pkg {
        #[command(subcommand)]
        command: PkgCommands,
    },
    /// Manage a local package repository
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
enum PkgCommands {
    /// Package the current project as an sdist
    Create {
        /// Where to write the archive (default: project root)
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Query the remote index
    Search {
        pattern: String,
    },
    /// Populate the store for package IDs
    Prefetch {
        /// IDs like zlib@1.2.13~0
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Resolve requirements and print the set
    Solve {
        #[arg(required = true)]
        reqs: Vec<String>,
    },
    /// Manage configured remotes
    Repo {
        #[command(subcommand)]
        command: PkgRepoCommands,
    },
}

#[derive(Subcommand)]
enum PkgRepoCommands {
    /// Register a remote
    Add {
        url: String,
        /// Higher priority wins ties for the same package ID
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Unregister a remote
    Remove { url: String },
    /// Re-sync all remotes now
    Update,
    /// List configured remotes
    Ls,
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Create an empty repository directory
    Init {
        dir: PathBuf,
        #[arg(long)]
        name: String,
    },
    /// Import sdist archives
    Import {
        dir: PathBuf,
        #[arg(required = true)]
        sdists: Vec<PathBuf>,
    },
    /// Remove publications by ID
    Remove {
        dir: PathBuf,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Check every archive against the catalog
    Validate { dir: PathBuf },
    /// List catalogued publications
    Ls { dir: PathBuf },
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            // Bad arguments are a user error (exit 1), not clap's default 2.
            let _ = e.print();
            return 1;
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return 0;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("mortar: error: {e:#}");
            error::classify(&e).exit_code()
        }
    }
}

fn global_opts(cli: &Cli) -> GlobalOpts {
    GlobalOpts {
        cache_root: cli
            .crs_cache_dir
            .clone()
            .unwrap_or_else(mortar::default_cache_root),
        sync_mode: cli.repo_sync_mode.into(),
        dry_run: cli.dry_run,
        use_repos: cli.use_repo.clone(),
        no_default_repo: cli.no_default_repo,
        if_exists: cli.if_exists.into(),
        if_missing: cli.if_missing.into(),
        project_dir: cli
            .project
            .clone()
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

fn run(cli: Cli) -> Result<()> {
    let opts = global_opts(&cli);
    let dry_run = opts.dry_run;
    let if_exists = opts.if_exists;
    let if_missing = opts.if_missing;

    match &cli.command {
        Commands::Build { flags } => {
            let mut ctx = Context::new(opts)?;
            cmd::build::build(&mut ctx, &flags.into())
        }
        Commands::CompileFile { files, flags } => {
            let mut ctx = Context::new(opts)?;
            cmd::build::compile_file(&mut ctx, files, &flags.into())
        }
        Commands::BuildDeps {
            reqs,
            deps_file,
            cmake,
            flags,
        } => {
            let mut ctx = Context::new(opts)?;
            cmd::build::build_deps(
                &mut ctx,
                deps_file.as_deref(),
                reqs,
                cmake.as_deref(),
                &flags.into(),
            )
        }
        Commands::Pkg { command } => match command {
            PkgCommands::Create { output } => {
                let ctx = Context::new(opts)?;
                cmd::pkg::create(&ctx, output.as_ref()).map(|_| ())
            }
            PkgCommands::Search { pattern } => {
                let mut ctx = Context::new(opts)?;
                cmd::pkg::search(&mut ctx, pattern)
            }
            PkgCommands::Prefetch { ids } => {
                let mut ctx = Context::new(opts)?;
                cmd::pkg::prefetch(&mut ctx, ids)
            }
            PkgCommands::Solve { reqs } => {
                let mut ctx = Context::new(opts)?;
                cmd::pkg::solve_requirements(&mut ctx, reqs)
            }
            PkgCommands::Repo { command } => {
                let mut ctx = Context::new(opts)?;
                match command {
                    PkgRepoCommands::Add { url, priority } => {
                        cmd::pkg::repo_add(&mut ctx, url, *priority)
                    }
                    PkgRepoCommands::Remove { url } => cmd::pkg::repo_remove(&mut ctx, url),
                    PkgRepoCommands::Update => cmd::pkg::repo_update(&mut ctx),
                    PkgRepoCommands::Ls => cmd::pkg::repo_ls(&ctx),
                }
            }
        },
        Commands::Repo { command } => match command {
            RepoCommands::Init { dir, name } => cmd::repo::init(dir, name, dry_run),
            RepoCommands::Import { dir, sdists } => {
                cmd::repo::import(dir, sdists, if_exists, dry_run)
            }
            RepoCommands::Remove { dir, ids } => cmd::repo::remove(dir, ids, if_missing, dry_run),
            RepoCommands::Validate { dir } => cmd::repo::validate(dir),
            RepoCommands::Ls { dir } => cmd::repo::ls(dir),
        },
    }
}
