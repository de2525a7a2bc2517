//! Build planning: from a resolved set to a concrete DAG of build nodes.
//!
//! The plan is a materialized `Vec<BuildNode>` with index-based dependency
//! edges. Compile-node fingerprints digest the actual source and header
//! contents; archive, link and test nodes digest their command plus the
//! fingerprints of the nodes they consume, so every fingerprint is stable
//! at plan time and changes exactly when some transitive input changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::dym::did_you_mean;
use crate::manifest::{DepKind, LibRef, LibraryManifest};
use crate::project::Project;
use crate::solve::Resolved;
use crate::store::PackageStore;
use crate::toolchain::Toolchain;
use crate::types::{Name, PkgId};

use super::fingerprint::{self, Fingerprint};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("package {0} is not present in the store")]
    MissingPackage(PkgId),

    #[error("library {wanted} (used by {by}) is not provided by the resolved set{}",
            .suggestion.as_ref().map(|s| format!(" (did you mean \"{s}\"?)")).unwrap_or_default())]
    UnknownLibrary {
        wanted: LibRef,
        by: LibRef,
        suggestion: Option<String>,
    },

    #[error("cyclic library uses: {}", .0.join(" -> "))]
    CyclicUses(Vec<String>),

    #[error("bad source glob {pattern:?}: {source}")]
    BadGlob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Compile,
    Archive,
    Link,
    TestRun,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Compile => "compile",
            NodeKind::Archive => "archive",
            NodeKind::Link => "link",
            NodeKind::TestRun => "test-run",
        }
    }
}

/// One schedulable unit of work.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub id: usize,
    pub kind: NodeKind,
    /// Human-readable label, e.g. `compile zlib/src/inflate.c`.
    pub label: String,
    pub argv: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    /// Node IDs that must complete before this node is ready.
    pub deps: Vec<usize>,
    pub fingerprint: Fingerprint,
    /// Optional wall-clock limit for the spawned subprocess.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct BuildPlan {
    pub nodes: Vec<BuildNode>,
    pub out_dir: PathBuf,
}

impl BuildPlan {
    pub fn compile_nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Compile)
    }

    /// Restrict the plan to compile nodes whose source is in `files`, for
    /// `compile-file`. Dependencies of other kinds are dropped.
    pub fn restrict_to_sources(&self, files: &[PathBuf]) -> BuildPlan {
        let keep: Vec<BuildNode> = self
            .nodes
            .iter()
            .filter(|n| {
                n.kind == NodeKind::Compile
                    && n.inputs
                        .first()
                        .map(|src| files.iter().any(|f| same_file(f, src)))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut plan = BuildPlan {
            nodes: Vec::new(),
            out_dir: self.out_dir.clone(),
        };
        for (new_id, mut node) in keep.into_iter().enumerate() {
            node.id = new_id;
            node.deps.clear();
            plan.nodes.push(node);
        }
        plan
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Everything the planner needs.
pub struct PlanParams<'a> {
    /// The project being built; `None` plans dependencies only.
    pub project: Option<&'a Project>,
    pub resolved: &'a Resolved,
    pub store: &'a PackageStore,
    pub toolchain: &'a Toolchain,
    pub out_dir: PathBuf,
    pub want_tests: bool,
    pub want_apps: bool,
    /// Extra include root added to every compile.
    pub tweaks_dir: Option<PathBuf>,
    pub node_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SourceKind {
    HeaderPublic,
    HeaderPrivate,
    Source,
    TestSource,
    AppSource,
}

fn classify(rel: &Path) -> Option<SourceKind> {
    let ext = rel.extension()?.to_str()?;
    let is_header = matches!(ext, "h" | "hpp" | "hxx");
    let is_source = matches!(ext, "c" | "cpp" | "cxx" | "cc");
    if !is_header && !is_source {
        return None;
    }

    let mut components = rel.components();
    let first = components.next()?.as_os_str().to_str()?;
    match first {
        "include" if is_header => Some(SourceKind::HeaderPublic),
        "src" if is_header => Some(SourceKind::HeaderPrivate),
        "src" if is_source => {
            let stem = rel.file_stem()?.to_str()?;
            if stem.ends_with(".test") {
                Some(SourceKind::TestSource)
            } else if stem.ends_with(".main") {
                Some(SourceKind::AppSource)
            } else {
                Some(SourceKind::Source)
            }
        }
        _ => None,
    }
}

/// One library with its scanned sources.
struct LibTarget {
    root: PathBuf,
    manifest: LibraryManifest,
    from_project: bool,
    sources: BTreeMap<SourceKind, Vec<PathBuf>>,
}

impl LibTarget {
    fn of_kind(&self, kind: SourceKind) -> &[PathBuf] {
        self.sources.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn public_include_dir(&self) -> Option<PathBuf> {
        let dir = self.root.join("include");
        dir.is_dir().then_some(dir)
    }

    fn private_include_dir(&self) -> Option<PathBuf> {
        let dir = self.root.join("src");
        dir.is_dir().then_some(dir)
    }
}

fn scan_sources(
    root: &Path,
    manifest: &LibraryManifest,
) -> Result<BTreeMap<SourceKind, Vec<PathBuf>>, PlanError> {
    let mut globs = Vec::new();
    for pattern in &manifest.source_globs {
        globs.push(glob::Pattern::new(pattern).map_err(|source| PlanError::BadGlob {
            pattern: pattern.clone(),
            source,
        })?);
    }

    let mut out: BTreeMap<SourceKind, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields children of the root");
        if !globs.is_empty() && !globs.iter().any(|g| g.matches_path(rel)) {
            continue;
        }
        if let Some(kind) = classify(rel) {
            out.entry(kind).or_default().push(entry.path().to_path_buf());
        }
    }
    Ok(out)
}

/// Produce the build DAG for a resolved set plus (optionally) the project.
pub fn plan(params: &PlanParams<'_>) -> Result<BuildPlan, PlanError> {
    let targets = collect_targets(params)?;
    let keys: Vec<LibRef> = targets.keys().cloned().collect();
    let key_names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();

    // Resolve every `uses`/`links` edge up front, with did-you-mean on miss.
    let mut uses_regular: BTreeMap<LibRef, Vec<LibRef>> = BTreeMap::new();
    let mut uses_test: BTreeMap<LibRef, Vec<LibRef>> = BTreeMap::new();
    let mut links: BTreeMap<LibRef, Vec<LibRef>> = BTreeMap::new();
    for (key, target) in &targets {
        let (regular, test_only, link_only) = effective_uses(target);
        for wanted in regular.iter().chain(test_only.iter()).chain(link_only.iter()) {
            if !targets.contains_key(wanted) {
                let suggestion =
                    did_you_mean(&wanted.to_string(), key_names.iter().map(String::as_str))
                        .map(str::to_string);
                return Err(PlanError::UnknownLibrary {
                    wanted: wanted.clone(),
                    by: key.clone(),
                    suggestion,
                });
            }
        }
        uses_regular.insert(key.clone(), regular);
        uses_test.insert(key.clone(), test_only);
        links.insert(key.clone(), link_only);
    }

    reject_cycles(&uses_regular)?;

    let identity = params.toolchain.resolve_identity();
    debug!(identity = %identity, libraries = targets.len(), "planning build");

    let mut builder = PlanBuilder {
        params,
        targets: &targets,
        uses_regular: &uses_regular,
        uses_test: &uses_test,
        links: &links,
        identity,
        nodes: Vec::new(),
        archive_node: BTreeMap::new(),
    };

    // Pass 1: compile + archive per library.
    for key in &keys {
        builder.plan_library(key)?;
    }
    // Pass 2: apps and tests (their links consume pass-1 archives).
    for key in &keys {
        builder.plan_executables(key)?;
    }

    Ok(BuildPlan {
        nodes: builder.nodes,
        out_dir: params.out_dir.clone(),
    })
}

fn collect_targets(params: &PlanParams<'_>) -> Result<BTreeMap<LibRef, LibTarget>, PlanError> {
    let mut targets = BTreeMap::new();

    let mut add_package = |pkg_name: &Name,
                           pkg_root: &Path,
                           libs: &[LibraryManifest],
                           from_project: bool|
     -> Result<(), PlanError> {
        for lib in libs {
            let root = pkg_root.join(&lib.path);
            let key = LibRef {
                pkg: pkg_name.clone(),
                lib: lib.name.clone(),
            };
            let sources = scan_sources(&root, lib)?;
            targets.insert(
                key,
                LibTarget {
                    root,
                    manifest: lib.clone(),
                    from_project,
                    sources,
                },
            );
        }
        Ok(())
    };

    for pkg in params.resolved.packages.values() {
        let root = params.store.path_of(&pkg.id);
        if !root.is_dir() {
            return Err(PlanError::MissingPackage(pkg.id.clone()));
        }
        add_package(&pkg.id.name, &root, &pkg.manifest.libraries, false)?;
    }
    if let Some(project) = params.project {
        add_package(
            &project.manifest.id.name,
            &project.root,
            &project.manifest.libraries,
            true,
        )?;
    }
    Ok(targets)
}

/// Split a library's consumption into (regular, test-only, link-only) refs.
/// Explicit `uses`/`links` entries combine with the `using` sets of its
/// dependency expressions.
fn effective_uses(target: &LibTarget) -> (Vec<LibRef>, Vec<LibRef>, Vec<LibRef>) {
    let mut regular: BTreeSet<LibRef> = target.manifest.uses.iter().cloned().collect();
    let mut test_only: BTreeSet<LibRef> = BTreeSet::new();
    let link_only: BTreeSet<LibRef> = target.manifest.links.iter().cloned().collect();

    for dep in &target.manifest.dependencies {
        let refs = dep.using.iter().map(|lib| LibRef {
            pkg: dep.name.clone(),
            lib: lib.clone(),
        });
        match dep.kind {
            DepKind::Lib | DepKind::App => regular.extend(refs),
            DepKind::Test => test_only.extend(refs),
        }
    }
    (
        regular.into_iter().collect(),
        test_only.into_iter().collect(),
        link_only.into_iter().collect(),
    )
}

fn reject_cycles(uses: &BTreeMap<LibRef, Vec<LibRef>>) -> Result<(), PlanError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &LibRef,
        uses: &BTreeMap<LibRef, Vec<LibRef>>,
        marks: &mut BTreeMap<LibRef, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<(), PlanError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                stack.push(node.to_string());
                return Err(PlanError::CyclicUses(stack.clone()));
            }
            None => {}
        }
        marks.insert(node.clone(), Mark::Visiting);
        stack.push(node.to_string());
        if let Some(nexts) = uses.get(node) {
            for next in nexts {
                visit(next, uses, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(node.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    for node in uses.keys() {
        visit(node, uses, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

struct PlanBuilder<'a> {
    params: &'a PlanParams<'a>,
    targets: &'a BTreeMap<LibRef, LibTarget>,
    uses_regular: &'a BTreeMap<LibRef, Vec<LibRef>>,
    uses_test: &'a BTreeMap<LibRef, Vec<LibRef>>,
    links: &'a BTreeMap<LibRef, Vec<LibRef>>,
    identity: String,
    nodes: Vec<BuildNode>,
    /// Library -> its archive node, once planned.
    archive_node: BTreeMap<LibRef, usize>,
}

impl PlanBuilder<'_> {
    /// Transitive closure over regular uses, excluding `start` itself.
    fn transitive_uses(&self, start: &LibRef, include_test: bool) -> Vec<LibRef> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<LibRef> = self.uses_regular[start].clone();
        if include_test {
            queue.extend(self.uses_test[start].iter().cloned());
        }
        let mut out = Vec::new();
        while let Some(next) = queue.pop() {
            if next == *start || !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.uses_regular[&next].iter().cloned());
            out.push(next);
        }
        out.sort();
        out
    }

    /// Archives to hand the linker, dependents before dependencies:
    /// self, then every transitively used or linked library.
    fn link_closure(&self, start: &LibRef, include_test: bool) -> Vec<LibRef> {
        let mut seen = BTreeSet::new();
        let mut order = vec![start.clone()];
        seen.insert(start.clone());

        let mut frontier = vec![start.clone()];
        while let Some(cur) = frontier.pop() {
            let mut nexts: Vec<LibRef> = self.uses_regular[&cur].clone();
            nexts.extend(self.links[&cur].iter().cloned());
            if include_test && cur == *start {
                nexts.extend(self.uses_test[&cur].iter().cloned());
            }
            nexts.sort();
            for next in nexts {
                if seen.insert(next.clone()) {
                    order.push(next.clone());
                    frontier.push(next);
                }
            }
        }
        order
    }

    fn include_args(&self, key: &LibRef, for_tests: bool) -> Vec<String> {
        let target = &self.targets[key];
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(tweaks) = &self.params.tweaks_dir {
            dirs.push(tweaks.clone());
        }
        // The owning library additionally sees its private include root.
        dirs.extend(target.private_include_dir());
        dirs.extend(target.public_include_dir());
        for used in self.transitive_uses(key, for_tests) {
            dirs.extend(self.targets[&used].public_include_dir());
        }
        dirs.into_iter()
            .map(|d| format!("-I{}", d.display()))
            .collect()
    }

    /// Header files whose contents feed a compile fingerprint: the owning
    /// library's headers plus the public headers of everything used.
    fn header_inputs(&self, key: &LibRef, for_tests: bool) -> Vec<PathBuf> {
        let target = &self.targets[key];
        let mut inputs: Vec<PathBuf> = Vec::new();
        inputs.extend_from_slice(target.of_kind(SourceKind::HeaderPublic));
        inputs.extend_from_slice(target.of_kind(SourceKind::HeaderPrivate));
        for used in self.transitive_uses(key, for_tests) {
            inputs.extend_from_slice(self.targets[&used].of_kind(SourceKind::HeaderPublic));
        }
        inputs
    }

    fn object_path(&self, key: &LibRef, source: &Path) -> PathBuf {
        let target = &self.targets[key];
        let rel = source
            .strip_prefix(&target.root)
            .unwrap_or(source)
            .to_path_buf();
        let mut name = rel.as_os_str().to_os_string();
        name.push(".o");
        self.params
            .out_dir
            .join("obj")
            .join(key.pkg.as_str())
            .join(key.lib.as_str())
            .join(name)
    }

    fn push_node(
        &mut self,
        kind: NodeKind,
        label: String,
        argv: Vec<String>,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        deps: Vec<usize>,
    ) -> Result<usize, PlanError> {
        let fingerprint = if deps.is_empty() {
            fingerprint::node_fingerprint(&self.identity, &argv, &inputs)?
        } else {
            let dep_fps: Vec<Fingerprint> =
                deps.iter().map(|d| self.nodes[*d].fingerprint).collect();
            fingerprint::derived_fingerprint(&self.identity, &argv, &dep_fps)
        };
        let id = self.nodes.len();
        self.nodes.push(BuildNode {
            id,
            kind,
            label,
            argv,
            inputs,
            outputs,
            deps,
            fingerprint,
            timeout: self.params.node_timeout,
        });
        Ok(id)
    }

    fn compile_node(
        &mut self,
        key: &LibRef,
        source: &Path,
        for_tests: bool,
    ) -> Result<usize, PlanError> {
        let obj = self.object_path(key, source);
        let compiler = self.params.toolchain.compiler_for(source).to_string();

        let mut argv = vec![compiler];
        argv.extend(self.params.toolchain.compile_flags.iter().cloned());
        argv.extend(self.include_args(key, for_tests));
        argv.push("-c".to_string());
        argv.push(source.display().to_string());
        argv.push("-o".to_string());
        argv.push(obj.display().to_string());

        let mut inputs = vec![source.to_path_buf()];
        inputs.extend(self.header_inputs(key, for_tests));

        let rel = source
            .strip_prefix(&self.targets[key].root)
            .unwrap_or(source);
        self.push_node(
            NodeKind::Compile,
            format!("compile {}/{}", key.pkg, rel.display()),
            argv,
            inputs,
            vec![obj],
            Vec::new(),
        )
    }

    fn plan_library(&mut self, key: &LibRef) -> Result<(), PlanError> {
        let plain: Vec<PathBuf> = self.targets[key].of_kind(SourceKind::Source).to_vec();
        if plain.is_empty() {
            return Ok(());
        }

        let mut objs = Vec::new();
        let mut compile_ids = Vec::new();
        for source in &plain {
            let id = self.compile_node(key, source, false)?;
            objs.push(self.nodes[id].outputs[0].clone());
            compile_ids.push(id);
        }

        let archive_path = self
            .params
            .out_dir
            .join("lib")
            .join(format!("lib{}_{}.a", key.pkg, key.lib));
        let mut argv = vec![
            self.params.toolchain.archiver.clone(),
            "rcs".to_string(),
            archive_path.display().to_string(),
        ];
        argv.extend(objs.iter().map(|o| o.display().to_string()));

        let id = self.push_node(
            NodeKind::Archive,
            format!("archive {key}"),
            argv,
            objs,
            vec![archive_path],
            compile_ids,
        )?;
        self.archive_node.insert(key.clone(), id);
        Ok(())
    }

    fn plan_executables(&mut self, key: &LibRef) -> Result<(), PlanError> {
        let target = &self.targets[key];
        // Tests and apps are only built for the project itself.
        let build_apps = self.params.want_apps && target.from_project;
        let build_tests = self.params.want_tests && target.from_project;

        if build_apps {
            let sources = target.of_kind(SourceKind::AppSource).to_vec();
            for source in sources {
                self.plan_one_executable(key, &source, false)?;
            }
        }
        if build_tests {
            let sources = target.of_kind(SourceKind::TestSource).to_vec();
            for source in sources {
                let link_id = self.plan_one_executable(key, &source, true)?;
                let exe = self.nodes[link_id].outputs[0].clone();
                self.push_node(
                    NodeKind::TestRun,
                    format!(
                        "test {}",
                        exe.file_name().unwrap_or_default().to_string_lossy()
                    ),
                    vec![exe.display().to_string()],
                    vec![exe],
                    Vec::new(),
                    vec![link_id],
                )?;
            }
        }
        Ok(())
    }

    fn plan_one_executable(
        &mut self,
        key: &LibRef,
        source: &Path,
        is_test: bool,
    ) -> Result<usize, PlanError> {
        let compile_id = self.compile_node(key, source, is_test)?;
        let obj = self.nodes[compile_id].outputs[0].clone();

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("out");
        let exe_name = stem
            .trim_end_matches(".main")
            .trim_end_matches(".test")
            .to_string();
        let exe_path = if is_test {
            self.params
                .out_dir
                .join("test")
                .join(key.pkg.as_str())
                .join(&exe_name)
        } else {
            self.params.out_dir.join("bin").join(&exe_name)
        };

        let mut link_deps = vec![compile_id];
        let mut archive_paths = Vec::new();
        for lib in self.link_closure(key, is_test) {
            if let Some(&archive_id) = self.archive_node.get(&lib) {
                link_deps.push(archive_id);
                archive_paths.push(self.nodes[archive_id].outputs[0].clone());
            }
        }

        let mut argv = vec![self.params.toolchain.compiler_for(source).to_string()];
        argv.push(obj.display().to_string());
        argv.extend(archive_paths.iter().map(|a| a.display().to_string()));
        argv.extend(self.params.toolchain.link_flags.iter().cloned());
        argv.push("-o".to_string());
        argv.push(exe_path.display().to_string());

        let mut inputs = vec![obj];
        inputs.extend(archive_paths);

        self.push_node(
            NodeKind::Link,
            format!("link {}", exe_name),
            argv,
            inputs,
            vec![exe_path],
            link_deps,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solve::Resolved;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn project_with(dir: &Path, manifest: &str) -> Project {
        write(&dir.join(crate::PROJECT_MANIFEST), manifest);
        Project::open(dir).unwrap()
    }

    fn test_toolchain() -> Toolchain {
        Toolchain {
            identity: Some("test-cc 1.0".to_string()),
            ..Toolchain::default()
        }
    }

    #[test]
    fn classification_rules() {
        assert_eq!(
            classify(Path::new("include/z/z.h")),
            Some(SourceKind::HeaderPublic)
        );
        assert_eq!(
            classify(Path::new("src/detail.hpp")),
            Some(SourceKind::HeaderPrivate)
        );
        assert_eq!(classify(Path::new("src/a.c")), Some(SourceKind::Source));
        assert_eq!(
            classify(Path::new("src/a.test.cpp")),
            Some(SourceKind::TestSource)
        );
        assert_eq!(
            classify(Path::new("src/tool.main.cc")),
            Some(SourceKind::AppSource)
        );
        assert_eq!(classify(Path::new("docs/readme.md")), None);
        assert_eq!(classify(Path::new("other/a.c")), None);
    }

    fn sample_project(dir: &Path) -> Project {
        write(&dir.join("src/greet.c"), "int greet(void) { return 1; }\n");
        write(&dir.join("src/greet.h"), "int greet(void);\n");
        write(&dir.join("include/hello/api.h"), "int greet(void);\n");
        write(&dir.join("src/hello.test.c"), "int main(void) { return 0; }\n");
        write(&dir.join("src/hello.main.c"), "int main(void) { return 0; }\n");
        project_with(
            dir,
            "{ name: 'hello', version: '1.0.0', libraries: [{ name: 'hello' }] }",
        )
    }

    fn plan_sample(dir: &Path, want_tests: bool, want_apps: bool) -> BuildPlan {
        let project = sample_project(dir);
        let store = PackageStore::open(dir.join("store")).unwrap();
        let resolved = Resolved::default();
        let toolchain = test_toolchain();
        plan(&PlanParams {
            project: Some(&project),
            resolved: &resolved,
            store: &store,
            toolchain: &toolchain,
            out_dir: dir.join("_build"),
            want_tests,
            want_apps,
            tweaks_dir: None,
            node_timeout: None,
        })
        .unwrap()
    }

    #[test]
    fn plans_compile_archive_link_and_test() {
        let tmp = tempdir().unwrap();
        let plan = plan_sample(tmp.path(), true, true);

        let kinds: Vec<NodeKind> = plan.nodes.iter().map(|n| n.kind).collect();
        // 1 lib compile + archive, app compile + link, test compile + link + run.
        assert_eq!(kinds.iter().filter(|k| **k == NodeKind::Compile).count(), 3);
        assert_eq!(kinds.iter().filter(|k| **k == NodeKind::Archive).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == NodeKind::Link).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == NodeKind::TestRun).count(), 1);

        // The test-run node depends on its link, which depends on the archive.
        let run = plan
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::TestRun)
            .unwrap();
        let link = &plan.nodes[run.deps[0]];
        assert_eq!(link.kind, NodeKind::Link);
        assert!(link
            .deps
            .iter()
            .any(|d| plan.nodes[*d].kind == NodeKind::Archive));
    }

    #[test]
    fn flags_disable_tests_and_apps() {
        let tmp = tempdir().unwrap();
        let plan = plan_sample(tmp.path(), false, false);
        assert!(plan.nodes.iter().all(|n| n.kind != NodeKind::TestRun));
        assert!(plan.nodes.iter().all(|n| n.kind != NodeKind::Link));
        assert_eq!(plan.compile_nodes().count(), 1);
    }

    #[test]
    fn fingerprints_are_stable_across_plans() {
        let tmp = tempdir().unwrap();
        let a = plan_sample(tmp.path(), true, true);
        let b = plan_sample(tmp.path(), true, true);
        let fps_a: Vec<Fingerprint> = a.nodes.iter().map(|n| n.fingerprint).collect();
        let fps_b: Vec<Fingerprint> = b.nodes.iter().map(|n| n.fingerprint).collect();
        assert_eq!(fps_a, fps_b);
    }

    #[test]
    fn fingerprints_change_with_source_edits() {
        let tmp = tempdir().unwrap();
        let a = plan_sample(tmp.path(), false, false);
        write(
            &tmp.path().join("src/greet.c"),
            "int greet(void) { return 2; }\n",
        );
        let b = plan_sample(tmp.path(), false, false);
        assert_ne!(a.nodes[0].fingerprint, b.nodes[0].fingerprint);
    }

    #[test]
    fn cyclic_uses_rejected() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        write(&dir.join("a/src/a.c"), "int a;\n");
        write(&dir.join("b/src/b.c"), "int b;\n");
        let project = project_with(
            dir,
            "{ name: 'cyc', version: '1.0.0', libraries: [ \
             { name: 'a', path: 'a', uses: ['cyc/b'] }, \
             { name: 'b', path: 'b', uses: ['cyc/a'] } ] }",
        );
        let store = PackageStore::open(dir.join("store")).unwrap();
        let resolved = Resolved::default();
        let toolchain = test_toolchain();
        let err = plan(&PlanParams {
            project: Some(&project),
            resolved: &resolved,
            store: &store,
            toolchain: &toolchain,
            out_dir: dir.join("_build"),
            want_tests: false,
            want_apps: false,
            tweaks_dir: None,
            node_timeout: None,
        })
        .unwrap_err();
        assert!(matches!(err, PlanError::CyclicUses(_)));
    }

    #[test]
    fn unknown_use_suggests_alternative() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        write(&dir.join("src/a.c"), "int a;\n");
        let project = project_with(
            dir,
            "{ name: 'solo', version: '1.0.0', libraries: [ \
             { name: 'solo', uses: ['solo/sol'] } ] }",
        );
        let store = PackageStore::open(dir.join("store")).unwrap();
        let resolved = Resolved::default();
        let toolchain = test_toolchain();
        let err = plan(&PlanParams {
            project: Some(&project),
            resolved: &resolved,
            store: &store,
            toolchain: &toolchain,
            out_dir: dir.join("_build"),
            want_tests: false,
            want_apps: false,
            tweaks_dir: None,
            node_timeout: None,
        })
        .unwrap_err();
        match err {
            PlanError::UnknownLibrary { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("solo/solo"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
