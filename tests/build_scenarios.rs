//! End-to-end build scenarios driven through the library API with a fake
//! toolchain, so no real compiler is needed.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mortar::build::{self, ExecOptions, PlanParams};
use mortar::project::Project;
use mortar::solve::Resolved;
use mortar::store::PackageStore;
use mortar::toolchain::Toolchain;

/// Install a shell-script "compiler" and "archiver" into `dir`.
///
/// Compiling copies the source into the object (so markers flow through);
/// linking writes a runnable script whose exit code comes from any
/// `TEST_EXIT_CODE <n>` marker found in its inputs. Sources containing
/// `SYNTAX_ERROR` fail to compile. The archiver concatenates its inputs.
fn fake_toolchain(dir: &Path) -> Toolchain {
    let cc = dir.join("fakecc");
    fs::write(
        &cc,
        r#"#!/bin/sh
out=""
prev=""
mode=link
srcs=""
for a in "$@"; do
  [ "$prev" = "-o" ] && out="$a"
  [ "$a" = "-c" ] && mode=compile
  prev="$a"
done
for a in "$@"; do
  case "$a" in
    *.c|*.cc|*.cpp|*.cxx)
      if grep -q SYNTAX_ERROR "$a" 2>/dev/null; then
        echo "error: expected expression in $a" >&2
        exit 1
      fi
      srcs="$srcs $a"
      ;;
  esac
done
[ -z "$out" ] && exit 0
if [ "$mode" = compile ]; then
  cat $srcs > "$out" 2>/dev/null || : > "$out"
else
  code=$(grep -h -o 'TEST_EXIT_CODE [0-9]*' "$@" 2>/dev/null | head -n1 | awk '{print $2}')
  printf '#!/bin/sh\nexit %s\n' "${code:-0}" > "$out"
  chmod +x "$out"
fi
exit 0
"#,
    )
    .unwrap();
    fs::set_permissions(&cc, fs::Permissions::from_mode(0o755)).unwrap();

    let ar = dir.join("fakear");
    fs::write(
        &ar,
        r#"#!/bin/sh
# $1 = rcs, $2 = archive, rest = objects
out="$2"
shift 2
cat "$@" > "$out" 2>/dev/null || printf 'empty archive\n' > "$out"
exit 0
"#,
    )
    .unwrap();
    fs::set_permissions(&ar, fs::Permissions::from_mode(0o755)).unwrap();

    Toolchain {
        c_compiler: cc.display().to_string(),
        cxx_compiler: cc.display().to_string(),
        archiver: ar.display().to_string(),
        compile_flags: Vec::new(),
        link_flags: Vec::new(),
        identity: Some("fakecc 1.0".to_string()),
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn open_project(dir: &Path, manifest: &str) -> Project {
    write(&dir.join("mortar.json5"), manifest);
    Project::open(dir).unwrap()
}

struct Fixture {
    _tmp: tempfile::TempDir,
    project: Project,
    store: PackageStore,
    toolchain: Toolchain,
    out_dir: PathBuf,
    cache_path: PathBuf,
}

impl Fixture {
    fn run(&self, keep_going: bool) -> build::BuildOutcome {
        let resolved = Resolved::default();
        let plan = build::plan::plan(&PlanParams {
            project: Some(&self.project),
            resolved: &resolved,
            store: &self.store,
            toolchain: &self.toolchain,
            out_dir: self.out_dir.clone(),
            want_tests: true,
            want_apps: true,
            tweaks_dir: None,
            node_timeout: None,
        })
        .unwrap();

        let cache = build::CompileCache::open(&self.cache_path).unwrap();
        let opts = ExecOptions {
            keep_going,
            jobs: 4,
            ..ExecOptions::default()
        };
        build::execute(&plan, &cache, &opts, &mut |_, _| {}).unwrap()
    }
}

fn hello_fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();

    write(&dir.join("proj/src/greet.c"), "int greet(void) { return 7; }\n");
    write(&dir.join("proj/include/hello/hello.h"), "int greet(void);\n");
    write(&dir.join("proj/src/cli.main.c"), "int main(void) { return 0; }\n");
    write(&dir.join("proj/src/greet.test.c"), "int main(void) { return 0; }\n");
    let project = open_project(
        &dir.join("proj"),
        "{ name: 'hello', version: '1.0.0', libraries: [{ name: 'hello' }] }",
    );

    let toolchain = fake_toolchain(&dir);
    Fixture {
        project,
        store: PackageStore::open(dir.join("store")).unwrap(),
        toolchain,
        out_dir: dir.join("proj/_build"),
        cache_path: dir.join("compile-cache.db"),
        _tmp: tmp,
    }
}

#[test]
fn full_build_produces_artifacts_and_runs_tests() {
    let fx = hello_fixture();
    let outcome = fx.run(false);

    assert!(outcome.success(), "outcome: {outcome:?}");
    assert!(fx.out_dir.join("lib/libhello_hello.a").exists());
    assert!(fx.out_dir.join("bin/cli").exists());
    assert!(fx.out_dir.join("test/hello/greet").exists());
    // compile x3, archive, link x2, test-run.
    assert_eq!(outcome.results.len(), 7);
}

#[test]
fn rebuild_is_a_no_op() {
    // S5: a second build with unchanged inputs spawns nothing.
    let fx = hello_fixture();

    let first = fx.run(false);
    assert!(first.success());
    assert!(first.spawned > 0);

    let second = fx.run(false);
    assert!(second.success());
    assert_eq!(second.spawned, 0, "replay must not invoke the compiler");
    assert_eq!(second.cached, second.results.len());
}

#[test]
fn edits_invalidate_only_downstream_nodes() {
    let fx = hello_fixture();
    assert!(fx.run(false).success());

    // Touching one source recompiles it (and its archive/link chain) but
    // leaves unrelated compiles cached.
    write(
        &fx.project.root.join("src/cli.main.c"),
        "int main(void) { return 1 - 1; }\n",
    );
    let outcome = fx.run(false);
    assert!(outcome.success());
    assert!(outcome.spawned >= 2, "main compile + link must rerun");
    assert!(outcome.cached >= 2, "untouched nodes stay cached");
}

#[test]
fn keep_going_builds_the_unbroken_library() {
    // S6: two independent libraries, one broken; keep-going still archives
    // the healthy one and the overall build reports failure.
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();

    write(&dir.join("proj/liba/src/a.c"), "SYNTAX_ERROR\n");
    write(&dir.join("proj/libb/src/b.c"), "int b(void) { return 0; }\n");
    let project = open_project(
        &dir.join("proj"),
        "{ name: 'two', version: '1.0.0', libraries: [ \
         { name: 'a', path: 'liba' }, { name: 'b', path: 'libb' } ] }",
    );

    let fx = Fixture {
        project,
        store: PackageStore::open(dir.join("store")).unwrap(),
        toolchain: fake_toolchain(&dir),
        out_dir: dir.join("proj/_build"),
        cache_path: dir.join("compile-cache.db"),
        _tmp: tmp,
    };

    let outcome = fx.run(true);
    assert!(!outcome.success());
    assert_eq!(outcome.failed_nodes.len(), 1);
    assert!(
        fx.out_dir.join("lib/libtwo_b.a").exists(),
        "b's archive must exist on disk"
    );
    assert!(!fx.out_dir.join("lib/libtwo_a.a").exists());

    let diagnostics: String = outcome
        .results
        .iter()
        .map(|r| r.stderr.clone())
        .collect();
    assert!(diagnostics.contains("expected expression"));
}

#[test]
fn test_failures_do_not_stop_other_tests() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();

    write(&dir.join("proj/src/lib.c"), "int lib(void) { return 0; }\n");
    write(
        &dir.join("proj/src/pass.test.c"),
        "int main(void) { return 0; }\n",
    );
    write(
        &dir.join("proj/src/fail.test.c"),
        "/* TEST_EXIT_CODE 9 */\nint main(void) { return 9; }\n",
    );
    let project = open_project(
        &dir.join("proj"),
        "{ name: 'suite', version: '1.0.0', libraries: [{ name: 'suite' }] }",
    );

    let toolchain = fake_toolchain(&dir);
    let fx = Fixture {
        project,
        store: PackageStore::open(dir.join("store")).unwrap(),
        toolchain,
        out_dir: dir.join("proj/_build"),
        cache_path: dir.join("compile-cache.db"),
        _tmp: tmp,
    };

    let outcome = fx.run(false);
    assert!(!outcome.success());
    assert_eq!(outcome.failed_tests.len(), 1, "outcome: {outcome:?}");
    assert!(outcome.failed_nodes.is_empty(), "compiles and links all pass");

    // The passing test still ran to completion.
    let statuses: Vec<&build::NodeStatus> =
        outcome.results.iter().map(|r| &r.status).collect();
    assert!(statuses.iter().any(|s| **s == build::NodeStatus::Ok));
    assert!(statuses
        .iter()
        .any(|s| matches!(s, build::NodeStatus::Failed { code: Some(9) })));
}
