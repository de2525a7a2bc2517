//! The whole acquisition pipeline against a local `file://` repository:
//! publish sdists, sync the index, solve, fetch into the store, plan.

use std::fs;
use std::path::{Path, PathBuf};

use mortar::cancel::CancelToken;
use mortar::fetch::Fetcher;
use mortar::index::{IndexDb, SyncMode};
use mortar::manifest::{DependencyExpr, PackageManifest};
use mortar::project::Project;
use mortar::repo::{IfExists, LocalRepo};
use mortar::sdist;
use mortar::solve;
use mortar::store::PackageStore;
use mortar::types::Name;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Author a package directory and return its sdist path.
fn publish(work: &Path, repo: &LocalRepo, manifest: &str, extra: &[(&str, &str)]) -> PathBuf {
    let parsed = PackageManifest::parse(manifest).unwrap();
    let proj = work.join(format!("src-{}", parsed.id));
    write(&proj.join("mortar.json5"), manifest);
    for (rel, content) in extra {
        write(&proj.join(rel), content);
    }
    let tgz = sdist::create(&proj, &parsed, &work.join("dist")).unwrap();
    repo.import(&tgz, IfExists::Fail).unwrap();
    tgz
}

#[test]
fn publish_sync_solve_fetch_plan() {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path();
    let token = CancelToken::new();

    // A repository advertising zlib 1.2.x and 1.3.x plus a consumer.
    let repo = LocalRepo::init(&work.join("repo"), "testing").unwrap();
    publish(
        work,
        &repo,
        "{ name: 'zlib', version: '1.2.13', libraries: [{ name: 'zlib' }] }",
        &[
            ("src/inflate.c", "int inflate(void) { return 0; }\n"),
            ("include/zlib.h", "int inflate(void);\n"),
        ],
    );
    publish(
        work,
        &repo,
        "{ name: 'zlib', version: '1.3.1', libraries: [{ name: 'zlib' }] }",
        &[
            ("src/inflate.c", "int inflate(void) { return 1; }\n"),
            ("include/zlib.h", "int inflate(void);\n"),
        ],
    );
    publish(
        work,
        &repo,
        "{ name: 'imglib', version: '2.0.0', libraries: [{ name: 'imglib', \
         uses: ['zlib/zlib'], \
         dependencies: [{ name: 'zlib', versions: '^1.2', using: ['zlib'] }] }] }",
        &[
            ("src/img.c", "int img(void) { return 0; }\n"),
            ("include/imglib.h", "int img(void);\n"),
        ],
    );

    // Register and sync the file:// remote.
    let mut index = IndexDb::open(&work.join("cache/index.db")).unwrap();
    let fetcher = Fetcher::new();
    let remote = index.upsert_remote(&repo.url(), 0).unwrap();
    index
        .sync(&fetcher, &remote, SyncMode::Always, &token)
        .unwrap();

    // Syncing again under cached-okay is a no-op (cache fresh).
    let remote = index.remote_by_url(&repo.url()).unwrap().unwrap();
    assert!(remote.last_sync.is_some());
    index
        .sync(&fetcher, &remote, SyncMode::CachedOkay, &token)
        .unwrap();

    // Solve: imglib wants zlib ^1.2, latest admitted is 1.3.1.
    let universe = index.snapshot().unwrap();
    let roots = vec![DependencyExpr::parse_requirement("imglib *").unwrap()];
    let resolved = solve::solve(&universe, &roots).unwrap();
    assert_eq!(resolved.packages.len(), 2);
    let zlib = &resolved.packages[&Name::new("zlib").unwrap()];
    assert_eq!(zlib.id.to_string(), "zlib@1.3.1~0");

    // Fetch both into the store through the file:// bypass.
    let store = PackageStore::open(work.join("cache/pkgs")).unwrap();
    for pkg in resolved.packages.values() {
        let path = store
            .get_or_populate(&pkg.id, &token, |tmp_dir| {
                fetcher
                    .fetch_package(
                        &pkg.remote_url,
                        &pkg.id,
                        &pkg.archive_sha256,
                        tmp_dir,
                        &token,
                    )
                    .map_err(Into::into)
            })
            .unwrap();
        assert!(path.join("mortar.json5").exists());
    }
    assert!(store
        .path_of(&zlib.id)
        .join("src/inflate.c")
        .exists());

    // Plan a consumer project against the fetched set.
    write(
        &work.join("app/src/main_prog.main.c"),
        "int main(void) { return 0; }\n",
    );
    write(&work.join("app/src/app.c"), "int app(void) { return 0; }\n");
    write(
        &work.join("app/mortar.json5"),
        "{ name: 'app', version: '0.1.0', libraries: [{ name: 'app', \
         uses: ['imglib/imglib'], \
         dependencies: [{ name: 'imglib', versions: '^2', using: ['imglib'] }] }] }",
    );
    let project = Project::open(&work.join("app")).unwrap();

    let toolchain = mortar::toolchain::Toolchain {
        identity: Some("test-cc 1.0".to_string()),
        ..Default::default()
    };
    let plan = mortar::build::plan::plan(&mortar::build::PlanParams {
        project: Some(&project),
        resolved: &resolved,
        store: &store,
        toolchain: &toolchain,
        out_dir: work.join("app/_build"),
        want_tests: true,
        want_apps: true,
        tweaks_dir: None,
        node_timeout: None,
    })
    .unwrap();

    // zlib + imglib + app compiles, three archives, one app link.
    use mortar::build::NodeKind;
    assert_eq!(
        plan.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Archive)
            .count(),
        3
    );
    assert_eq!(
        plan.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Link)
            .count(),
        1
    );

    // The app compile sees both dependency include roots.
    let app_compile = plan
        .nodes
        .iter()
        .find(|n| n.label.contains("app.c"))
        .unwrap();
    let args = app_compile.argv.join(" ");
    assert!(args.contains("imglib/include") || args.contains("include"));

    // Hash tampering surfaces as an integrity failure, store untouched.
    let bad = solve::ResolvedPkg {
        archive_sha256: "0".repeat(64),
        ..zlib.clone()
    };
    let fresh_store = PackageStore::open(work.join("cache/pkgs2")).unwrap();
    let err = fresh_store
        .get_or_populate(&bad.id, &token, |tmp_dir| {
            fetcher
                .fetch_package(&bad.remote_url, &bad.id, &bad.archive_sha256, tmp_dir, &token)
                .map_err(Into::into)
        })
        .unwrap_err();
    assert!(err.to_string().contains("populating"));
    assert!(!fresh_store.has(&bad.id));
}
