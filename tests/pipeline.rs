//! End-to-end acquire pipeline: materialization, locking, idempotence,
//! and single-flight behavior.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{Fixture, IndexBuilder};

use tavern::core::TavernError;
use tavern::lockfile::{LOCKFILE_NAME, LockFile};
use tavern::solver::SolveOptions;
use tavern::version::Version;

fn v(text: &str) -> Version {
    Version::parse(text).unwrap()
}

fn read_lockfile(fixture: &Fixture, dir: &Path) -> LockFile {
    LockFile::load(dir, fixture.cache.sources()).unwrap()
}

#[tokio::test]
async fn acquire_materializes_links_and_locks() {
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("foo", "1.0.0", &[])
            .package("foo", "1.1.0", &[])
            .package("foo", "2.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");

    let report = project.acquire_dependencies(&SolveOptions::default()).await.unwrap();
    assert_eq!(report.changed_count(), 1);

    // foo@1.1.0 is locked and linked into packages/.
    let lockfile = read_lockfile(&fixture, dir.path());
    assert_eq!(lockfile.package("foo").unwrap().version, v("1.1.0"));

    let link = dir.path().join("packages").join("foo");
    let metadata = link.symlink_metadata().unwrap();
    assert!(metadata.file_type().is_symlink());
    assert!(link.join("foo.txt").exists(), "link should land in the package's lib/");
}

#[tokio::test]
async fn acquire_is_idempotent() {
    let fixture = Fixture::new(
        IndexBuilder::new().package("foo", "1.1.0", &[("bar", "any")]).package(
            "bar",
            "0.5.0",
            &[],
        ),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: any\n");

    project.acquire_dependencies(&SolveOptions::default()).await.unwrap();
    let first_bytes = std::fs::read(dir.path().join(LOCKFILE_NAME)).unwrap();
    let list_packages = || {
        let mut entries: Vec<String> = std::fs::read_dir(dir.path().join("packages"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        entries
    };
    let first_entries = list_packages();

    let report = project.acquire_dependencies(&SolveOptions::default()).await.unwrap();
    assert_eq!(report.changed_count(), 0);
    assert_eq!(std::fs::read(dir.path().join(LOCKFILE_NAME)).unwrap(), first_bytes);
    assert_eq!(list_packages(), first_entries);
}

#[tokio::test]
async fn lock_survives_new_releases_until_upgrade_all() {
    // First resolve against an index that only has 1.0.0.
    let fixture = Fixture::new(IndexBuilder::new().package("foo", "1.0.0", &[]));
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");
    project.acquire_dependencies(&SolveOptions::default()).await.unwrap();

    // 1.1.0 ships. A plain acquire keeps the lock; upgrade-all moves it.
    let newer = fixture
        .reopen_with(IndexBuilder::new().package("foo", "1.0.0", &[]).package("foo", "1.1.0", &[]));
    let project = newer.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");

    let report = project.acquire_dependencies(&SolveOptions::default()).await.unwrap();
    assert_eq!(report.changed_count(), 0);
    assert_eq!(read_lockfile(&newer, dir.path()).package("foo").unwrap().version, v("1.0.0"));

    let options = SolveOptions {
        upgrade_all: true,
        ..Default::default()
    };
    let report = project.acquire_dependencies(&options).await.unwrap();
    assert_eq!(report.changed_count(), 1);
    assert_eq!(read_lockfile(&newer, dir.path()).package("foo").unwrap().version, v("1.1.0"));
}

#[tokio::test]
async fn concurrent_acquires_share_one_fetch_per_id() {
    let fixture = Fixture::new(
        IndexBuilder::new().package("foo", "1.1.0", &[("bar", "any")]).package(
            "bar",
            "0.5.0",
            &[],
        ),
    );
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pubspec = "name: app\ndependencies:\n  foo: any\n";
    let project_a = fixture.project(dir_a.path(), pubspec);
    let project_b = fixture.project(dir_b.path(), pubspec);

    let opts_a = SolveOptions::default();
    let opts_b = SolveOptions::default();
    let (a, b) = tokio::join!(
        project_a.acquire_dependencies(&opts_a),
        project_b.acquire_dependencies(&opts_b),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(fixture.source.download_count("foo", "1.1.0"), 1);
    assert_eq!(fixture.source.download_count("bar", "0.5.0"), 1);
}

#[tokio::test]
async fn concurrent_downloads_share_one_flight() {
    let fixture = Fixture::new(IndexBuilder::new().package("foo", "1.0.0", &[]));
    let id = fixture.source.id("foo", "1.0.0");

    let (a, b) = tokio::join!(
        Arc::clone(&fixture.cache).download(&id),
        Arc::clone(&fixture.cache).download(&id),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.dir, b.dir);
    assert_eq!(fixture.source.download_count("foo", "1.0.0"), 1);
}

#[tokio::test]
async fn downloading_an_uncacheable_source_is_invalid() {
    let fixture = Fixture::new(IndexBuilder::new());
    let local = tempfile::tempdir().unwrap();
    let id = tavern::package::PackageId {
        name: "local".into(),
        source: "path".into(),
        version: v("0.0.0"),
        description: tavern::package::Description::Path {
            path: local.path().to_path_buf(),
            relative: false,
        },
    };

    let err = Arc::clone(&fixture.cache).download(&id).await.unwrap_err();
    let domain = err.chain().find_map(|c| c.downcast_ref::<TavernError>()).unwrap();
    assert!(matches!(domain, TavernError::InvalidArgument { .. }), "{domain}");
}

#[tokio::test]
async fn path_dependencies_install_without_the_cache() {
    let fixture = Fixture::new(IndexBuilder::new());
    let dir = tempfile::tempdir().unwrap();

    let local = dir.path().join("local");
    std::fs::create_dir_all(local.join("lib")).unwrap();
    std::fs::write(local.join("pubspec.yaml"), "name: local\nversion: 0.1.0\n").unwrap();

    let project_dir = dir.path().join("app");
    let project = fixture.project(
        &project_dir,
        "name: app\ndependencies:\n  local:\n    path: ../local\n",
    );

    project.acquire_dependencies(&SolveOptions::default()).await.unwrap();

    let link = project_dir.join("packages").join("local");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    assert!(link.join("pubspec.yaml").exists(), "link should reach the path package");

    // The lockfile round-trips the path description.
    let lockfile = read_lockfile(&fixture, &project_dir);
    let locked = lockfile.package("local").unwrap();
    assert_eq!(locked.source, "path");
    assert_eq!(locked.version, v("0.1.0"));
}

#[tokio::test]
async fn missing_path_dependency_fails_with_not_found() {
    let fixture = Fixture::new(IndexBuilder::new());
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(
        dir.path(),
        "name: app\ndependencies:\n  ghost:\n    path: ../nowhere\n",
    );

    let err = project.acquire_dependencies(&SolveOptions::default()).await.unwrap_err();
    let domain = err.chain().find_map(|c| c.downcast_ref::<TavernError>()).unwrap();
    assert!(matches!(domain, TavernError::PackageNotFound { .. }), "{domain}");
}

#[tokio::test]
async fn ensure_lockfile_short_circuits_when_current() {
    let fixture = Fixture::new(IndexBuilder::new().package("foo", "1.0.0", &[]));
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: any\n");

    // First call does the work, second finds nothing to do.
    assert!(project.ensure_lockfile_is_up_to_date().await.unwrap().is_some());
    assert!(project.ensure_lockfile_is_up_to_date().await.unwrap().is_none());

    // Tightening the pubspec past the locked version forces a re-run.
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \">=2.0.0\"\n");
    let err = project.ensure_lockfile_is_up_to_date().await.unwrap_err();
    let domain = err.chain().find_map(|c| c.downcast_ref::<TavernError>()).unwrap();
    assert!(matches!(domain, TavernError::NoVersionAvailable { .. }), "{domain}");
}

#[tokio::test]
async fn root_self_link_is_created() {
    let fixture = Fixture::new(IndexBuilder::new());
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("lib")).unwrap();
    let project = fixture.project(dir.path(), "name: app\n");

    project.acquire_dependencies(&SolveOptions::default()).await.unwrap();
    let link = dir.path().join("packages").join("app");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
}
