//! Solver scenarios against a frozen in-memory index.

mod common;

use common::{Fixture, IndexBuilder};

use tavern::core::TavernError;
use tavern::lockfile::LockFile;
use tavern::solver::{ChangeKind, SolveOptions, SolveReport, solve};
use tavern::version::Version;

fn v(text: &str) -> Version {
    Version::parse(text).unwrap()
}

fn domain_error(err: &anyhow::Error) -> &TavernError {
    err.chain().find_map(|c| c.downcast_ref::<TavernError>()).expect("a domain error")
}

#[tokio::test]
async fn trivial_solve_picks_newest_satisfying() {
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("foo", "1.0.0", &[])
            .package("foo", "1.1.0", &[])
            .package("foo", "2.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");

    let result = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();

    let foo = result.non_root_packages().find(|id| id.name == "foo").unwrap();
    assert_eq!(foo.version, v("1.1.0"));
}

#[tokio::test]
async fn backtracks_to_a_compatible_older_version() {
    // foo@2.0.0 wants baz@2.x but bar insists on baz@1.x, so foo must fall
    // back to 1.0.0.
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("foo", "2.0.0", &[("baz", "^2.0.0")])
            .package("foo", "1.0.0", &[("baz", "^1.0.0")])
            .package("bar", "1.0.0", &[("baz", "^1.0.0")])
            .package("baz", "1.0.0", &[])
            .package("baz", "1.5.0", &[])
            .package("baz", "2.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project =
        fixture.project(dir.path(), "name: app\ndependencies:\n  foo: any\n  bar: any\n");

    let result = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();

    let version_of = |name: &str| {
        result.packages.iter().find(|id| id.name == name).map(|id| id.version.clone()).unwrap()
    };
    assert_eq!(version_of("foo"), v("1.0.0"));
    assert_eq!(version_of("bar"), v("1.0.0"));
    assert_eq!(version_of("baz"), v("1.5.0"));
    assert!(result.attempted_solutions > 1, "expected at least one backtrack");
}

#[tokio::test]
async fn unsolvable_graph_names_the_contested_package() {
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("foo", "1.0.0", &[("baz", "^1.0.0")])
            .package("bar", "1.0.0", &[("baz", "^2.0.0")])
            .package("baz", "1.0.0", &[])
            .package("baz", "2.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project =
        fixture.project(dir.path(), "name: app\ndependencies:\n  foo: any\n  bar: any\n");

    let err = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap_err();

    match domain_error(&err) {
        TavernError::NoVersionAvailable {
            package, ..
        } => assert_eq!(package, "baz"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn locked_version_is_preserved_by_default() {
    let fixture = Fixture::new(
        IndexBuilder::new().package("foo", "1.0.0", &[]).package("foo", "1.1.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");

    let mut lockfile = LockFile::empty();
    lockfile.packages.insert("foo".into(), fixture.source.id("foo", "1.0.0"));

    let result = solve(&fixture.cache, project.root(), &lockfile, &SolveOptions::default())
        .await
        .unwrap();
    let foo = result.non_root_packages().find(|id| id.name == "foo").unwrap();
    assert_eq!(foo.version, v("1.0.0"), "lock should win over newer 1.1.0");
}

#[tokio::test]
async fn upgrade_all_ignores_the_lock_and_reports_the_move() {
    let fixture = Fixture::new(
        IndexBuilder::new().package("foo", "1.0.0", &[]).package("foo", "1.1.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n");

    let mut lockfile = LockFile::empty();
    lockfile.packages.insert("foo".into(), fixture.source.id("foo", "1.0.0"));

    let options = SolveOptions {
        upgrade_all: true,
        ..Default::default()
    };
    let result = solve(&fixture.cache, project.root(), &lockfile, &options).await.unwrap();
    let solved: Vec<_> = result.non_root_packages().cloned().collect();
    assert_eq!(solved[0].version, v("1.1.0"));

    let report = SolveReport::diff(&lockfile, &solved);
    assert_eq!(report.change("foo").unwrap().kind, ChangeKind::Upgraded);
    assert_eq!(report.changed_count(), 1);
}

#[tokio::test]
async fn use_latest_unlocks_only_the_named_package() {
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("foo", "1.0.0", &[])
            .package("foo", "1.1.0", &[])
            .package("bar", "1.0.0", &[])
            .package("bar", "1.1.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture
        .project(dir.path(), "name: app\ndependencies:\n  foo: \"^1.0.0\"\n  bar: \"^1.0.0\"\n");

    let mut lockfile = LockFile::empty();
    lockfile.packages.insert("foo".into(), fixture.source.id("foo", "1.0.0"));
    lockfile.packages.insert("bar".into(), fixture.source.id("bar", "1.0.0"));

    let options = SolveOptions {
        use_latest: ["foo".to_string()].into(),
        ..Default::default()
    };
    let result = solve(&fixture.cache, project.root(), &lockfile, &options).await.unwrap();
    let version_of = |name: &str| {
        result.packages.iter().find(|id| id.name == name).map(|id| id.version.clone()).unwrap()
    };
    assert_eq!(version_of("foo"), v("1.1.0"));
    assert_eq!(version_of("bar"), v("1.0.0"));
}

#[tokio::test]
async fn dev_dependencies_count_only_at_the_root() {
    // foo's own dev_dependencies must not drag "tool" into the graph.
    let fixture = Fixture::new(
        IndexBuilder::new()
            .raw_package(
                "foo",
                "1.0.0",
                "name: foo\nversion: 1.0.0\ndev_dependencies:\n  tool: any\n",
            )
            .package("tester", "1.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(
        dir.path(),
        "name: app\ndependencies:\n  foo: any\ndev_dependencies:\n  tester: any\n",
    );

    let result = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();
    let names: Vec<_> = result.non_root_packages().map(|id| id.name.as_str()).collect();
    assert_eq!(names, ["foo", "tester"]);
}

#[tokio::test]
async fn solution_satisfies_every_declared_constraint() {
    let fixture = Fixture::new(
        IndexBuilder::new()
            .package("a", "1.0.0", &[("c", ">=1.0.0 <1.5.0")])
            .package("a", "2.0.0", &[("c", "^1.0.0")])
            .package("b", "1.0.0", &[("c", ">=1.2.0")])
            .package("c", "1.0.0", &[])
            .package("c", "1.2.0", &[])
            .package("c", "1.4.0", &[])
            .package("c", "2.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  a: any\n  b: any\n");

    let result = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();

    // Re-walk every pubspec in the solution and check its constraints
    // against the chosen versions.
    let version_of = |name: &str| {
        result.packages.iter().find(|id| id.name == name).map(|id| id.version.clone()).unwrap()
    };
    let a = version_of("a");
    let c = version_of("c");
    if a == v("1.0.0") {
        assert!(c >= v("1.0.0") && c < v("1.5.0"));
    } else {
        assert!(c >= v("1.0.0") && c < v("2.0.0"));
    }
    assert!(c >= v("1.2.0"), "b's floor must hold");
}

#[tokio::test]
async fn repeated_solves_are_deterministic() {
    let index = || {
        IndexBuilder::new()
            .package("a", "1.0.0", &[("shared", "any")])
            .package("a", "1.1.0", &[("shared", "any")])
            .package("b", "1.0.0", &[("shared", ">=1.0.0")])
            .package("shared", "1.0.0", &[])
            .package("shared", "1.1.0", &[])
    };
    let fixture = Fixture::new(index());
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  a: any\n  b: any\n");

    let first = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();
    let second = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();
    assert_eq!(first.packages, second.packages);
}

#[tokio::test]
async fn sdk_incompatible_candidate_is_skipped() {
    // 2.0.0 demands a newer SDK than the active 1.0.0; the solver settles
    // on 1.0.0 instead of failing.
    let fixture = Fixture::new(
        IndexBuilder::new()
            .raw_package("foo", "2.0.0", "name: foo\nversion: 2.0.0\nsdk: \">=9.0.0\"\n")
            .package("foo", "1.0.0", &[]),
    );
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\ndependencies:\n  foo: any\n");

    let result = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap();
    let foo = result.non_root_packages().find(|id| id.name == "foo").unwrap();
    assert_eq!(foo.version, v("1.0.0"));
}

#[tokio::test]
async fn root_sdk_mismatch_fails_fast() {
    let fixture = Fixture::new(IndexBuilder::new());
    let dir = tempfile::tempdir().unwrap();
    let project = fixture.project(dir.path(), "name: app\nsdk: \">=9.0.0\"\n");

    let err = solve(&fixture.cache, project.root(), &LockFile::empty(), &SolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(domain_error(&err), TavernError::SdkConstraintMismatch { .. }));
}
