//! Change report: the solved graph diffed against the previous lockfile.

use std::collections::BTreeMap;
use std::fmt;

use crate::lockfile::LockFile;
use crate::package::PackageId;
use crate::version::Version;

/// How one package moved relative to the previous lockfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Newly selected; absent from the previous lockfile.
    Added,
    /// Present in the previous lockfile, no longer selected.
    Removed,
    /// Selected strictly newer than locked.
    Upgraded,
    /// Selected strictly older than locked.
    Downgraded,
    /// Same version as locked.
    Unchanged,
}

/// One package's row in the report.
#[derive(Debug, Clone)]
pub struct Change {
    /// Classification against the previous lockfile.
    pub kind: ChangeKind,
    /// The previously locked version, if any.
    pub previous: Option<Version>,
    /// The newly selected version, if any.
    pub current: Option<Version>,
}

/// The full diff of a solve against the previous lockfile, ordered by
/// package name.
#[derive(Debug, Clone, Default)]
pub struct SolveReport {
    entries: BTreeMap<String, Change>,
}

impl SolveReport {
    /// Diff `packages` (the solved selection, root excluded by the caller)
    /// against `previous`.
    #[must_use]
    pub fn diff(previous: &LockFile, packages: &[PackageId]) -> Self {
        let mut entries = BTreeMap::new();

        for id in packages {
            let locked = previous.package(&id.name).map(|locked| locked.version.clone());
            let kind = match &locked {
                None => ChangeKind::Added,
                Some(before) if id.version > *before => ChangeKind::Upgraded,
                Some(before) if id.version < *before => ChangeKind::Downgraded,
                Some(_) => ChangeKind::Unchanged,
            };
            entries.insert(
                id.name.clone(),
                Change {
                    kind,
                    previous: locked,
                    current: Some(id.version.clone()),
                },
            );
        }

        for (name, locked) in &previous.packages {
            entries.entry(name.clone()).or_insert_with(|| Change {
                kind: ChangeKind::Removed,
                previous: Some(locked.version.clone()),
                current: None,
            });
        }

        Self {
            entries,
        }
    }

    /// Rows, ordered by package name.
    pub fn changes(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.entries.iter().map(|(name, change)| (name.as_str(), change))
    }

    /// The row for one package.
    #[must_use]
    pub fn change(&self, name: &str) -> Option<&Change> {
        self.entries.get(name)
    }

    /// How many packages moved (everything but `Unchanged`).
    #[must_use]
    pub fn changed_count(&self) -> usize {
        self.entries.values().filter(|change| change.kind != ChangeKind::Unchanged).count()
    }
}

impl fmt::Display for SolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, change) in &self.entries {
            match (change.kind, &change.previous, &change.current) {
                (ChangeKind::Added, _, Some(version)) => writeln!(f, "+ {name} {version}")?,
                (ChangeKind::Removed, Some(version), _) => writeln!(f, "- {name} {version}")?,
                (ChangeKind::Upgraded | ChangeKind::Downgraded, Some(before), Some(after)) => {
                    writeln!(f, "  {name} {before} -> {after}")?;
                }
                (ChangeKind::Unchanged, _, Some(version)) => writeln!(f, "  {name} {version}")?,
                _ => {}
            }
        }
        write!(f, "{} changed", self.changed_count())
    }
}
