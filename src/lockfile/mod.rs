//! The lockfile: the persisted selection from the last successful resolve.
//!
//! `pubspec.lock` is a human-diffable YAML document mapping every non-root
//! member of the solved graph to its exact [`PackageId`]:
//!
//! ```yaml
//! packages:
//!   foo:
//!     description:
//!       name: foo
//!       url: https://pub.tavern.dev/
//!     source: hosted
//!     version: 1.1.0
//! sdk: ">=1.0.0 <2.0.0"
//! ```
//!
//! Entries are ordered by package name so repeated resolves of an unchanged
//! graph write byte-identical files. Loading is strict: an unknown source
//! or a missing field is [`TavernError::LockFileCorrupt`], never silently
//! skipped; writing is atomic (staging file + rename).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_yaml::Value;

use crate::core::TavernError;
use crate::package::PackageId;
use crate::source::SourceRegistry;
use crate::utils::fs::atomic_write_str;
use crate::version::{Version, VersionConstraint};

/// Lockfile name within a project directory.
pub const LOCKFILE_NAME: &str = "pubspec.lock";

/// The resolved selection of one project.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LockFile {
    /// Every non-root package of the solved graph, keyed (and ordered) by
    /// name.
    pub packages: BTreeMap<String, PackageId>,
    /// The root's SDK constraint at the time of the resolve.
    pub sdk_constraint: Option<VersionConstraint>,
}

impl LockFile {
    /// A lockfile with no entries, used when a project has never resolved.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this lockfile pins any packages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// The locked id for `name`, if any.
    #[must_use]
    pub fn package(&self, name: &str) -> Option<&PackageId> {
        self.packages.get(name)
    }

    /// Load `dir/pubspec.lock`, treating a missing file as an empty
    /// lockfile.
    pub fn load(dir: &Path, sources: &SourceRegistry) -> Result<Self> {
        let path = dir.join(LOCKFILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents, dir, sources)
                .with_context(|| format!("Failed to load {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e).context(format!("Failed to read {}", path.display())),
        }
    }

    /// Parse a lockfile document. `containing_dir` anchors relative path
    /// descriptions.
    pub fn parse(contents: &str, containing_dir: &Path, sources: &SourceRegistry) -> Result<Self> {
        let document: Value = serde_yaml::from_str(contents).map_err(|e| corrupt(format!(
            "invalid YAML: {e}"
        )))?;
        if matches!(document, Value::Null) {
            return Ok(Self::empty());
        }
        let Value::Mapping(root) = document else {
            return Err(corrupt("expected a mapping at the top level").into());
        };

        let mut packages = BTreeMap::new();
        match root.get(Value::from("packages")) {
            None | Some(Value::Null) => {}
            Some(Value::Mapping(entries)) => {
                for (key, entry) in entries {
                    let Value::String(name) = key else {
                        return Err(corrupt("package keys must be strings").into());
                    };
                    let id = parse_entry(name, entry, containing_dir, sources)?;
                    packages.insert(name.clone(), id);
                }
            }
            Some(_) => return Err(corrupt("\"packages\" must be a mapping").into()),
        }

        let sdk_constraint = match root.get(Value::from("sdk")) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => {
                Some(VersionConstraint::parse(text).map_err(|e| corrupt(format!(
                    "invalid sdk constraint: {e}"
                )))?)
            }
            Some(_) => return Err(corrupt("\"sdk\" must be a constraint string").into()),
        };

        Ok(Self {
            packages,
            sdk_constraint,
        })
    }

    /// Render the document written to disk.
    pub fn serialize(&self, containing_dir: &Path, sources: &SourceRegistry) -> Result<String> {
        let mut entries = serde_yaml::Mapping::new();
        for (name, id) in &self.packages {
            let source = sources
                .get(&id.source)
                .map_err(|_| corrupt(format!("entry \"{name}\" names unknown source \"{}\"", id.source)))?;

            let mut entry = serde_yaml::Mapping::new();
            entry.insert(
                Value::from("description"),
                source.serialize_description(containing_dir, &id.description),
            );
            entry.insert(Value::from("source"), Value::from(id.source.as_str()));
            entry.insert(Value::from("version"), Value::from(id.version.to_string()));
            entries.insert(Value::from(name.as_str()), Value::Mapping(entry));
        }

        let mut root = serde_yaml::Mapping::new();
        root.insert(Value::from("packages"), Value::Mapping(entries));
        if let Some(sdk) = &self.sdk_constraint {
            root.insert(Value::from("sdk"), Value::from(sdk.to_string()));
        }

        serde_yaml::to_string(&Value::Mapping(root)).context("Failed to render the lockfile")
    }

    /// Atomically write `dir/pubspec.lock`.
    pub fn save(&self, dir: &Path, sources: &SourceRegistry) -> Result<()> {
        let rendered = self.serialize(dir, sources)?;
        atomic_write_str(&dir.join(LOCKFILE_NAME), &rendered)
            .with_context(|| format!("Failed to write {}", dir.join(LOCKFILE_NAME).display()))
    }
}

fn corrupt(reason: impl Into<String>) -> TavernError {
    TavernError::LockFileCorrupt {
        reason: reason.into(),
    }
}

fn parse_entry(
    name: &str,
    entry: &Value,
    containing_dir: &Path,
    sources: &SourceRegistry,
) -> Result<PackageId> {
    let Value::Mapping(fields) = entry else {
        return Err(corrupt(format!("entry \"{name}\" must be a mapping")).into());
    };

    let source_name = match fields.get(Value::from("source")) {
        Some(Value::String(source)) => source.clone(),
        _ => return Err(corrupt(format!("entry \"{name}\" is missing \"source\"")).into()),
    };
    let source = sources
        .get(&source_name)
        .map_err(|_| corrupt(format!("entry \"{name}\" names unknown source \"{source_name}\"")))?;

    let version = match fields.get(Value::from("version")) {
        Some(Value::String(text)) => Version::parse(text)
            .map_err(|e| corrupt(format!("entry \"{name}\" has a malformed version: {e}")))?,
        _ => return Err(corrupt(format!("entry \"{name}\" is missing \"version\"")).into()),
    };

    let description_value = fields
        .get(Value::from("description"))
        .ok_or_else(|| corrupt(format!("entry \"{name}\" is missing \"description\"")))?;
    let description = source
        .parse_description(containing_dir, description_value, true)
        .map_err(|e| corrupt(format!("entry \"{name}\" has a malformed description: {e}")))?;

    Ok(PackageId {
        name: name.to_string(),
        source: source_name,
        version,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::test_registry;

    const SAMPLE: &str = concat!(
        "packages:\n",
        "  bar:\n",
        "    description:\n",
        "      url: https://example.org/bar.git\n",
        "      ref: main\n",
        "      resolved-ref: abc123\n",
        "    source: git\n",
        "    version: 0.3.0\n",
        "  foo:\n",
        "    description:\n",
        "      name: foo\n",
        "      url: https://pub.tavern.dev/\n",
        "    source: hosted\n",
        "    version: 1.1.0\n",
        "sdk: \">=1.0.0 <2.0.0\"\n",
    );

    #[test]
    fn parses_and_round_trips() {
        let sources = test_registry();
        let lockfile = LockFile::parse(SAMPLE, Path::new("/proj"), &sources).unwrap();
        assert_eq!(lockfile.packages.len(), 2);
        assert_eq!(lockfile.package("foo").unwrap().version, Version::new(1, 1, 0));

        let rendered = lockfile.serialize(Path::new("/proj"), &sources).unwrap();
        let reparsed = LockFile::parse(&rendered, Path::new("/proj"), &sources).unwrap();
        assert_eq!(reparsed, lockfile);

        // Serialization is stable: a second render is byte-identical.
        assert_eq!(reparsed.serialize(Path::new("/proj"), &sources).unwrap(), rendered);
    }

    #[test]
    fn entries_are_ordered_by_name() {
        let sources = test_registry();
        let lockfile = LockFile::parse(SAMPLE, Path::new("/proj"), &sources).unwrap();
        let rendered = lockfile.serialize(Path::new("/proj"), &sources).unwrap();
        let bar = rendered.find("  bar:").unwrap();
        let foo = rendered.find("  foo:").unwrap();
        assert!(bar < foo);
    }

    #[test]
    fn unknown_source_is_corrupt() {
        let sources = test_registry();
        let err = LockFile::parse(
            concat!(
                "packages:\n",
                "  foo:\n",
                "    description: {name: foo}\n",
                "    source: mercurial\n",
                "    version: 1.0.0\n",
            ),
            Path::new("/proj"),
            &sources,
        )
        .unwrap_err();
        let corrupt = err
            .chain()
            .find_map(|c| c.downcast_ref::<TavernError>())
            .expect("a domain error");
        assert!(matches!(corrupt, TavernError::LockFileCorrupt { .. }), "{corrupt}");
    }

    #[test]
    fn missing_fields_are_corrupt() {
        let sources = test_registry();
        for body in [
            "packages:\n  foo:\n    source: hosted\n    version: 1.0.0\n",
            "packages:\n  foo:\n    description: {name: foo}\n    version: 1.0.0\n",
            "packages:\n  foo:\n    description: {name: foo}\n    source: hosted\n",
        ] {
            let err = LockFile::parse(body, Path::new("/proj"), &sources).unwrap_err();
            assert!(
                err.chain().any(|c| {
                    c.downcast_ref::<TavernError>()
                        .is_some_and(|t| matches!(t, TavernError::LockFileCorrupt { .. }))
                }),
                "{err}"
            );
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = LockFile::load(dir.path(), &test_registry()).unwrap();
        assert!(lockfile.is_empty());
    }
}
