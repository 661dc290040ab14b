//! Pubspec parsing and validation.
//!
//! A pubspec (`pubspec.yaml`) is the manifest of one concrete package. The
//! recognized keys:
//!
//! ```yaml
//! name: my_app            # required, a valid identifier
//! version: 1.2.3          # optional
//! sdk: ">=1.0.0 <2.0.0"   # optional SDK constraint
//! dependencies:
//!   plain: "^1.0.0"       # bare constraint -> default source
//!   from_git:             # map with the source name as key
//!     git:
//!       url: https://example.org/repo.git
//!       ref: main
//!   local:
//!     path: ../local
//!     version: ">=0.1.0"
//! dev_dependencies:
//!   tester: any
//! ```
//!
//! A dependency value is either a bare constraint string (the default source
//! locates the package by name) or a map carrying exactly one source-name key
//! whose value is handed to that source's `parse_description`, plus an
//! optional `version` constraint.
//!
//! Invariants enforced here: the name is a valid identifier, no dependency
//! name appears twice in a section, and a package never depends on itself.
//! `dev_dependencies` are parsed for every package but only the root's are
//! consulted by the solver.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde_yaml::Value;

use crate::core::TavernError;
use crate::package::PackageRef;
use crate::source::SourceRegistry;
use crate::version::{Version, VersionConstraint};

/// Manifest file name within a package directory.
pub const PUBSPEC_FILE: &str = "pubspec.yaml";

/// A single dependency record: where to find the package and which versions
/// satisfy the depender.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// The package being depended on.
    pub target: PackageRef,
    /// Versions the depender accepts.
    pub constraint: VersionConstraint,
}

impl Dependency {
    /// Name of the depended-on package.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} from {}", self.target.name, self.constraint, self.target.source)
    }
}

/// A parsed, immutable package manifest.
#[derive(Debug, Clone)]
pub struct Pubspec {
    /// Package name.
    pub name: String,
    /// Declared version, when present.
    pub version: Option<Version>,
    /// Runtime dependencies.
    pub dependencies: Vec<Dependency>,
    /// Development-only dependencies; consulted only for the root package.
    pub dev_dependencies: Vec<Dependency>,
    /// SDK versions this package supports.
    pub sdk_constraint: Option<VersionConstraint>,
}

impl Pubspec {
    /// An empty pubspec for `name`, useful for synthetic packages.
    #[must_use]
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            dependencies: Vec::new(),
            dev_dependencies: Vec::new(),
            sdk_constraint: None,
        }
    }

    /// The declared version, or `0.0.0` when none was declared.
    #[must_use]
    pub fn version_or_zero(&self) -> Version {
        self.version.clone().unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// Load and parse `dir/pubspec.yaml`.
    pub fn load(dir: &Path, sources: &SourceRegistry) -> Result<Self> {
        let path = dir.join(PUBSPEC_FILE);
        let contents = std::fs::read_to_string(&path).map_err(|e| TavernError::ParseError {
            subject: path.display().to_string(),
            reason: format!("could not read pubspec: {e}"),
        })?;
        Self::parse(&contents, dir, sources)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse a pubspec document. `containing_dir` anchors relative path
    /// dependencies.
    pub fn parse(contents: &str, containing_dir: &Path, sources: &SourceRegistry) -> Result<Self> {
        let document: Value = serde_yaml::from_str(contents).map_err(|e| {
            parse_error(format!("invalid YAML: {e}"))
        })?;
        let Value::Mapping(root) = document else {
            return Err(parse_error("pubspec must be a YAML mapping").into());
        };

        let name = match root.get(Value::from("name")) {
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err(parse_error("\"name\" must be a string").into()),
            None => return Err(parse_error("missing required key \"name\"").into()),
        };
        if !is_valid_name(&name) {
            return Err(parse_error(format!(
                "\"{name}\" is not a valid package name (lowercase letters, digits, underscores)"
            ))
            .into());
        }

        let version = match root.get(Value::from("version")) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(Version::parse(text)?),
            Some(_) => return Err(parse_error("\"version\" must be a string").into()),
        };

        let sdk_constraint = match root.get(Value::from("sdk")) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(VersionConstraint::parse(text)?),
            Some(_) => return Err(parse_error("\"sdk\" must be a constraint string").into()),
        };

        let dependencies =
            parse_section(&root, "dependencies", &name, containing_dir, sources)?;
        let dev_dependencies =
            parse_section(&root, "dev_dependencies", &name, containing_dir, sources)?;

        // The YAML parser already rejects a key repeated within one section;
        // what it cannot see is the same name spanning both sections.
        let runtime_names: std::collections::HashSet<&str> =
            dependencies.iter().map(Dependency::name).collect();
        if let Some(duplicate) =
            dev_dependencies.iter().find(|dep| runtime_names.contains(dep.name()))
        {
            return Err(parse_error(format!(
                "dependency \"{}\" appears in both \"dependencies\" and \"dev_dependencies\"",
                duplicate.name()
            ))
            .into());
        }

        Ok(Self {
            name,
            version,
            dependencies,
            dev_dependencies,
            sdk_constraint,
        })
    }
}

fn parse_error(reason: impl Into<String>) -> TavernError {
    TavernError::ParseError {
        subject: "pubspec".into(),
        reason: reason.into(),
    }
}

/// `true` for pub-style identifiers: lowercase ASCII letters, digits, and
/// underscores, not starting with a digit.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn parse_section(
    root: &serde_yaml::Mapping,
    section: &str,
    owner: &str,
    containing_dir: &Path,
    sources: &SourceRegistry,
) -> Result<Vec<Dependency>> {
    let mapping = match root.get(Value::from(section)) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Mapping(mapping)) => mapping,
        Some(_) => {
            return Err(parse_error(format!("\"{section}\" must be a mapping")).into());
        }
    };

    // The YAML parser rejects a key repeated within one mapping, so names
    // here are already unique per section.
    let mut dependencies = Vec::with_capacity(mapping.len());
    for (key, spec) in mapping {
        let Value::String(dep_name) = key else {
            return Err(parse_error(format!("non-string key in \"{section}\"")).into());
        };
        if dep_name == owner {
            return Err(parse_error(format!("package may not depend on itself ({owner})")).into());
        }
        dependencies.push(parse_dependency(dep_name, spec, containing_dir, sources)?);
    }
    Ok(dependencies)
}

fn parse_dependency(
    name: &str,
    spec: &Value,
    containing_dir: &Path,
    sources: &SourceRegistry,
) -> Result<Dependency> {
    match spec {
        // Bare constraint string: the default source locates the package by
        // name alone.
        Value::String(constraint) => {
            let source = sources.default_source()?;
            let description =
                source.parse_description(containing_dir, &Value::from(name), false)?;
            Ok(Dependency {
                target: PackageRef {
                    name: name.to_string(),
                    source: source.name().to_string(),
                    description,
                },
                constraint: VersionConstraint::parse(constraint)?,
            })
        }
        Value::Mapping(mapping) => {
            let mut constraint = VersionConstraint::any();
            let mut parsed: Option<(String, crate::package::Description)> = None;

            for (key, value) in mapping {
                let Value::String(key) = key else {
                    return Err(
                        parse_error(format!("non-string key in dependency \"{name}\"")).into()
                    );
                };
                if key == "version" {
                    let Value::String(text) = value else {
                        return Err(parse_error(format!(
                            "\"version\" of dependency \"{name}\" must be a string"
                        ))
                        .into());
                    };
                    constraint = VersionConstraint::parse(text)?;
                    continue;
                }
                let source = sources.get(key).map_err(|_| {
                    parse_error(format!("dependency \"{name}\" names unknown source \"{key}\""))
                })?;
                if parsed.is_some() {
                    return Err(parse_error(format!(
                        "dependency \"{name}\" declares more than one source"
                    ))
                    .into());
                }
                let description = source
                    .parse_description(containing_dir, value, false)
                    .with_context(|| format!("Invalid description for dependency \"{name}\""))?;
                parsed = Some((key.clone(), description));
            }

            let (source, description) = parsed.ok_or_else(|| {
                parse_error(format!("dependency \"{name}\" does not declare a source"))
            })?;
            Ok(Dependency {
                target: PackageRef {
                    name: name.to_string(),
                    source,
                    description,
                },
                constraint,
            })
        }
        _ => Err(parse_error(format!(
            "dependency \"{name}\" must be a constraint string or a source map"
        ))
        .into()),
    }
}
