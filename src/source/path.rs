//! The path source: packages living in a local directory.
//!
//! Path packages are never copied into the system cache: the directory
//! itself is the package, and installation links the destination straight at
//! it. A path dependency contributes exactly one candidate version, the one
//! its pubspec declares.
//!
//! Two descriptions are considered equal when their paths name the same
//! directory after resolving symlinks, so a dependency written through a
//! symlinked workspace unifies with one written against the real location.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_yaml::Value;

use crate::cache::SystemCache;
use crate::core::TavernError;
use crate::manifest::{PUBSPEC_FILE, Pubspec};
use crate::package::{Description, PackageId, PackageRef};
use crate::source::Source;
use crate::utils::fs::{normalize_path, relative_from, resolve_symlinks};
use crate::version::Version;

/// Registry name of this source.
pub const SOURCE_NAME: &str = "path";

/// A package source for local directories.
#[derive(Debug, Default)]
pub struct PathSource;

impl PathSource {
    /// A new path source.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn split(description: &Description) -> Result<(&PathBuf, bool)> {
        match description {
            Description::Path {
                path,
                relative,
            } => Ok((path, *relative)),
            other => Err(TavernError::Internal {
                message: format!("path source handed a foreign description: {other:?}"),
            }
            .into()),
        }
    }

    fn load_pubspec(&self, package_ref_name: &str, dir: &Path, cache: &SystemCache) -> Result<Pubspec> {
        if !dir.join(PUBSPEC_FILE).exists() {
            return Err(TavernError::PackageNotFound {
                package: package_ref_name.to_string(),
                reason: format!("no package found at {}", dir.display()),
            }
            .into());
        }
        Pubspec::load(dir, cache.sources())
    }
}

#[async_trait]
impl Source for PathSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn should_cache(&self) -> bool {
        false
    }

    fn parse_description(
        &self,
        containing_dir: &Path,
        raw: &Value,
        from_lock_file: bool,
    ) -> Result<Description> {
        match raw {
            Value::String(text) if !from_lock_file => {
                let path = PathBuf::from(text);
                let relative = path.is_relative();
                let path = if relative {
                    containing_dir.join(path)
                } else {
                    path
                };
                Ok(Description::Path {
                    path,
                    relative,
                })
            }
            Value::Mapping(mapping) => {
                let path = match mapping.get(Value::from("path")) {
                    Some(Value::String(path)) => PathBuf::from(path),
                    _ => {
                        return Err(TavernError::ParseError {
                            subject: "path description".into(),
                            reason: "missing \"path\"".into(),
                        }
                        .into());
                    }
                };
                let relative = match mapping.get(Value::from("relative")) {
                    None => path.is_relative(),
                    Some(Value::Bool(relative)) => *relative,
                    Some(_) => {
                        return Err(TavernError::ParseError {
                            subject: "path description".into(),
                            reason: "\"relative\" must be a boolean".into(),
                        }
                        .into());
                    }
                };
                let path = if path.is_relative() {
                    containing_dir.join(path)
                } else {
                    path
                };
                Ok(Description::Path {
                    path,
                    relative,
                })
            }
            _ => Err(TavernError::ParseError {
                subject: "path description".into(),
                reason: if from_lock_file {
                    "lockfile descriptions must be in canonical map form".into()
                } else {
                    "expected a path string or a {path, relative} map".into()
                },
            }
            .into()),
        }
    }

    fn serialize_description(&self, containing_dir: &Path, description: &Description) -> Value {
        let mut mapping = serde_yaml::Mapping::new();
        if let Description::Path {
            path,
            relative,
        } = description
        {
            let (text, relative) = if *relative {
                match relative_from(path, containing_dir) {
                    Some(relative_path) => (relative_path, true),
                    None => (normalize_path(path), false),
                }
            } else {
                (normalize_path(path), false)
            };
            mapping.insert(Value::from("path"), Value::from(text.display().to_string()));
            mapping.insert(Value::from("relative"), Value::from(relative));
        }
        Value::Mapping(mapping)
    }

    fn descriptions_equal(&self, a: &Description, b: &Description) -> bool {
        match (a, b) {
            (
                Description::Path {
                    path: a_path,
                    ..
                },
                Description::Path {
                    path: b_path,
                    ..
                },
            ) => resolve_symlinks(a_path) == resolve_symlinks(b_path),
            _ => false,
        }
    }

    async fn describe_uncached(&self, id: &PackageId, cache: &SystemCache) -> Result<Pubspec> {
        let (path, _) = Self::split(&id.description)?;
        self.load_pubspec(&id.name, path, cache)
    }

    async fn get_versions(
        &self,
        package_ref: &PackageRef,
        cache: &SystemCache,
    ) -> Result<Vec<Version>> {
        let (path, _) = Self::split(&package_ref.description)?;
        let pubspec = self.load_pubspec(&package_ref.name, path, cache)?;
        Ok(vec![pubspec.version_or_zero()])
    }

    async fn get(&self, id: &PackageId, dest: &Path) -> Result<bool> {
        let (path, _) = Self::split(&id.description)?;
        if !path.is_dir() {
            return Ok(false);
        }
        crate::utils::fs::relink_dir(path, dest)?;
        Ok(true)
    }

    fn get_directory(&self, id: &PackageId, _cache: &SystemCache) -> PathBuf {
        match &id.description {
            Description::Path {
                path, ..
            } => path.clone(),
            _ => PathBuf::new(),
        }
    }
}
