//! Package identity: references, resolved ids, and loaded packages.
//!
//! A [`PackageRef`] names a package at a source without committing to a
//! version; a [`PackageId`] is a ref plus the concrete [`Version`] the solver
//! chose. Both carry a [`Description`], the source-specific locator (hosted
//! index URL, git URL and ref, or a filesystem path).
//!
//! Equality and hashing are structural over the normalized description. The
//! normalization that needs IO (resolving symlinks for path descriptions)
//! lives on the owning source (`Source::descriptions_equal`), not here, so
//! these types stay cheap map keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use url::Url;

use crate::manifest::Pubspec;
use crate::version::Version;

/// Source name reserved for the root package. Never registered in the
/// source registry.
pub const ROOT_SOURCE: &str = "root";

/// The source-specific locator carried by every ref and id.
///
/// One variant per source kind, dispatched by the source registry. The git
/// variant's `resolved_ref` is the commit SHA attached by `resolve_id`; it
/// takes precedence over the symbolic ref for fetch operations but does not
/// participate in description equality, so an unresolved spec and its
/// resolved counterpart still name the same package.
#[derive(Debug, Clone)]
pub enum Description {
    /// A package served by a hosted index.
    Hosted {
        /// Root URL of the index.
        url: Url,
        /// Package name as the index knows it.
        name: String,
    },
    /// A package fetched from a git repository.
    Git {
        /// Clone URL. Kept as a string: scp-style `git@host:repo` URLs are
        /// valid here but not valid [`Url`]s.
        url: String,
        /// Symbolic ref to fetch (branch, tag, or commit). Defaults to
        /// `HEAD`.
        reference: String,
        /// Commit SHA attached once resolved.
        resolved_ref: Option<String>,
    },
    /// A package on the local filesystem.
    Path {
        /// Directory containing the package's pubspec.
        path: PathBuf,
        /// Whether the path was written relative to its containing pubspec.
        relative: bool,
    },
}

impl Description {
    /// The commit to fetch for a git description: the resolved SHA when
    /// present, the symbolic ref otherwise. `None` for other variants.
    #[must_use]
    pub fn effective_git_ref(&self) -> Option<&str> {
        match self {
            Self::Git {
                reference,
                resolved_ref,
                ..
            } => Some(resolved_ref.as_deref().unwrap_or(reference)),
            _ => None,
        }
    }
}

impl PartialEq for Description {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Hosted {
                    url: a_url,
                    name: a_name,
                },
                Self::Hosted {
                    url: b_url,
                    name: b_name,
                },
            ) => a_url == b_url && a_name == b_name,
            (
                Self::Git {
                    url: a_url,
                    reference: a_ref,
                    ..
                },
                Self::Git {
                    url: b_url,
                    reference: b_ref,
                    ..
                },
            ) => a_url == b_url && a_ref == b_ref,
            (
                Self::Path {
                    path: a_path,
                    ..
                },
                Self::Path {
                    path: b_path,
                    ..
                },
            ) => crate::utils::fs::normalize_path(a_path) == crate::utils::fs::normalize_path(b_path),
            _ => false,
        }
    }
}

impl Eq for Description {}

impl Hash for Description {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Hosted {
                url,
                name,
            } => {
                0u8.hash(state);
                url.as_str().hash(state);
                name.hash(state);
            }
            Self::Git {
                url,
                reference,
                ..
            } => {
                1u8.hash(state);
                url.hash(state);
                reference.hash(state);
            }
            Self::Path {
                path,
                ..
            } => {
                2u8.hash(state);
                crate::utils::fs::normalize_path(path).hash(state);
            }
        }
    }
}

/// A package name bound to a source and description, with no version chosen
/// yet. What a dependency in a pubspec points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    /// Package name.
    pub name: String,
    /// Name of the owning source in the registry.
    pub source: String,
    /// Source-specific locator.
    pub description: Description,
}

impl PackageRef {
    /// Pair this ref with a resolved version.
    #[must_use]
    pub fn at_version(&self, version: Version) -> PackageId {
        PackageId {
            name: self.name.clone(),
            source: self.source.clone(),
            version,
            description: self.description.clone(),
        }
    }

    /// Whether this ref names the root package.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.source == ROOT_SOURCE
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.name, self.source)
    }
}

/// A package ref resolved to a concrete version.
///
/// For git ids the description additionally carries the resolved commit SHA
/// once `resolve_id` has run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    /// Package name.
    pub name: String,
    /// Name of the owning source in the registry.
    pub source: String,
    /// The chosen version.
    pub version: Version,
    /// Source-specific locator, possibly disambiguated.
    pub description: Description,
}

impl PackageId {
    /// The id of a root package rooted at `dir`.
    #[must_use]
    pub fn root(name: &str, version: Version, dir: &std::path::Path) -> Self {
        Self {
            name: name.to_string(),
            source: ROOT_SOURCE.to_string(),
            version,
            description: Description::Path {
                path: dir.to_path_buf(),
                relative: false,
            },
        }
    }

    /// Whether this id names the root package.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.source == ROOT_SOURCE
    }

    /// The versionless ref for this id.
    #[must_use]
    pub fn as_ref(&self) -> PackageRef {
        PackageRef {
            name: self.name.clone(),
            source: self.source.clone(),
            description: self.description.clone(),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.source)
    }
}

/// A loaded package: its id, parsed pubspec, and location on disk (a cache
/// entry, a path-source directory, or the root project itself).
#[derive(Debug, Clone)]
pub struct Package {
    /// Resolved identity.
    pub id: PackageId,
    /// Parsed manifest.
    pub pubspec: Pubspec,
    /// Directory holding the package contents.
    pub dir: PathBuf,
}

impl Package {
    /// Whether this is the root package of the current entrypoint.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git(url: &str, reference: &str, resolved: Option<&str>) -> Description {
        Description::Git {
            url: url.into(),
            reference: reference.into(),
            resolved_ref: resolved.map(Into::into),
        }
    }

    #[test]
    fn git_equality_ignores_resolved_ref() {
        let unresolved = git("https://example.org/a.git", "main", None);
        let resolved = git("https://example.org/a.git", "main", Some("abc123"));
        assert_eq!(unresolved, resolved);

        let other_ref = git("https://example.org/a.git", "dev", None);
        assert_ne!(unresolved, other_ref);
    }

    #[test]
    fn effective_ref_prefers_resolved() {
        assert_eq!(git("u", "main", Some("abc")).effective_git_ref(), Some("abc"));
        assert_eq!(git("u", "main", None).effective_git_ref(), Some("main"));
    }

    #[test]
    fn path_equality_normalizes_lexically() {
        let a = Description::Path {
            path: PathBuf::from("/work/pkgs/./foo"),
            relative: false,
        };
        let b = Description::Path {
            path: PathBuf::from("/work/pkgs/foo"),
            relative: true,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn root_id_is_root() {
        let id = PackageId::root("app", Version::new(0, 0, 0), std::path::Path::new("/proj"));
        assert!(id.is_root());
        assert!(id.as_ref().is_root());
    }
}
