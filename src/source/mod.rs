//! Pluggable package sources.
//!
//! A [`Source`] is a provider of package metadata and content. Three ship
//! with the crate:
//!
//! - [`hosted`]: a central HTTPS index serving version lists and archives,
//! - [`git`]: packages pinned to a commit of a git repository,
//! - [`path`]: packages in a local directory, never copied into the cache.
//!
//! The solver and pipeline never talk to a concrete source; they go through
//! the [`SourceRegistry`], which dispatches by the source name recorded in
//! refs, pubspecs, and the lockfile. Sources share no implementation; each
//! realizes the full operation set against its own backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_yaml::Value;

use crate::cache::SystemCache;
use crate::core::{Session, TavernError};
use crate::manifest::Pubspec;
use crate::package::{Description, Package, PackageId, PackageRef};
use crate::version::Version;

pub mod git;
pub mod hosted;
pub mod path;

pub use git::GitSource;
pub use hosted::HostedSource;
pub use path::PathSource;

/// The capability interface every package source implements.
///
/// Async operations receive the [`SystemCache`] handle: it carries the cache
/// root the source materializes into, the session (HTTP client, descriptor
/// pool), and the registry needed to parse manifests of fetched packages.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier used in pubspecs and lockfiles.
    fn name(&self) -> &str;

    /// Whether resolved packages are materialized into the system cache.
    /// When `false`, [`Source::get`] installs directly at a destination
    /// instead.
    fn should_cache(&self) -> bool;

    /// Validate and normalize a raw description from a pubspec or lockfile.
    ///
    /// `containing_dir` anchors relative paths. When `from_lock_file` is
    /// set the description must already be in canonical (map) form.
    fn parse_description(
        &self,
        containing_dir: &Path,
        raw: &Value,
        from_lock_file: bool,
    ) -> Result<Description>;

    /// The lockfile rendition of a description; inverse of
    /// [`Source::parse_description`].
    fn serialize_description(&self, containing_dir: &Path, description: &Description) -> Value;

    /// Source-defined equivalence of two descriptions.
    fn descriptions_equal(&self, a: &Description, b: &Description) -> bool;

    /// Fetch the manifest for `id` without necessarily materializing the
    /// full package.
    async fn describe_uncached(&self, id: &PackageId, cache: &SystemCache) -> Result<Pubspec>;

    /// Enumerate candidate versions of `package_ref`, unordered.
    async fn get_versions(
        &self,
        package_ref: &PackageRef,
        cache: &SystemCache,
    ) -> Result<Vec<Version>>;

    /// Fetch `id` into the system cache and return the loaded package.
    /// Only meaningful when [`Source::should_cache`] is `true`.
    async fn download_to_system_cache(
        &self,
        id: &PackageId,
        cache: &SystemCache,
    ) -> Result<Package> {
        let _ = cache;
        Err(TavernError::InvalidArgument {
            message: format!("source {} does not cache package {id}", self.name()),
        }
        .into())
    }

    /// Install `id` directly at `dest`. Only meaningful when
    /// [`Source::should_cache`] is `false`. A `false` return means the
    /// package could not be installed at all.
    async fn get(&self, id: &PackageId, dest: &Path) -> Result<bool> {
        let _ = (id, dest);
        Err(TavernError::InvalidArgument {
            message: format!("source {} installs through the system cache", self.name()),
        }
        .into())
    }

    /// Where a (cached or uncached) package lives on disk.
    fn get_directory(&self, id: &PackageId, cache: &SystemCache) -> PathBuf;

    /// Attach disambiguating data to `id` before it is locked (e.g. the git
    /// commit SHA). Defaults to the identity.
    async fn resolve_id(&self, id: &PackageId, cache: &SystemCache) -> Result<PackageId> {
        let _ = cache;
        Ok(id.clone())
    }
}

/// Maps source names to implementations and knows the default source bare
/// constraint strings resolve against.
#[derive(Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
    default: Option<String>,
}

impl SourceRegistry {
    /// An empty registry with no default source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            default: None,
        }
    }

    /// The stock registry: hosted (default), git, and path sources sharing
    /// one session.
    pub fn with_defaults(session: &Session) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(HostedSource::from_env(session.clone())?))?;
        registry.register(Arc::new(GitSource::new(session.clone())))?;
        registry.register(Arc::new(PathSource::new()))?;
        registry.set_default(hosted::SOURCE_NAME)?;
        Ok(registry)
    }

    /// Add a source. Registering a second source under the same name is
    /// rejected.
    pub fn register(&mut self, source: Arc<dyn Source>) -> Result<()> {
        let name = source.name().to_string();
        if self.sources.contains_key(&name) {
            return Err(TavernError::Internal {
                message: format!("source \"{name}\" is already registered"),
            }
            .into());
        }
        self.sources.insert(name, source);
        Ok(())
    }

    /// Choose the source bare constraint strings resolve against.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.sources.contains_key(name) {
            return Err(TavernError::Internal {
                message: format!("cannot default to unregistered source \"{name}\""),
            }
            .into());
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    /// The default source.
    pub fn default_source(&self) -> Result<&Arc<dyn Source>> {
        let name = self.default.as_deref().ok_or_else(|| TavernError::Internal {
            message: "no default source configured".into(),
        })?;
        self.get(name)
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn Source>> {
        self.sources.get(name).ok_or_else(|| {
            anyhow::anyhow!("unknown source \"{name}\"")
        })
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A stock registry for unit tests.
#[cfg(test)]
pub(crate) fn test_registry() -> SourceRegistry {
    let session = Session::new(Version::new(1, 0, 0)).expect("session");
    SourceRegistry::with_defaults(&session).expect("registry")
}
