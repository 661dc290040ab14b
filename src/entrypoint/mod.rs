//! The entrypoint: a root project and its acquire pipeline.
//!
//! [`Entrypoint::acquire_dependencies`] is the whole-graph operation behind
//! every install and upgrade: load the root pubspec and previous lockfile,
//! solve, report the changes, rebuild the `packages/` directory (symlinks
//! into the cache for cached sources, direct installs for path sources),
//! resolve final ids, and atomically write the new lockfile.
//!
//! [`Entrypoint::ensure_lockfile_is_up_to_date`] is the fast path wrapped
//! around it: when the lockfile still satisfies the current pubspec and
//! everything it pins is materialized, nothing runs at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::SystemCache;
use crate::core::TavernError;
use crate::lockfile::LockFile;
use crate::manifest::Pubspec;
use crate::package::{Package, PackageId};
use crate::solver::{SolveOptions, SolveReport, solve};
use crate::utils::fs::{empty_dir, relink_dir};

/// Directory the pipeline materializes resolved packages into.
pub const PACKAGES_DIR: &str = "packages";

/// A root project bound to a system cache.
#[derive(Debug)]
pub struct Entrypoint {
    root: Package,
    cache: Arc<SystemCache>,
}

impl Entrypoint {
    /// Load the project rooted at `dir`.
    pub fn load(dir: &Path, cache: Arc<SystemCache>) -> Result<Self> {
        let pubspec = Pubspec::load(dir, cache.sources())?;
        let id = PackageId::root(&pubspec.name, pubspec.version_or_zero(), dir);
        Ok(Self {
            root: Package {
                id,
                pubspec,
                dir: dir.to_path_buf(),
            },
            cache,
        })
    }

    /// The loaded root package.
    #[must_use]
    pub fn root(&self) -> &Package {
        &self.root
    }

    /// The system cache this project installs from.
    #[must_use]
    pub fn cache(&self) -> &Arc<SystemCache> {
        &self.cache
    }

    /// `<project>/packages`.
    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.dir.join(PACKAGES_DIR)
    }

    /// Solve, materialize, and lock the whole dependency graph. Returns the
    /// report of what changed relative to the previous lockfile.
    pub async fn acquire_dependencies(&self, options: &SolveOptions) -> Result<SolveReport> {
        let previous = LockFile::load(&self.root.dir, self.cache.sources())?;

        let result = solve(&self.cache, &self.root, &previous, options).await?;
        let solved: Vec<PackageId> = result.non_root_packages().cloned().collect();

        let report = SolveReport::diff(&previous, &solved);
        tracing::info!(target: "entrypoint", "resolved {} packages\n{report}", solved.len());

        let packages_dir = self.packages_dir();
        empty_dir(&packages_dir).context("Failed to clear the packages directory")?;

        // Cached sources first, fanned out through the single-flight cache;
        // a second acquire racing this one shares the same fetches.
        let downloads = solved.iter().filter_map(|id| {
            let source = self.cache.sources().get(&id.source).ok()?;
            source.should_cache().then(|| {
                let cache = Arc::clone(&self.cache);
                let id = id.clone();
                async move { cache.download(&id).await }
            })
        });
        let downloaded = futures::future::try_join_all(downloads).await?;

        for package in &downloaded {
            let lib = package.dir.join("lib");
            if lib.is_dir() {
                relink_dir(&lib, &packages_dir.join(&package.id.name))?;
            }
            // No lib/ means nothing to import; the package still resolves.
        }

        for id in &solved {
            let source = self.cache.sources().get(&id.source)?;
            if source.should_cache() {
                continue;
            }
            let installed = source.get(id, &packages_dir.join(&id.name)).await?;
            if !installed {
                return Err(TavernError::PackageNotFound {
                    package: id.name.clone(),
                    reason: format!("source \"{}\" could not install it", id.source),
                }
                .into());
            }
        }

        // Pin final identities (notably git commits) before locking.
        let mut locked = BTreeMap::new();
        for id in &solved {
            let source = self.cache.sources().get(&id.source)?;
            let resolved = source.resolve_id(id, &self.cache).await?;
            locked.insert(resolved.name.clone(), resolved);
        }
        let lockfile = LockFile {
            packages: locked,
            sdk_constraint: self.root.pubspec.sdk_constraint.clone(),
        };
        lockfile.save(&self.root.dir, self.cache.sources())?;

        // The project can import itself the same way dependents do.
        let root_lib = self.root.dir.join("lib");
        if root_lib.is_dir() {
            relink_dir(&root_lib, &packages_dir.join(&self.root.id.name))?;
        }

        tracing::debug!(
            target: "entrypoint",
            attempts = result.attempted_solutions,
            changed = report.changed_count(),
            "dependencies acquired"
        );
        Ok(report)
    }

    /// Run the full pipeline only when the lockfile no longer matches the
    /// pubspec or something it pins is missing from disk. Returns `None`
    /// when everything was already up to date.
    pub async fn ensure_lockfile_is_up_to_date(&self) -> Result<Option<SolveReport>> {
        let lockfile = LockFile::load(&self.root.dir, self.cache.sources())?;
        if self.lockfile_is_current(&lockfile)? {
            tracing::debug!(target: "entrypoint", "lockfile is up to date");
            return Ok(None);
        }
        self.acquire_dependencies(&SolveOptions::default()).await.map(Some)
    }

    /// Whether `lockfile` satisfies the current pubspec and is fully
    /// materialized.
    fn lockfile_is_current(&self, lockfile: &LockFile) -> Result<bool> {
        let direct = self
            .root
            .pubspec
            .dependencies
            .iter()
            .chain(&self.root.pubspec.dev_dependencies);
        for dep in direct {
            let Some(locked) = lockfile.package(dep.name()) else {
                return Ok(false);
            };
            if locked.source != dep.target.source {
                return Ok(false);
            }
            if !dep.constraint.allows(&locked.version) {
                return Ok(false);
            }
            let source = self.cache.sources().get(&dep.target.source)?;
            if !source.descriptions_equal(&locked.description, &dep.target.description) {
                return Ok(false);
            }
        }

        for id in lockfile.packages.values() {
            if !self.cache.is_materialized(id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
