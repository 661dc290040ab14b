//! The on-disk system cache and its single-flight download discipline.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/hosted/<host>/<name>-<version>/   extracted hosted archives
//! <root>/git/cache/<name>-<digest(url)>/   bare mirror clones, one per URL
//! <root>/git/<name>-<commit>/              working trees, one per commit
//! <root>/temp/                             staging for in-flight fetches
//! ```
//!
//! Entries are write-once: a fetch lands in `temp/` and is renamed into its
//! final location, after which the tree is never mutated. The staging area
//! is wiped every time a cache is opened, so a crashed fetch leaves no
//! debris behind.
//!
//! # Single-flight
//!
//! [`SystemCache::download`] keeps an in-memory map of in-flight fetches
//! keyed by [`PackageId`]. The first caller for an id starts the fetch and
//! registers a shared handle; later callers for the same id await that
//! handle, so at most one underlying fetch per id runs process-wide and
//! every waiter observes the same package or the same failure. Completed
//! entries are removed, which keeps retries possible after a failure; an
//! entry that already made it to disk is answered from disk without
//! re-registering. A pending fetch is cancelled only when its last waiter
//! goes away.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::core::{Session, TavernError};
use crate::package::{Package, PackageId};
use crate::source::SourceRegistry;
use crate::utils::fs::{empty_dir, ensure_dir};

/// Environment variable overriding the cache root location.
pub const CACHE_DIR_OVERRIDE: &str = "TAVERN_CACHE_DIR";

/// Directory name of the cache root under the home directory.
const DEFAULT_CACHE_DIR_NAME: &str = ".tavern-cache";

type PendingDownload = Shared<BoxFuture<'static, Result<Package, Arc<anyhow::Error>>>>;

/// The content-addressed store of downloaded packages.
///
/// Shared as `Arc<SystemCache>`: the download futures it spawns capture a
/// handle back into the cache.
pub struct SystemCache {
    root: PathBuf,
    sources: SourceRegistry,
    session: Session,
    pending: DashMap<PackageId, PendingDownload>,
}

impl SystemCache {
    /// Open (creating if needed) the cache rooted at `root` and wipe its
    /// staging area.
    pub fn new(root: PathBuf, sources: SourceRegistry, session: Session) -> Result<Arc<Self>> {
        ensure_dir(&root)?;
        let cache = Self {
            root,
            sources,
            session,
            pending: DashMap::new(),
        };
        empty_dir(&cache.temp_dir()).context("Failed to clean the cache staging area")?;
        Ok(Arc::new(cache))
    }

    /// The default cache root: `$TAVERN_CACHE_DIR`, else `~/.tavern-cache`.
    pub fn default_root() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(CACHE_DIR_OVERRIDE) {
            return Ok(PathBuf::from(dir));
        }
        let home = dirs::home_dir().ok_or_else(|| TavernError::Internal {
            message: "could not determine the home directory".into(),
        })?;
        Ok(home.join(DEFAULT_CACHE_DIR_NAME))
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The registry of sources this cache materializes for.
    #[must_use]
    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// The process context (HTTP client, descriptor pool, SDK version).
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Root of the hosted-source subtree.
    #[must_use]
    pub fn hosted_root(&self) -> PathBuf {
        self.root.join("hosted")
    }

    /// Root of the git subtree (working trees).
    #[must_use]
    pub fn git_root(&self) -> PathBuf {
        self.root.join("git")
    }

    /// Where bare mirror clones live.
    #[must_use]
    pub fn git_mirror_root(&self) -> PathBuf {
        self.git_root().join("cache")
    }

    /// The staging area for in-flight fetches. Same volume as the final
    /// entry paths, so the completing rename is atomic.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// A fresh staging directory inside [`SystemCache::temp_dir`]; deleted
    /// on drop unless its contents were renamed away.
    pub fn create_staging(&self) -> Result<tempfile::TempDir> {
        let temp = self.temp_dir();
        ensure_dir(&temp)?;
        tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(&temp)
            .context("Failed to create a staging directory")
    }

    /// Fetch `id` into the cache, deduplicating concurrent calls per id.
    ///
    /// # Errors
    ///
    /// [`TavernError::InvalidArgument`] when `id`'s source does not cache;
    /// otherwise whatever the underlying source fetch failed with, shared
    /// verbatim with every concurrent waiter.
    pub async fn download(self: Arc<Self>, id: &PackageId) -> Result<Package> {
        let source = self.sources.get(&id.source)?;
        if !source.should_cache() {
            return Err(TavernError::InvalidArgument {
                message: format!("packages from source \"{}\" cannot be downloaded", id.source),
            }
            .into());
        }

        let handle = self
            .pending
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!(target: "cache", package = %id, "starting download");
                let cache = Arc::clone(&self);
                let source = Arc::clone(source);
                let id = id.clone();
                async move {
                    let result =
                        source.download_to_system_cache(&id, &cache).await.map_err(Arc::new);
                    // Forget the flight either way so a failure can be
                    // retried; waiters still see the stored result.
                    cache.pending.remove(&id);
                    result
                }
                .boxed()
                .shared()
            })
            .value()
            .clone();

        match handle.await {
            Ok(package) => Ok(package),
            Err(shared) => Err(anyhow::Error::new(SharedError(shared))),
        }
    }

    /// Whether `id` is already materialized where its source expects it.
    pub fn is_materialized(&self, id: &PackageId) -> Result<bool> {
        let source = self.sources.get(&id.source)?;
        Ok(source.get_directory(id, self).exists())
    }
}

impl fmt::Debug for SystemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemCache")
            .field("root", &self.root)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// A download failure observed by a late single-flight waiter. Keeps the
/// original error chain reachable so callers can still classify it.
#[derive(Debug, Clone)]
struct SharedError(Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &anyhow::Error = &self.0;
        Some(inner.as_ref())
    }
}
