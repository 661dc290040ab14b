//! The git source: packages pinned to a commit of a git repository.
//!
//! Two cache layers keep network traffic down. A bare mirror clone is kept
//! per repository URL under `git/cache/<name>-<digest(url)>/` and refreshed
//! at most once per process; every required commit then gets its own
//! working-tree clone under `git/<name>-<commit>/`, made *from the mirror*
//! so the checkout costs no second network round trip. Manifests are read
//! straight out of the mirror with `git show`, so describing a version never
//! materializes a working tree.
//!
//! When no `git` binary is on PATH, repositories hosted on github.com fall
//! back to a tarball snapshot fetched through the GitHub API; the commit is
//! recovered from the archive's top-level directory name. Everything else
//! fails with `GitNotFound`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_yaml::Value;
use sha1::{Digest, Sha1};
use url::Url;

use crate::cache::SystemCache;
use crate::core::{Session, TavernError};
use crate::git::{GitCommand, git_available};
use crate::manifest::{PUBSPEC_FILE, Pubspec};
use crate::package::{Description, Package, PackageId, PackageRef};
use crate::source::Source;
use crate::utils::fs::ensure_dir;
use crate::version::Version;

/// Registry name of this source.
pub const SOURCE_NAME: &str = "git";

/// Ref fetched when a dependency names none.
const DEFAULT_REF: &str = "HEAD";

/// A package source backed by git repositories.
pub struct GitSource {
    session: Session,
    /// Repository URLs whose mirror was already refreshed this process.
    fetched: DashMap<String, ()>,
    /// Fallback snapshots by (url, ref): the resolved commit and its
    /// working-tree directory.
    snapshots: DashMap<(String, String), (String, PathBuf)>,
}

impl GitSource {
    /// A git source sharing `session`'s HTTP client and descriptor pool.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            fetched: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    fn split(description: &Description) -> Result<(&str, &str)> {
        match description {
            Description::Git {
                url,
                ..
            } => {
                let reference = description
                    .effective_git_ref()
                    .unwrap_or(DEFAULT_REF);
                Ok((url.as_str(), reference))
            }
            other => Err(TavernError::Internal {
                message: format!("git source handed a foreign description: {other:?}"),
            }
            .into()),
        }
    }

    /// `git/cache/<name>-<digest(url)>`: the bare mirror for one URL.
    fn mirror_dir(cache: &SystemCache, name: &str, url: &str) -> PathBuf {
        let digest = hex::encode(Sha1::digest(url.as_bytes()));
        cache.git_mirror_root().join(format!("{name}-{digest}"))
    }

    /// Clone or refresh the mirror for `url`, refreshing at most once per
    /// process.
    async fn ensure_mirror(
        &self,
        cache: &SystemCache,
        name: &str,
        url: &str,
    ) -> Result<PathBuf> {
        let mirror = Self::mirror_dir(cache, name, url);
        let _permit = self.session.acquire_io().await?;
        if mirror.exists() {
            if !self.fetched.contains_key(url) {
                tracing::debug!(target: "git", url, "refreshing mirror");
                GitCommand::fetch().current_dir(&mirror).execute().await?;
                self.fetched.insert(url.to_string(), ());
            }
        } else {
            if let Some(parent) = mirror.parent() {
                ensure_dir(parent)?;
            }
            tracing::info!(target: "git", url, "mirroring repository");
            GitCommand::clone_mirror(url, &mirror).execute().await?;
            self.fetched.insert(url.to_string(), ());
        }
        Ok(mirror)
    }

    async fn rev_parse(mirror: &Path, reference: &str) -> Result<String> {
        GitCommand::rev_parse(reference)
            .current_dir(mirror)
            .execute_stdout()
            .await
            .with_context(|| format!("Failed to resolve git ref \"{reference}\""))
    }

    /// Read and parse `pubspec.yaml` at a revision without a working tree.
    async fn pubspec_at(
        &self,
        cache: &SystemCache,
        mirror: &Path,
        name: &str,
        revision: &str,
    ) -> Result<Pubspec> {
        let contents = GitCommand::show_file(revision, PUBSPEC_FILE)
            .current_dir(mirror)
            .execute_stdout()
            .await
            .map_err(|e| TavernError::PackageNotFound {
                package: name.to_string(),
                reason: format!("no {PUBSPEC_FILE} at revision {revision}: {e}"),
            })?;
        Pubspec::parse(&contents, mirror, cache.sources())
    }

    /// Resolve `(url, ref)` to a commit, using git when available and the
    /// github fallback otherwise.
    async fn resolve_revision(
        &self,
        cache: &SystemCache,
        name: &str,
        url: &str,
        reference: &str,
    ) -> Result<String> {
        if git_available() {
            let mirror = self.ensure_mirror(cache, name, url).await?;
            Self::rev_parse(&mirror, reference).await
        } else {
            let (sha, _) = self.fallback_snapshot(cache, name, url, reference).await?;
            Ok(sha)
        }
    }

    /// Fetch a tarball snapshot of a github-hosted repository, landing it
    /// directly as the commit's working tree. Returns the commit recovered
    /// from the archive's top-level directory name.
    async fn fallback_snapshot(
        &self,
        cache: &SystemCache,
        name: &str,
        url: &str,
        reference: &str,
    ) -> Result<(String, PathBuf)> {
        let key = (url.to_string(), reference.to_string());
        if let Some(entry) = self.snapshots.get(&key) {
            return Ok(entry.value().clone());
        }

        let (owner, repo) = github_coordinates(url).ok_or(TavernError::GitNotFound)?;
        let tarball_url =
            format!("https://api.github.com/repos/{owner}/{repo}/tarball/{reference}");

        let _permit = self.session.acquire_io().await?;
        tracing::info!(target: "git", url = %tarball_url, "fetching tarball snapshot (git unavailable)");
        let response = self
            .session
            .http()
            .get(&tarball_url)
            .header(reqwest::header::USER_AGENT, "tavern")
            .send()
            .await
            .map_err(|e| request_error(&tarball_url, &e))?;
        if !response.status().is_success() {
            return Err(TavernError::NetworkError {
                url: tarball_url.clone(),
                status: Some(response.status().as_u16()),
                reason: format!("unexpected status {}", response.status()),
            }
            .into());
        }
        let bytes = response.bytes().await.map_err(|e| request_error(&tarball_url, &e))?;

        // The archive holds a single `<owner>-<repo>-<sha>/` directory; the
        // trailing component is the abbreviated commit we pin to.
        let staging = cache.create_staging()?;
        let raw = staging.path().join("raw");
        let mut tar =
            tar::Archive::new(flate2::read::GzDecoder::new(std::io::Cursor::new(&bytes)));
        tar.unpack(&raw).context("Malformed github tarball")?;

        let top = std::fs::read_dir(&raw)?
            .next()
            .transpose()?
            .filter(|entry| entry.path().is_dir())
            .ok_or_else(|| TavernError::Internal {
                message: "github tarball contained no top-level directory".into(),
            })?;
        let top_name = top.file_name().to_string_lossy().into_owned();
        let sha = top_name
            .rsplit('-')
            .next()
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| TavernError::Internal {
                message: format!("could not recover a commit from \"{top_name}\""),
            })?
            .to_string();

        let dest = cache.git_root().join(format!("{name}-{sha}"));
        if !dest.exists() {
            ensure_dir(&cache.git_root())?;
            std::fs::rename(top.path(), &dest).with_context(|| {
                format!("Failed to move a snapshot into place at {}", dest.display())
            })?;
        }

        let entry = (sha, dest);
        self.snapshots.insert(key, entry.clone());
        Ok(entry)
    }
}

fn request_error(url: &str, error: &reqwest::Error) -> TavernError {
    if error.is_timeout() {
        TavernError::Timeout {
            url: url.to_string(),
        }
    } else {
        TavernError::NetworkError {
            url: url.to_string(),
            status: error.status().map(|s| s.as_u16()),
            reason: error.to_string(),
        }
    }
}

/// `(owner, repo)` when `url` points at github.com.
fn github_coordinates(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != "github.com" {
        return None;
    }
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?.to_string();
    let repo = segments.next()?.trim_end_matches(".git").to_string();
    Some((owner, repo))
}

#[async_trait]
impl Source for GitSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn should_cache(&self) -> bool {
        true
    }

    fn parse_description(
        &self,
        _containing_dir: &Path,
        raw: &Value,
        from_lock_file: bool,
    ) -> Result<Description> {
        match raw {
            Value::String(url) if !from_lock_file => Ok(Description::Git {
                url: url.clone(),
                reference: DEFAULT_REF.to_string(),
                resolved_ref: None,
            }),
            Value::Mapping(mapping) => {
                let url = match mapping.get(Value::from("url")) {
                    Some(Value::String(url)) => url.clone(),
                    _ => {
                        return Err(TavernError::ParseError {
                            subject: "git description".into(),
                            reason: "missing \"url\"".into(),
                        }
                        .into());
                    }
                };
                let reference = match mapping.get(Value::from("ref")) {
                    None | Some(Value::Null) => DEFAULT_REF.to_string(),
                    Some(Value::String(reference)) => reference.clone(),
                    Some(_) => {
                        return Err(TavernError::ParseError {
                            subject: "git description".into(),
                            reason: "\"ref\" must be a string".into(),
                        }
                        .into());
                    }
                };
                let resolved_ref = match mapping.get(Value::from("resolved-ref")) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(sha)) => Some(sha.clone()),
                    Some(_) => {
                        return Err(TavernError::ParseError {
                            subject: "git description".into(),
                            reason: "\"resolved-ref\" must be a string".into(),
                        }
                        .into());
                    }
                };
                Ok(Description::Git {
                    url,
                    reference,
                    resolved_ref,
                })
            }
            _ => Err(TavernError::ParseError {
                subject: "git description".into(),
                reason: if from_lock_file {
                    "lockfile descriptions must be in canonical map form".into()
                } else {
                    "expected a URL or a {url, ref} map".into()
                },
            }
            .into()),
        }
    }

    fn serialize_description(&self, _containing_dir: &Path, description: &Description) -> Value {
        let mut mapping = serde_yaml::Mapping::new();
        if let Description::Git {
            url,
            reference,
            resolved_ref,
        } = description
        {
            mapping.insert(Value::from("url"), Value::from(url.as_str()));
            mapping.insert(Value::from("ref"), Value::from(reference.as_str()));
            if let Some(sha) = resolved_ref {
                mapping.insert(Value::from("resolved-ref"), Value::from(sha.as_str()));
            }
        }
        Value::Mapping(mapping)
    }

    fn descriptions_equal(&self, a: &Description, b: &Description) -> bool {
        // Url and symbolic ref; an attached resolved-ref does not change
        // which package two unresolved specs name.
        a == b
    }

    async fn describe_uncached(&self, id: &PackageId, cache: &SystemCache) -> Result<Pubspec> {
        let (url, reference) = Self::split(&id.description)?;
        if git_available() {
            let mirror = self.ensure_mirror(cache, &id.name, url).await?;
            let revision = Self::rev_parse(&mirror, reference).await?;
            self.pubspec_at(cache, &mirror, &id.name, &revision).await
        } else {
            let (_, dir) = self.fallback_snapshot(cache, &id.name, url, reference).await?;
            Pubspec::load(&dir, cache.sources())
        }
    }

    async fn get_versions(
        &self,
        package_ref: &PackageRef,
        cache: &SystemCache,
    ) -> Result<Vec<Version>> {
        // A git dependency pins one revision, so it contributes exactly the
        // version its pubspec declares there.
        let (url, reference) = Self::split(&package_ref.description)?;
        let pubspec = if git_available() {
            let mirror = self.ensure_mirror(cache, &package_ref.name, url).await?;
            let revision = Self::rev_parse(&mirror, reference).await?;
            self.pubspec_at(cache, &mirror, &package_ref.name, &revision).await?
        } else {
            let (_, dir) =
                self.fallback_snapshot(cache, &package_ref.name, url, reference).await?;
            Pubspec::load(&dir, cache.sources())?
        };
        Ok(vec![pubspec.version_or_zero()])
    }

    async fn download_to_system_cache(
        &self,
        id: &PackageId,
        cache: &SystemCache,
    ) -> Result<Package> {
        let (url, reference) = Self::split(&id.description)?;

        let dir = if git_available() {
            let mirror = self.ensure_mirror(cache, &id.name, url).await?;
            let revision = Self::rev_parse(&mirror, reference).await?;
            let dest = cache.git_root().join(format!("{}-{revision}", id.name));
            if !dest.exists() {
                let staging = cache.create_staging()?;
                let checkout = staging.path().join("checkout");
                GitCommand::clone_local(&mirror, &checkout).execute().await?;
                GitCommand::checkout(&revision).current_dir(&checkout).execute().await?;
                ensure_dir(&cache.git_root())?;
                if !dest.exists() {
                    std::fs::rename(&checkout, &dest).with_context(|| {
                        format!("Failed to move a checkout into place at {}", dest.display())
                    })?;
                }
            }
            dest
        } else {
            let (_, dir) = self.fallback_snapshot(cache, &id.name, url, reference).await?;
            dir
        };

        let pubspec = Pubspec::load(&dir, cache.sources())?;
        Ok(Package {
            id: id.clone(),
            pubspec,
            dir,
        })
    }

    fn get_directory(&self, id: &PackageId, cache: &SystemCache) -> PathBuf {
        // Exact once resolve_id has attached the commit; the pipeline always
        // resolves before it materializes.
        let revision = id.description.effective_git_ref().unwrap_or(DEFAULT_REF);
        cache.git_root().join(format!("{}-{revision}", id.name))
    }

    async fn resolve_id(&self, id: &PackageId, cache: &SystemCache) -> Result<PackageId> {
        if let Description::Git {
            url,
            reference,
            resolved_ref,
        } = &id.description
        {
            if resolved_ref.is_some() {
                return Ok(id.clone());
            }
            let revision = self.resolve_revision(cache, &id.name, url, reference).await?;
            let mut resolved = id.clone();
            resolved.description = Description::Git {
                url: url.clone(),
                reference: reference.clone(),
                resolved_ref: Some(revision),
            };
            return Ok(resolved);
        }
        Ok(id.clone())
    }
}
