//! The hosted source: packages served by a central HTTPS index.
//!
//! One `GET <index>/api/packages/<name>` answers both solver questions
//! (the version list and the manifest of every version), so the response is
//! memoized per (index, package) for the life of the source. Archives are
//! fetched separately, verified when the index advertises a digest, and
//! expanded into `hosted/<host>/<name>-<version>/` in the system cache.
//!
//! The client pins the index API revision via the `Accept` header; an index
//! that cannot serve that revision answers 406, which is surfaced as a
//! non-retryable network error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::cache::SystemCache;
use crate::core::{Session, TavernError};
use crate::manifest::Pubspec;
use crate::package::{Description, Package, PackageId, PackageRef};
use crate::source::Source;
use crate::utils::archive;
use crate::utils::fs::ensure_dir;
use crate::version::Version;

/// Registry name of this source.
pub const SOURCE_NAME: &str = "hosted";

/// Index consulted when a dependency does not name one.
pub const DEFAULT_URL: &str = "https://pub.tavern.dev";

/// Environment variable overriding [`DEFAULT_URL`].
pub const HOSTED_URL_OVERRIDE: &str = "TAVERN_HOSTED_URL";

/// Accept header pinning the index API revision.
const API_ACCEPT: &str = "application/vnd.tavern.v2+json";

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[allow(dead_code)]
    name: String,
    versions: Vec<IndexVersion>,
}

#[derive(Debug, Deserialize)]
struct IndexVersion {
    version: Version,
    pubspec: serde_json::Value,
    #[serde(default)]
    archive_url: Option<String>,
    #[serde(default)]
    archive_sha256: Option<String>,
}

/// A package source served by a central hosted index.
pub struct HostedSource {
    session: Session,
    default_url: Url,
    index: DashMap<(String, String), Arc<IndexResponse>>,
}

impl HostedSource {
    /// A hosted source pointing at `default_url`.
    #[must_use]
    pub fn new(session: Session, default_url: Url) -> Self {
        Self {
            session,
            default_url,
            index: DashMap::new(),
        }
    }

    /// A hosted source honoring the `TAVERN_HOSTED_URL` override.
    pub fn from_env(session: Session) -> Result<Self> {
        let raw = std::env::var(HOSTED_URL_OVERRIDE).unwrap_or_else(|_| DEFAULT_URL.to_string());
        let url = Url::parse(&raw).map_err(|e| TavernError::ParseError {
            subject: format!("hosted URL \"{raw}\""),
            reason: e.to_string(),
        })?;
        Ok(Self::new(session, url))
    }

    fn split(description: &Description) -> Result<(&Url, &str)> {
        match description {
            Description::Hosted {
                url,
                name,
            } => Ok((url, name)),
            other => Err(TavernError::Internal {
                message: format!("hosted source handed a foreign description: {other:?}"),
            }
            .into()),
        }
    }

    /// Fetch (or recall) the index document for one package.
    async fn fetch_index(&self, index_url: &Url, name: &str) -> Result<Arc<IndexResponse>> {
        let key = (index_url.to_string(), name.to_string());
        if let Some(entry) = self.index.get(&key) {
            return Ok(Arc::clone(entry.value()));
        }

        let request_url = format!("{}api/packages/{name}", ensure_trailing_slash(index_url));
        let _permit = self.session.acquire_io().await?;
        tracing::debug!(target: "hosted", package = name, url = %request_url, "fetching index");

        let response = self
            .session
            .http()
            .get(&request_url)
            .header(reqwest::header::ACCEPT, API_ACCEPT)
            .send()
            .await
            .map_err(|e| request_error(&request_url, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TavernError::PackageNotFound {
                package: name.to_string(),
                reason: format!("unknown to the index at {index_url}"),
            }
            .into());
        }
        if status == reqwest::StatusCode::NOT_ACCEPTABLE {
            return Err(TavernError::NetworkError {
                url: request_url,
                status: Some(status.as_u16()),
                reason: format!("the index does not speak API revision \"{API_ACCEPT}\""),
            }
            .into());
        }
        if !status.is_success() {
            return Err(TavernError::NetworkError {
                url: request_url,
                status: Some(status.as_u16()),
                reason: format!("unexpected status {status}"),
            }
            .into());
        }

        let parsed: IndexResponse = response.json().await.map_err(|e| TavernError::ParseError {
            subject: request_url.clone(),
            reason: format!("malformed index response: {e}"),
        })?;
        let parsed = Arc::new(parsed);
        self.index.insert(key, Arc::clone(&parsed));
        Ok(parsed)
    }

    fn find_version<'a>(
        entry: &'a IndexResponse,
        id: &PackageId,
    ) -> Result<&'a IndexVersion> {
        entry.versions.iter().find(|v| v.version == id.version).ok_or_else(|| {
            TavernError::PackageNotFound {
                package: id.name.clone(),
                reason: format!("the index lists no version {}", id.version),
            }
            .into()
        })
    }

    fn archive_url(&self, index_url: &Url, id: &PackageId, version: &IndexVersion) -> String {
        version.archive_url.clone().unwrap_or_else(|| {
            format!(
                "{}packages/{}/versions/{}.tar.gz",
                ensure_trailing_slash(index_url),
                id.name,
                id.version
            )
        })
    }
}

fn ensure_trailing_slash(url: &Url) -> String {
    let mut text = url.to_string();
    if !text.ends_with('/') {
        text.push('/');
    }
    text
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

/// Directory-name-safe rendition of an index host.
fn host_dir(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    match url.port() {
        Some(port) => format!("{host}-{port}"),
        None => host.to_string(),
    }
}

#[async_trait]
impl Source for HostedSource {
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
            Value::String(name) if !from_lock_file => Ok(Description::Hosted {
                url: self.default_url.clone(),
                name: name.clone(),
            }),
            Value::Mapping(mapping) => {
                let name = match mapping.get(Value::from("name")) {
                    Some(Value::String(name)) => name.clone(),
                    _ => {
                        return Err(TavernError::ParseError {
                            subject: "hosted description".into(),
                            reason: "missing \"name\"".into(),
                        }
                        .into());
                    }
                };
                let url = match mapping.get(Value::from("url")) {
                    None => self.default_url.clone(),
                    Some(Value::String(raw_url)) => {
                        Url::parse(raw_url).map_err(|e| TavernError::ParseError {
                            subject: format!("hosted URL \"{raw_url}\""),
                            reason: e.to_string(),
                        })?
                    }
                    Some(_) => {
                        return Err(TavernError::ParseError {
                            subject: "hosted description".into(),
                            reason: "\"url\" must be a string".into(),
                        }
                        .into());
                    }
                };
                Ok(Description::Hosted {
                    url,
                    name,
                })
            }
            _ => Err(TavernError::ParseError {
                subject: "hosted description".into(),
                reason: if from_lock_file {
                    "lockfile descriptions must be in canonical map form".into()
                } else {
                    "expected a package name or a {name, url} map".into()
                },
            }
            .into()),
        }
    }

    fn serialize_description(&self, _containing_dir: &Path, description: &Description) -> Value {
        let mut mapping = serde_yaml::Mapping::new();
        if let Description::Hosted {
            url,
            name,
        } = description
        {
            mapping.insert(Value::from("name"), Value::from(name.as_str()));
            mapping.insert(Value::from("url"), Value::from(url.as_str()));
        }
        Value::Mapping(mapping)
    }

    fn descriptions_equal(&self, a: &Description, b: &Description) -> bool {
        a == b
    }

    async fn describe_uncached(&self, id: &PackageId, cache: &SystemCache) -> Result<Pubspec> {
        let (url, name) = Self::split(&id.description)?;
        let entry = self.fetch_index(url, name).await?;
        let version = Self::find_version(&entry, id)?;
        // JSON is a YAML subset, so the embedded pubspec document reuses the
        // pubspec parser as-is.
        let text = serde_json::to_string(&version.pubspec)
            .context("Failed to re-encode an index pubspec")?;
        Pubspec::parse(&text, &self.get_directory(id, cache), cache.sources())
            .with_context(|| format!("Invalid pubspec served for {id}"))
    }

    async fn get_versions(
        &self,
        package_ref: &PackageRef,
        _cache: &SystemCache,
    ) -> Result<Vec<Version>> {
        let (url, name) = Self::split(&package_ref.description)?;
        let entry = self.fetch_index(url, name).await?;
        Ok(entry.versions.iter().map(|v| v.version.clone()).collect())
    }

    async fn download_to_system_cache(
        &self,
        id: &PackageId,
        cache: &SystemCache,
    ) -> Result<Package> {
        let dir = self.get_directory(id, cache);
        if !dir.exists() {
            let (url, name) = Self::split(&id.description)?;
            let entry = self.fetch_index(url, name).await?;
            let version = Self::find_version(&entry, id)?;
            let archive_url = self.archive_url(url, id, version);

            let _permit = self.session.acquire_io().await?;
            tracing::info!(target: "hosted", package = %id, url = %archive_url, "downloading");
            let response = self
                .session
                .http()
                .get(&archive_url)
                .send()
                .await
                .map_err(|e| request_error(&archive_url, &e))?;
            if !response.status().is_success() {
                return Err(TavernError::NetworkError {
                    url: archive_url.clone(),
                    status: Some(response.status().as_u16()),
                    reason: format!("unexpected status {}", response.status()),
                }
                .into());
            }
            let bytes =
                response.bytes().await.map_err(|e| request_error(&archive_url, &e))?;

            if let Some(expected) = &version.archive_sha256 {
                let actual = hex::encode(Sha256::digest(&bytes));
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(TavernError::NetworkError {
                        url: archive_url.clone(),
                        status: None,
                        reason: format!(
                            "archive checksum mismatch: expected {expected}, got {actual}"
                        ),
                    }
                    .into());
                }
            }

            let staging = cache.create_staging()?;
            let unpacked = staging.path().join("contents");
            if archive_url.ends_with(".zip") {
                let archive_file = staging.path().join("archive.zip");
                std::fs::write(&archive_file, &bytes)?;
                archive::extract_zip(&archive_file, &unpacked)?;
            } else {
                archive::extract_tar_gz_reader(bytes.as_ref(), &unpacked)?;
            }

            if let Some(parent) = dir.parent() {
                ensure_dir(parent)?;
            }
            // A concurrent process may have landed the same entry; entries
            // are write-once, so theirs is as good as ours.
            if !dir.exists() {
                std::fs::rename(&unpacked, &dir).with_context(|| {
                    format!("Failed to move a fetched package into place at {}", dir.display())
                })?;
            }
        }

        let pubspec = Pubspec::load(&dir, cache.sources())?;
        Ok(Package {
            id: id.clone(),
            pubspec,
            dir,
        })
    }

    fn get_directory(&self, id: &PackageId, cache: &SystemCache) -> PathBuf {
        let host = match &id.description {
            Description::Hosted {
                url, ..
            } => host_dir(url),
            _ => host_dir(&self.default_url),
        };
        cache.hosted_root().join(host).join(format!("{}-{}", id.name, id.version))
    }
}
