//! Shared fixtures: an in-memory hosted source with instrumented fetches.
//!
//! Scenario tests run against a frozen index held in memory: no network,
//! no git binary. The fake registers under the name `hosted`, so bare
//! constraint strings in project pubspecs resolve to it, and it counts
//! every cache fetch per id so single-flight behavior is observable.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_yaml::Value;
use url::Url;

use tavern::cache::SystemCache;
use tavern::core::{Session, TavernError};
use tavern::entrypoint::Entrypoint;
use tavern::manifest::Pubspec;
use tavern::package::{Description, Package, PackageId, PackageRef};
use tavern::source::{PathSource, Source, SourceRegistry};
use tavern::version::Version;

/// Index URL baked into every fake description.
pub const FAKE_URL: &str = "https://index.test";

/// One package version of the in-memory index: its pubspec document.
type Index = HashMap<String, BTreeMap<Version, String>>;

/// Builder for the frozen index.
#[derive(Default)]
pub struct IndexBuilder {
    packages: Index,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name@version` with bare-constraint dependencies.
    #[must_use]
    pub fn package(self, name: &str, version: &str, deps: &[(&str, &str)]) -> Self {
        let mut pubspec = format!("name: {name}\nversion: {version}\n");
        if !deps.is_empty() {
            pubspec.push_str("dependencies:\n");
            for (dep, constraint) in deps {
                pubspec.push_str(&format!("  {dep}: \"{constraint}\"\n"));
            }
        }
        self.raw_package(name, version, &pubspec)
    }

    /// Add `name@version` with a verbatim pubspec document.
    #[must_use]
    pub fn raw_package(mut self, name: &str, version: &str, pubspec: &str) -> Self {
        self.packages
            .entry(name.to_string())
            .or_default()
            .insert(Version::parse(version).unwrap(), pubspec.to_string());
        self
    }
}

/// An in-memory hosted source with per-id download counters.
pub struct FakeHostedSource {
    url: Url,
    packages: Index,
    downloads: Mutex<HashMap<PackageId, usize>>,
}

impl FakeHostedSource {
    pub fn new(index: IndexBuilder) -> Self {
        Self {
            url: Url::parse(FAKE_URL).unwrap(),
            packages: index.packages,
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// How many cache fetches ran for `name@version`.
    pub fn download_count(&self, name: &str, version: &str) -> usize {
        let id = self.id(name, version);
        self.downloads.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    /// The id this index serves for `name@version`.
    pub fn id(&self, name: &str, version: &str) -> PackageId {
        PackageId {
            name: name.to_string(),
            source: "hosted".to_string(),
            version: Version::parse(version).unwrap(),
            description: Description::Hosted {
                url: self.url.clone(),
                name: name.to_string(),
            },
        }
    }

    fn pubspec_text(&self, id: &PackageId) -> Result<&String> {
        self.packages
            .get(&id.name)
            .and_then(|versions| versions.get(&id.version))
            .ok_or_else(|| {
                TavernError::PackageNotFound {
                    package: id.name.clone(),
                    reason: format!("the index lists no version {}", id.version),
                }
                .into()
            })
    }
}

#[async_trait]
impl Source for FakeHostedSource {
    fn name(&self) -> &str {
        "hosted"
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
                url: self.url.clone(),
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
                Ok(Description::Hosted {
                    url: self.url.clone(),
                    name,
                })
            }
            _ => Err(TavernError::ParseError {
                subject: "hosted description".into(),
                reason: "expected a name or map".into(),
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
        let text = self.pubspec_text(id)?;
        Pubspec::parse(text, cache.root(), cache.sources())
    }

    async fn get_versions(
        &self,
        package_ref: &PackageRef,
        _cache: &SystemCache,
    ) -> Result<Vec<Version>> {
        let versions = self.packages.get(&package_ref.name).ok_or_else(|| {
            TavernError::PackageNotFound {
                package: package_ref.name.clone(),
                reason: format!("unknown to the index at {}", self.url),
            }
        })?;
        Ok(versions.keys().cloned().collect())
    }

    async fn download_to_system_cache(
        &self,
        id: &PackageId,
        cache: &SystemCache,
    ) -> Result<Package> {
        let dir = self.get_directory(id, cache);
        if !dir.exists() {
            *self.downloads.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
            // Hold the flight open long enough for racing callers to pile
            // onto the same handle.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            let text = self.pubspec_text(id)?.clone();
            let staging = cache.create_staging()?;
            let contents = staging.path().join("contents");
            std::fs::create_dir_all(contents.join("lib"))?;
            std::fs::write(contents.join("pubspec.yaml"), &text)?;
            std::fs::write(contents.join("lib").join(format!("{}.txt", id.name)), "library")?;
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&contents, &dir)?;
        }

        let pubspec = Pubspec::load(&dir, cache.sources())?;
        Ok(Package {
            id: id.clone(),
            pubspec,
            dir,
        })
    }

    fn get_directory(&self, id: &PackageId, cache: &SystemCache) -> PathBuf {
        cache.root().join("fake").join(format!("{}-{}", id.name, id.version))
    }
}

/// A full fixture: fake index, registry, and a cache to install from.
pub struct Fixture {
    pub source: Arc<FakeHostedSource>,
    pub cache: Arc<SystemCache>,
    cache_dir: Arc<tempfile::TempDir>,
}

impl Fixture {
    /// Stand up a cache over the given frozen index.
    pub fn new(index: IndexBuilder) -> Self {
        let cache_dir = Arc::new(tempfile::tempdir().unwrap());
        Self::build(index, cache_dir)
    }

    /// Reopen the same cache directory with a fresh registry, counters, and
    /// (possibly different) index: a "new process" against warm state.
    pub fn reopen_with(&self, index: IndexBuilder) -> Fixture {
        Self::build(index, Arc::clone(&self.cache_dir))
    }

    fn build(index: IndexBuilder, cache_dir: Arc<tempfile::TempDir>) -> Self {
        let session = Session::new(Version::new(1, 0, 0)).unwrap();
        let source = Arc::new(FakeHostedSource::new(index));
        let mut registry = SourceRegistry::new();
        registry.register(Arc::clone(&source) as Arc<dyn Source>).unwrap();
        registry.register(Arc::new(PathSource::new())).unwrap();
        registry.set_default("hosted").unwrap();

        let cache =
            SystemCache::new(cache_dir.path().to_path_buf(), registry, session).unwrap();
        Self {
            source,
            cache,
            cache_dir,
        }
    }

    /// Write a project directory holding `pubspec.yaml` and load it.
    pub fn project(&self, dir: &Path, pubspec: &str) -> Entrypoint {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("pubspec.yaml"), pubspec).unwrap();
        Entrypoint::load(dir, Arc::clone(&self.cache)).unwrap()
    }
}
