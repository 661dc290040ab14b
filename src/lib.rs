//! tavern: a source-based package manager.
//!
//! Given a root project whose `pubspec.yaml` declares dependencies with
//! version constraints and sources (a hosted index, a git repository, or a
//! local path), tavern selects a concrete version of every
//! transitively-required package, materializes the selection into the
//! project's `packages/` directory, and records it in `pubspec.lock` so the
//! next run is reproducible.
//!
//! # Core modules
//!
//! - [`version`] - semantic versions and the range/constraint algebra
//! - [`package`] - refs, resolved ids, and loaded packages
//! - [`manifest`] - pubspec parsing and validation
//! - [`source`] - pluggable package sources (hosted, git, path)
//! - [`cache`] - the on-disk system cache with single-flight downloads
//! - [`lockfile`] - the persisted selection of the last resolve
//! - [`solver`] - the backtracking version solver
//! - [`entrypoint`] - the load → solve → fetch → lock pipeline
//! - [`graph`] - the loaded adjacency view of a solved set
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tavern::cache::SystemCache;
//! use tavern::core::Session;
//! use tavern::entrypoint::Entrypoint;
//! use tavern::source::SourceRegistry;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = Session::detect()?;
//! let sources = SourceRegistry::with_defaults(&session)?;
//! let cache = SystemCache::new(SystemCache::default_root()?, sources, session)?;
//!
//! let project = Entrypoint::load(std::path::Path::new("."), Arc::clone(&cache))?;
//! let report = project.acquire_dependencies(&Default::default()).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod core;
pub mod entrypoint;
pub mod git;
pub mod graph;
pub mod lockfile;
pub mod logging;
pub mod manifest;
pub mod package;
pub mod sdk;
pub mod solver;
pub mod source;
pub mod utils;
pub mod version;
