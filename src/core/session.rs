//! The per-process context handle.
//!
//! Process-wide resources (the active SDK version, the descriptor pool that
//! caps simultaneous fd-consuming operations, and the shared HTTP client with
//! its per-request deadline) are initialized once here and passed by handle
//! into sources, the cache, and the pipeline. Nothing in the crate reaches
//! for them through globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::sdk;
use crate::version::Version;

/// Simultaneous file-descriptor-consuming operations allowed per process.
pub const DESCRIPTOR_POOL_SIZE: usize = 32;

/// Per-request HTTP deadline. Elapse surfaces as `TavernError::Timeout`.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared process context: SDK version, descriptor pool, HTTP client.
///
/// Cheap to clone; clones share the pool and client.
#[derive(Debug, Clone)]
pub struct Session {
    /// The active SDK version packages are checked against.
    pub sdk_version: Version,
    io_pool: Arc<Semaphore>,
    http: reqwest::Client,
}

impl Session {
    /// Build a session with an explicit SDK version.
    pub fn new(sdk_version: Version) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to construct HTTP client")?;
        Ok(Self {
            sdk_version,
            io_pool: Arc::new(Semaphore::new(DESCRIPTOR_POOL_SIZE)),
            http,
        })
    }

    /// Build a session with the detected SDK version (honoring the
    /// `_PUB_TEST_SDK_VERSION` override).
    pub fn detect() -> Result<Self> {
        Self::new(sdk::active_version()?)
    }

    /// The shared HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Take a descriptor-pool permit; waits when the pool is exhausted.
    /// Queued waiters are cancelled along with their caller.
    pub async fn acquire_io(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.io_pool)
            .acquire_owned()
            .await
            .context("descriptor pool closed")
    }
}
