//! Fleet configuration sources.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_reconcile::TopLevelConfig;
use tokio::sync::RwLock;
use tracing::warn;

/// Where the fleet configuration document comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<TopLevelConfig>;
}

/// Reads the fleet configuration from a JSON file on every fetch.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> Result<TopLevelConfig> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading fleet config {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("decoding fleet config {}", self.path.display()))
    }
}

/// Serves a fixed document.
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub TopLevelConfig);

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<TopLevelConfig> {
        Ok(self.0.clone())
    }
}

/// Wraps a source and serves the last good document when a fetch fails.
pub struct LastGoodConfigSource<S> {
    inner: S,
    last_good: RwLock<Option<TopLevelConfig>>,
}

impl<S: ConfigSource> LastGoodConfigSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last_good: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<S: ConfigSource> ConfigSource for LastGoodConfigSource<S> {
    async fn fetch(&self) -> Result<TopLevelConfig> {
        match self.inner.fetch().await {
            Ok(config) => {
                *self.last_good.write().await = Some(config.clone());
                Ok(config)
            }
            Err(e) => match self.last_good.read().await.clone() {
                Some(config) => {
                    warn!(error = %e, "Fetching fleet config failed, using last good config");
                    Ok(config)
                }
                None => Err(e.context("no previously fetched fleet config to fall back to")),
            },
        }
    }
}
