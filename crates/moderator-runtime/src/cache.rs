//! Rubric cache.
//!
//! Loading validates the schema and builds the arena, so repeated requests
//! with the same assets share one `Arc<RubricTree>` keyed by fingerprint.
//! Sub-score results are never cached: every evaluation calls the model.

use moka::future::Cache;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use moderator_core::{fingerprint, load, RubricError, RubricTree};

use crate::config::CacheConfig;

pub struct RubricCache {
    cache: Cache<String, Arc<RubricTree>>,
}

impl RubricCache {
    pub fn new(max_rubrics: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_rubrics)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_rubrics, config.ttl)
    }

    /// Return the cached tree for these sources, loading it on a miss.
    ///
    /// Load failures are returned and not cached.
    pub async fn get_or_load(
        &self,
        rubric_source: &str,
        lore_source: &str,
    ) -> Result<Arc<RubricTree>, RubricError> {
        let key = fingerprint(rubric_source, lore_source);
        if let Some(tree) = self.cache.get(&key).await {
            tracing::debug!(fingerprint = %short(&key), "Rubric cache hit");
            return Ok(tree);
        }

        let tree = Arc::new(load(rubric_source, lore_source)?);
        self.cache.insert(key, Arc::clone(&tree)).await;
        Ok(tree)
    }

    pub async fn get_or_load_files(
        &self,
        rubric_path: impl AsRef<Path>,
        lore_path: impl AsRef<Path>,
    ) -> Result<Arc<RubricTree>, RubricError> {
        let rubric_source = tokio::fs::read_to_string(rubric_path).await?;
        let lore_source = tokio::fs::read_to_string(lore_path).await?;
        self.get_or_load(&rubric_source, &lore_source).await
    }

    pub async fn get(&self, fingerprint: &str) -> Option<Arc<RubricTree>> {
        self.cache.get(fingerprint).await
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for RubricCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

pub(crate) fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
