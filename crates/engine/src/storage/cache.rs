//! The model cache registry.
//!
//! Tracks which model weights are on disk, stamps use recency, and evicts
//! least-recently-used entries to make room. Writes go through the sharded
//! map one key at a time; reads never block.

use axon_api::storage::StorageEstimator;
use axon_telemetry::Clock;
use axon_types::config::CacheConfig;
use axon_types::model::ModelId;
use axon_types::report::CacheStats;
use dashmap::DashMap;
use std::sync::Arc;

/// One cached model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Size of the weights on disk.
    pub size_bytes: u64,
    /// Last use stamp; the eviction order.
    pub last_used_at_ms: u64,
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Evicted model ids, oldest first.
    pub evicted: Vec<ModelId>,
    /// Total bytes freed.
    pub freed_bytes: u64,
}

/// The cache manager. Owns all cache metadata; other components consult it
/// read-mostly and stamp use through [`CacheManager::touch_model`].
#[derive(Debug)]
pub struct CacheManager {
    entries: DashMap<ModelId, CacheEntry>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn StorageEstimator>,
}

impl CacheManager {
    /// An empty cache registry.
    pub fn new(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        estimator: Arc<dyn StorageEstimator>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock,
            estimator,
        }
    }

    /// All cached models, least recently used first.
    pub fn get_models(&self) -> Vec<(ModelId, CacheEntry)> {
        let mut models: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        models.sort_by(|a, b| {
            a.1.last_used_at_ms
                .cmp(&b.1.last_used_at_ms)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });
        models
    }

    /// Whether the model's weights are cached.
    pub fn has_model(&self, id: &ModelId) -> bool {
        self.entries.contains_key(id)
    }

    /// Records a freshly downloaded model.
    pub fn record_model(&self, id: ModelId, size_bytes: u64) {
        let now = self.clock.now_ms();
        self.entries.insert(
            id,
            CacheEntry {
                size_bytes,
                last_used_at_ms: now,
            },
        );
    }

    /// Stamps a model as just used. Returns false for unknown ids.
    pub fn touch_model(&self, id: &ModelId) -> bool {
        let now = self.clock.now_ms();
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.last_used_at_ms = now;
                true
            }
            None => false,
        }
    }

    /// Removes one model. Returns the freed bytes, if it existed.
    pub fn delete_model(&self, id: &ModelId) -> Option<u64> {
        self.entries.remove(id).map(|(_, e)| e.size_bytes)
    }

    /// Evicts oldest entries until at least `required_bytes` are freed or
    /// the registry is empty. `protect` is never evicted.
    pub fn evict_for_space(
        &self,
        required_bytes: u64,
        protect: Option<&ModelId>,
    ) -> EvictionOutcome {
        let mut outcome = EvictionOutcome::default();
        for (id, entry) in self.get_models() {
            if outcome.freed_bytes >= required_bytes {
                break;
            }
            if Some(&id) == protect {
                continue;
            }
            self.entries.remove(&id);
            outcome.freed_bytes += entry.size_bytes;
            tracing::info!(target: "model_cache", "evicted '{}' ({} bytes)", id, entry.size_bytes);
            outcome.evicted.push(id);
        }
        outcome
    }

    /// Evicts until usage sits at or below the configured quota ratio and
    /// the configured free headroom exists. A platform without a storage
    /// estimate makes this a no-op.
    pub async fn auto_evict(&self, protect: Option<&ModelId>) -> EvictionOutcome {
        let Some(estimate) = self.estimator.estimate().await else {
            return EvictionOutcome::default();
        };

        let max_usage = (estimate.quota_bytes as f64 * self.config.max_usage_ratio) as u64;
        let mut usage = estimate.usage_bytes;
        let mut outcome = EvictionOutcome::default();
        for (id, entry) in self.get_models() {
            let free = estimate.quota_bytes.saturating_sub(usage);
            if usage <= max_usage && free >= self.config.min_free_bytes {
                break;
            }
            if Some(&id) == protect {
                continue;
            }
            self.entries.remove(&id);
            usage = usage.saturating_sub(entry.size_bytes);
            outcome.freed_bytes += entry.size_bytes;
            tracing::info!(target: "model_cache", "auto-evicted '{}' ({} bytes)", id, entry.size_bytes);
            outcome.evicted.push(id);
        }
        outcome
    }

    /// Aggregate view for diagnostics.
    pub async fn get_stats(&self) -> CacheStats {
        let total_bytes = self.entries.iter().map(|e| e.value().size_bytes).sum();
        let estimate = self.estimator.estimate().await;
        CacheStats {
            model_count: self.entries.len(),
            total_bytes,
            quota_bytes: estimate.map(|e| e.quota_bytes),
            usage_ratio: estimate
                .filter(|e| e.quota_bytes > 0)
                .map(|e| e.usage_bytes as f64 / e.quota_bytes as f64),
        }
    }

    /// Drops every entry. Returns the number removed.
    pub fn purge_all(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        tracing::info!(target: "model_cache", "purged {} cached models", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_api::storage::FixedStorageEstimator;
    use axon_telemetry::ManualClock;
    use axon_types::MIB;

    fn manager_with(
        clock: Arc<ManualClock>,
        estimator: FixedStorageEstimator,
    ) -> CacheManager {
        CacheManager::new(CacheConfig::default(), clock, Arc::new(estimator))
    }

    fn seed(manager: &CacheManager, clock: &ManualClock) {
        // Ages: a oldest, c newest.
        manager.record_model(ModelId::new("a"), 10);
        clock.advance(10);
        manager.record_model(ModelId::new("b"), 20);
        clock.advance(10);
        manager.record_model(ModelId::new("c"), 30);
    }

    #[test]
    fn test_lru_order_and_touch() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::unsupported());
        seed(&manager, &clock);

        let order: Vec<_> = manager.get_models().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ModelId::new("a"), ModelId::new("b"), ModelId::new("c")]);

        clock.advance(10);
        assert!(manager.touch_model(&ModelId::new("a")));
        let order: Vec<_> = manager.get_models().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ModelId::new("b"), ModelId::new("c"), ModelId::new("a")]);

        assert!(!manager.touch_model(&ModelId::new("missing")));
    }

    #[test]
    fn test_evict_for_space_frees_oldest_first() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::unsupported());
        seed(&manager, &clock);

        let outcome = manager.evict_for_space(25, None);
        assert_eq!(outcome.evicted, vec![ModelId::new("a"), ModelId::new("b")]);
        assert_eq!(outcome.freed_bytes, 30);
        assert!(manager.has_model(&ModelId::new("c")));
    }

    #[test]
    fn test_evict_for_space_skips_protected() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::unsupported());
        seed(&manager, &clock);

        let protect = ModelId::new("a");
        let outcome = manager.evict_for_space(15, Some(&protect));
        assert_eq!(outcome.evicted, vec![ModelId::new("b")]);
        assert!(manager.has_model(&ModelId::new("a")));
    }

    #[test]
    fn test_evict_for_space_drains_to_empty() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::unsupported());
        seed(&manager, &clock);

        let outcome = manager.evict_for_space(u64::MAX, None);
        assert_eq!(outcome.evicted.len(), 3);
        assert_eq!(manager.get_models().len(), 0);
    }

    #[tokio::test]
    async fn test_auto_evict_restores_headroom() {
        let clock = Arc::new(ManualClock::new(0));
        // Quota 1000 MiB, used 900 MiB: over the 0.8 ratio (800 MiB).
        let manager = manager_with(
            clock.clone(),
            FixedStorageEstimator::new(1_000 * MIB, 900 * MIB),
        );
        manager.record_model(ModelId::new("big"), 300 * MIB);
        clock.advance(10);
        manager.record_model(ModelId::new("small"), 50 * MIB);

        let outcome = manager.auto_evict(None).await;
        // Evicting "big" brings usage to 600 MiB (<= 800) with 400 MiB free
        // (>= 200 MiB min), so "small" survives.
        assert_eq!(outcome.evicted, vec![ModelId::new("big")]);
        assert!(manager.has_model(&ModelId::new("small")));
    }

    #[tokio::test]
    async fn test_auto_evict_noop_without_estimator() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::unsupported());
        seed(&manager, &clock);
        let outcome = manager.auto_evict(None).await;
        assert!(outcome.evicted.is_empty());
        assert_eq!(manager.get_models().len(), 3);
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager_with(clock.clone(), FixedStorageEstimator::new(100, 50));
        seed(&manager, &clock);

        let stats = manager.get_stats().await;
        assert_eq!(stats.model_count, 3);
        assert_eq!(stats.total_bytes, 60);
        assert_eq!(stats.quota_bytes, Some(100));
        assert_eq!(stats.usage_ratio, Some(0.5));

        assert_eq!(manager.purge_all(), 3);
        assert_eq!(manager.get_stats().await.model_count, 0);
    }
}
