//! The resident-model manager.
//!
//! Keeps up to `max_loaded_models` models warm, waits out concurrent loads
//! of the same model, and evicts the least-recently-used non-active ready
//! model when capacity is exceeded. The active model is never evicted.

use crate::storage::CacheManager;
use axon_api::provider::Provider;
use axon_telemetry::Clock;
use axon_types::config::EngineConfig;
use axon_types::error::EngineError;
use axon_types::model::{LoadedModel, ModelId, ModelSpec, ModelStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

struct Inner {
    models: HashMap<ModelId, LoadedModel>,
    load_waiters: HashMap<ModelId, Arc<Notify>>,
    active: Option<ModelId>,
}

/// Tracks which models are resident and which one is active.
pub struct ModelManager {
    inner: Mutex<Inner>,
    max_loaded_models: usize,
    auto_unload: bool,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheManager>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("max_loaded_models", &self.max_loaded_models)
            .field("auto_unload", &self.auto_unload)
            .finish()
    }
}

impl ModelManager {
    /// A manager with no resident models.
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>, cache: Arc<CacheManager>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                models: HashMap::new(),
                load_waiters: HashMap::new(),
                active: None,
            }),
            // A zero would make every load impossible; one is the floor.
            max_loaded_models: config.max_loaded_models.max(1),
            auto_unload: config.auto_unload,
            clock,
            cache,
        }
    }

    /// The active model id, if any.
    pub async fn active_model(&self) -> Option<ModelId> {
        self.inner.lock().await.active.clone()
    }

    /// All resident-model records, for diagnostics.
    pub async fn loaded_models(&self) -> Vec<LoadedModel> {
        self.inner.lock().await.models.values().cloned().collect()
    }

    /// Ensures `spec` is resident and ready.
    ///
    /// Already-ready models are touched and returned immediately; a load in
    /// flight elsewhere is awaited; otherwise the provider is initialized
    /// here, evicting the LRU non-active ready model first when capacity
    /// demands and `auto_unload` permits.
    pub async fn load_model(
        &self,
        spec: &ModelSpec,
        provider: Arc<dyn Provider>,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock().await;
                match inner.models.get(&spec.id).map(|m| m.status) {
                    Some(ModelStatus::Ready) => {
                        let now = self.clock.now_ms();
                        if let Some(record) = inner.models.get_mut(&spec.id) {
                            record.last_used_at_ms = now;
                        }
                        self.cache.touch_model(&spec.id);
                        return Ok(());
                    }
                    Some(ModelStatus::Loading) => inner
                        .load_waiters
                        .get(&spec.id)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(Notify::new())),
                    _ => {
                        self.admit(&mut inner, spec, provider.id())?;
                        break;
                    }
                }
            };
            // Register interest before releasing the lock so a completion
            // between unlock and await cannot be missed.
            let notified = waiter.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            notified.await;
        }

        let result = provider.init(config, Some(spec), None).await;

        let mut inner = self.inner.lock().await;
        let now = self.clock.now_ms();
        let waiter = inner.load_waiters.remove(&spec.id);
        match &result {
            Ok(()) => {
                if let Some(record) = inner.models.get_mut(&spec.id) {
                    record.status = ModelStatus::Ready;
                    record.loaded_at_ms = now;
                    record.last_used_at_ms = now;
                }
                if inner.active.is_none() {
                    inner.active = Some(spec.id.clone());
                }
                self.cache.touch_model(&spec.id);
                tracing::info!(target: "models", "model '{}' ready", spec.id);
            }
            Err(error) => {
                if let Some(record) = inner.models.get_mut(&spec.id) {
                    record.status = ModelStatus::Error;
                    record.error = Some(error.to_string());
                }
                tracing::warn!(target: "models", "model '{}' failed to load: {}", spec.id, error);
            }
        }
        if let Some(waiter) = waiter {
            waiter.notify_waiters();
        }
        result
    }

    /// Books a loading slot, evicting if needed. Caller holds the lock.
    fn admit(
        &self,
        inner: &mut Inner,
        spec: &ModelSpec,
        provider: axon_types::model::ProviderId,
    ) -> Result<(), EngineError> {
        let resident = inner
            .models
            .values()
            .filter(|m| matches!(m.status, ModelStatus::Loading | ModelStatus::Ready))
            .count();
        if resident >= self.max_loaded_models {
            if !self.auto_unload {
                return Err(EngineError::ModelLoad(format!(
                    "model capacity {} reached and auto_unload is disabled",
                    self.max_loaded_models
                )));
            }
            let victim = inner
                .models
                .values()
                .filter(|m| {
                    m.status == ModelStatus::Ready && Some(&m.spec.id) != inner.active.as_ref()
                })
                .min_by_key(|m| m.last_used_at_ms)
                .map(|m| m.spec.id.clone());
            match victim {
                Some(victim) => {
                    inner.models.remove(&victim);
                    tracing::info!(target: "models", "evicted resident model '{}'", victim);
                }
                None => {
                    return Err(EngineError::ModelLoad(
                        "model capacity reached with no evictable model".to_string(),
                    ));
                }
            }
        }

        let now = self.clock.now_ms();
        inner.models.insert(
            spec.id.clone(),
            LoadedModel {
                spec: spec.clone(),
                provider,
                status: ModelStatus::Loading,
                loaded_at_ms: 0,
                last_used_at_ms: now,
                error: None,
            },
        );
        inner
            .load_waiters
            .insert(spec.id.clone(), Arc::new(Notify::new()));
        Ok(())
    }

    /// Registers a model that was initialized outside the manager (the
    /// download path drives `provider.init` itself for progress reporting)
    /// as resident and ready, honoring the same capacity rules as a load.
    pub async fn adopt(
        &self,
        spec: &ModelSpec,
        provider: axon_types::model::ProviderId,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        if inner
            .models
            .get(&spec.id)
            .map(|m| m.status == ModelStatus::Ready)
            .unwrap_or(false)
        {
            return Ok(());
        }
        self.admit(&mut inner, spec, provider)?;
        inner.load_waiters.remove(&spec.id);
        let now = self.clock.now_ms();
        if let Some(record) = inner.models.get_mut(&spec.id) {
            record.status = ModelStatus::Ready;
            record.loaded_at_ms = now;
            record.last_used_at_ms = now;
        }
        if inner.active.is_none() {
            inner.active = Some(spec.id.clone());
        }
        self.cache.touch_model(&spec.id);
        Ok(())
    }

    /// Makes a ready model the active one and stamps its use.
    pub async fn set_active_model(&self, id: &ModelId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now_ms();
        match inner.models.get_mut(id) {
            Some(record) if record.status == ModelStatus::Ready => {
                record.last_used_at_ms = now;
            }
            Some(record) => {
                return Err(EngineError::ModelLoad(format!(
                    "model '{}' is not ready (status {:?})",
                    id, record.status
                )));
            }
            None => {
                return Err(EngineError::ModelLoad(format!("model '{id}' is not loaded")));
            }
        }
        inner.active = Some(id.clone());
        self.cache.touch_model(id);
        Ok(())
    }

    /// Drops a resident model. Clears the active slot if it pointed here.
    pub async fn unload_model(&self, id: &ModelId) -> Option<LoadedModel> {
        let mut inner = self.inner.lock().await;
        let removed = inner.models.remove(id);
        if inner.active.as_ref() == Some(id) {
            inner.active = None;
        }
        if removed.is_some() {
            tracing::info!(target: "models", "unloaded model '{}'", id);
        }
        removed
    }

    /// Drops every resident model and the active slot.
    pub async fn unload_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.models.clear();
        inner.load_waiters.clear();
        inner.active = None;
    }
}
