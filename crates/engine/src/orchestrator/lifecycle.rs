//! Bring-up stage handlers: boot, selection, preflight, cache, download,
//! warmup, teardown, and the on-demand healthcheck.
//!
//! Each handler performs one transition and schedules at most one async
//! operation; successful stages enqueue the next stage internally so a
//! single CMD_INIT walks the whole chain to READY.

use super::{Orchestrator, WorkerSignal};
use crate::fsm::Transition;
use crate::hooks::InitContext;
use crate::select::select_provider;
use crate::storage::quota::preflight;
use axon_types::error::EngineError;
use axon_types::model::ModelSpec;
use axon_types::protocol::{Command, DownloadProgress, Event, HealthOutcome};
use axon_types::report::QuotaReport;
use axon_types::state::{DownloadVariant, StateKind};
use tokio::sync::mpsc;

fn free_bytes(report: &QuotaReport) -> u64 {
    report
        .quota_bytes
        .zip(report.usage_bytes)
        .map(|(quota, usage)| quota.saturating_sub(usage))
        .unwrap_or(0)
}

impl Orchestrator {
    pub(crate) async fn handle_init(&mut self, model: Option<ModelSpec>) {
        if let Some(model) = model {
            self.pending_model = Some(model);
        }
        let Some(model) = self.pending_model.clone() else {
            self.report_error(EngineError::ModelLoad(
                "no model spec provided and none pending".to_string(),
            ))
            .await;
            return;
        };
        if !self.apply_or_report(Transition::Booting).await {
            return;
        }
        self.hooks
            .run_before_init(&InitContext { model: Some(model) })
            .await;
        self.internal.push_back(Command::SelectProvider);
    }

    pub(crate) async fn handle_select_provider(&mut self) {
        if !self.apply_or_report(Transition::SelectingProvider).await {
            return;
        }
        match select_provider(&self.config, &self.providers).await {
            Ok(selection) => {
                self.active_supports = selection.detect.supports;
                self.active_provider = Some(selection.provider);
                self.selection_report = Some(selection.report.clone());
                self.emit(Event::ProviderSelected {
                    report: selection.report,
                });
                self.internal.push_back(Command::PreflightQuota);
            }
            Err((error, report)) => {
                self.selection_report = Some(report);
                self.route_error(error).await;
            }
        }
    }

    pub(crate) async fn handle_preflight_quota(&mut self) {
        if !self.apply_or_report(Transition::PreflightQuota).await {
            return;
        }
        let Some(model) = self.pending_model.clone() else {
            self.route_error(EngineError::ModelLoad(
                "no model spec pending at preflight".to_string(),
            ))
            .await;
            return;
        };

        let mut report = preflight(self.estimator.as_ref(), model.size_bytes).await;
        if !report.ok {
            // Make room before giving up: drop the oldest cached models
            // (never the active one) and measure again.
            let shortfall = report
                .required_bytes
                .saturating_sub(free_bytes(&report));
            let active = self.models.active_model().await;
            let outcome = self.cache.evict_for_space(shortfall, active.as_ref());
            if !outcome.evicted.is_empty() {
                tracing::info!(
                    target: "orchestrator",
                    "evicted {} cached models ({} bytes) to satisfy preflight",
                    outcome.evicted.len(),
                    outcome.freed_bytes
                );
                report = preflight(self.estimator.as_ref(), model.size_bytes).await;
            }
        }
        self.quota_report = Some(report);
        self.emit(Event::QuotaResult { report });
        if report.ok {
            self.internal.push_back(Command::CheckCache);
        } else {
            self.route_error(EngineError::QuotaInsufficient {
                required_bytes: report.required_bytes,
                available_bytes: free_bytes(&report),
            })
            .await;
        }
    }

    pub(crate) async fn handle_check_cache(&mut self) {
        if !self.apply_or_report(Transition::CheckingCache).await {
            return;
        }
        let Some(model) = self.pending_model.clone() else {
            self.route_error(EngineError::ModelLoad(
                "no model spec pending at cache check".to_string(),
            ))
            .await;
            return;
        };

        let cached = self.cache.has_model(&model.id);
        self.emit(Event::CacheResult {
            model_id: model.id.clone(),
            cached,
        });
        // A zero-size spec (a model the provider carries built in) has
        // nothing to fetch.
        if cached || model.size_bytes == 0 {
            self.internal.push_back(Command::Warmup);
        } else {
            self.internal.push_back(Command::DownloadModel);
        }
    }

    pub(crate) async fn handle_download_model(&mut self) {
        let Some(model) = self.pending_model.clone() else {
            self.route_error(EngineError::ModelLoad(
                "no model spec pending at download".to_string(),
            ))
            .await;
            return;
        };
        if self.active_provider.is_none() {
            self.route_error(EngineError::ModelLoad(
                "no active provider at download".to_string(),
            ))
            .await;
            return;
        }
        let (variant, total_bytes) = if model.size_bytes > 0 {
            (DownloadVariant::Determinate, Some(model.size_bytes))
        } else {
            (DownloadVariant::Indeterminate, None)
        };
        if !self
            .apply_or_report(Transition::Downloading {
                variant,
                total_bytes,
            })
            .await
        {
            return;
        }
        // Keep cache usage under its configured ratio before adding to it.
        let active = self.models.active_model().await;
        let outcome = self.cache.auto_evict(active.as_ref()).await;
        if !outcome.evicted.is_empty() {
            tracing::info!(
                target: "orchestrator",
                "auto-evicted {} cached models before download",
                outcome.evicted.len()
            );
        }
        self.spawn_download_init(model);
    }

    /// Drives `provider.init` with a progress channel; progress and the
    /// final result come back as epoch-tagged worker signals.
    fn spawn_download_init(&mut self, model: ModelSpec) {
        let Some(provider) = self.active_provider.clone() else {
            return;
        };
        let epoch = self.factory.epoch();
        let config = self.config.clone();
        let worker_tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::channel::<DownloadProgress>(32);
            let init = provider.init(&config, Some(&model), Some(progress_tx));
            tokio::pin!(init);
            let result = loop {
                tokio::select! {
                    biased;
                    maybe = progress_rx.recv() => match maybe {
                        Some(progress) => {
                            if worker_tx
                                .send(WorkerSignal::Progress { epoch, progress })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => break (&mut init).await,
                    },
                    result = &mut init => {
                        // Drain whatever progress is still buffered so the
                        // completion signal stays last in line.
                        while let Some(progress) = progress_rx.recv().await {
                            if worker_tx
                                .send(WorkerSignal::Progress { epoch, progress })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        break result;
                    }
                }
            };
            worker_tx
                .send(WorkerSignal::InitDone { epoch, result })
                .await
                .ok();
        });
    }

    pub(crate) async fn handle_warmup(&mut self) {
        let Some(model) = self.pending_model.clone() else {
            self.route_error(EngineError::ModelLoad(
                "no model spec pending at warmup".to_string(),
            ))
            .await;
            return;
        };
        if !self.apply_or_report(Transition::WarmingUp).await {
            return;
        }
        let Some(provider) = self.active_provider.clone() else {
            self.route_error(EngineError::ModelLoad(
                "no active provider at warmup".to_string(),
            ))
            .await;
            return;
        };
        let epoch = self.factory.epoch();
        let config = self.config.clone();
        let models = self.models.clone();
        let worker_tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let result = models.load_model(&model, provider, &config).await;
            worker_tx
                .send(WorkerSignal::InitDone { epoch, result })
                .await
                .ok();
        });
    }

    /// Pull fallback for providers that only answer `download_progress()`:
    /// merged through the same path as pushed snapshots.
    pub(crate) async fn poll_download_progress(&mut self) {
        if !self.in_state(StateKind::Downloading) {
            return;
        }
        let Some(progress) = self
            .active_provider
            .as_ref()
            .and_then(|p| p.download_progress())
        else {
            return;
        };
        self.handle_progress(progress).await;
    }

    pub(crate) async fn handle_progress(&mut self, progress: DownloadProgress) {
        if !self.in_state(StateKind::Downloading) {
            return;
        }
        self.fsm
            .note_download(progress.downloaded_bytes, progress.total_bytes, progress.variant);
        self.watchdog.update_state(self.fsm.current().clone());
        self.emit(Event::DownloadProgress { progress });
        if progress.complete {
            self.apply_or_report(Transition::WarmingUp).await;
        }
    }

    pub(crate) async fn handle_init_done(&mut self, result: Result<(), EngineError>) {
        if let Err(error) = result {
            // Routable from DOWNLOADING and WARMING_UP alike.
            self.route_error(error).await;
            return;
        }
        // A provider that never pushed a completion snapshot finishes its
        // init while the engine still shows DOWNLOADING.
        if self.in_state(StateKind::Downloading) && !self.apply_or_report(Transition::WarmingUp).await
        {
            return;
        }
        if !self.in_state(StateKind::WarmingUp) {
            tracing::debug!(target: "orchestrator", "init finished outside warmup; ignoring");
            return;
        }

        let Some(model) = self.pending_model.clone() else {
            return;
        };
        let warmup_started_ms = self.fsm.current().timing().since_ms;
        if !self.cache.has_model(&model.id) {
            self.cache.record_model(model.id.clone(), model.size_bytes);
        }
        if let Some(provider) = self.active_provider.clone() {
            if let Err(error) = self.models.adopt(&model, provider.id()).await {
                self.route_error(error).await;
                return;
            }
        }
        if let Err(error) = self.models.set_active_model(&model.id).await {
            self.route_error(error).await;
            return;
        }
        if !self.apply_or_report(Transition::Ready).await {
            return;
        }
        let elapsed_ms = self.clock.now_ms().saturating_sub(warmup_started_ms);
        self.emit(Event::WarmupComplete {
            model_id: model.id.clone(),
            elapsed_ms,
        });
        self.hooks
            .run_after_init(&InitContext { model: Some(model) })
            .await;
        tracing::info!(target: "orchestrator", "engine ready");

        if self.resume_generate_after_rehydrate {
            self.resume_generate_after_rehydrate = false;
            if let Some(request) = self.pending_request.clone() {
                tracing::info!(target: "orchestrator", "re-issuing generation after rehydrate");
                self.internal.push_back(Command::Generate { request });
            }
        }
    }

    pub(crate) async fn handle_teardown(&mut self) {
        self.hooks.run_before_teardown().await;
        if !self.apply_or_report(Transition::Teardown).await {
            return;
        }
        if let Some(provider) = self.active_provider.take() {
            if let Err(error) = provider.teardown().await {
                tracing::warn!(target: "orchestrator", "provider teardown failed: {}", error);
            }
        }
        self.models.unload_all().await;
        self.retry = None;
        self.pending_request = None;
        self.adapted_request = None;
        self.pending_abort_epoch = None;
        self.resume_generate_after_rehydrate = false;
        self.rehydrate_attempts = 0;
        // Teardown is an epoch boundary: whatever is still in flight from
        // the old era is stale.
        self.factory.increment_epoch();
        self.hooks.run_after_teardown().await;
        self.emit(Event::TeardownComplete);
        self.apply_or_report(Transition::Idle).await;
    }

    pub(crate) async fn handle_healthcheck(&mut self) {
        let outcome = match &self.active_provider {
            Some(provider) => self.healthcheck.probe(provider).await,
            None => HealthOutcome::Healthy,
        };
        self.emit(Event::HealthcheckResponse {
            outcome,
            state: self.fsm.kind(),
        });
    }
}
