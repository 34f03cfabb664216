//! The orchestrator: command in, transition, provider call, events out.
//!
//! Everything that mutates engine state happens on this loop. Provider
//! work runs on spawned worker tasks that communicate back exclusively
//! through epoch-tagged signals; anything tagged with a stale epoch is
//! dropped before it can touch state or reach a listener. Between awaits
//! the loop runs to completion: one command, one async operation, one
//! resulting transition.

mod generate;
mod lifecycle;

use crate::envelope::EnvelopeFactory;
use crate::fsm::{allowed, StateMachine, Transition};
use crate::healthcheck::HealthcheckManager;
use crate::hooks::HookRegistry;
use crate::models::ModelManager;
use crate::retry::RetryBudget;
use crate::storage::CacheManager;
use crate::watchdog::{Watchdog, WatchdogFault};
use axon_api::provider::{Provider, ProviderSupports};
use axon_api::storage::StorageEstimator;
use axon_telemetry::Clock;
use axon_types::config::EngineConfig;
use axon_types::error::{EngineError, ErrorReport};
use axon_types::model::{ModelSpec, ProviderId};
use axon_types::protocol::{
    Command, DownloadProgress, Envelope, Event, GenerateRequest, HealthOutcome, TokenChunk,
};
use axon_types::report::{Diagnostics, QuotaReport, SelectionReport};
use axon_types::state::StateKind;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};

/// How many rehydrations may run before a recoverable fault is treated as
/// terminal. The counter resets when a generation completes.
const MAX_REHYDRATE_ATTEMPTS: u32 = 1;

/// Signals posted by worker tasks back to the orchestrator loop.
#[derive(Debug)]
pub(crate) enum WorkerSignal {
    /// A streamed token from the provider.
    Token { epoch: u32, chunk: TokenChunk },
    /// Download progress from the provider.
    Progress {
        epoch: u32,
        progress: DownloadProgress,
    },
    /// A spawned `init` finished.
    InitDone {
        epoch: u32,
        result: Result<(), EngineError>,
    },
    /// A spawned `generate` finished.
    GenerateDone {
        epoch: u32,
        result: Result<axon_api::provider::GenerateResult, EngineError>,
    },
    /// An opportunistic health probe finished unfavourably.
    HealthProbe { epoch: u32, outcome: HealthOutcome },
}

/// Everything the orchestrator needs at construction.
pub(crate) struct OrchestratorDeps {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub providers: HashMap<ProviderId, Arc<dyn Provider>>,
    pub estimator: Arc<dyn StorageEstimator>,
    pub hooks: HookRegistry,
    pub cmd_rx: mpsc::Receiver<Envelope<Command>>,
    pub event_tx: broadcast::Sender<Envelope<Event>>,
    pub diag_rx: mpsc::Receiver<oneshot::Sender<Diagnostics>>,
    pub factory: EnvelopeFactory,
    pub watchdog: Arc<Watchdog>,
    pub fault_rx: mpsc::Receiver<WatchdogFault>,
}

/// The engine's command loop and the owner of all mutable engine state.
pub struct Orchestrator {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) fsm: StateMachine,
    pub(crate) factory: EnvelopeFactory,
    pub(crate) hooks: HookRegistry,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) healthcheck: HealthcheckManager,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) models: Arc<ModelManager>,
    pub(crate) providers: HashMap<ProviderId, Arc<dyn Provider>>,
    pub(crate) estimator: Arc<dyn StorageEstimator>,
    pub(crate) active_provider: Option<Arc<dyn Provider>>,
    pub(crate) active_supports: ProviderSupports,
    pub(crate) selection_report: Option<SelectionReport>,
    pub(crate) quota_report: Option<QuotaReport>,
    pub(crate) retry: Option<RetryBudget>,
    pub(crate) pending_model: Option<ModelSpec>,
    pub(crate) pending_request: Option<GenerateRequest>,
    /// The canonicalized conversation of the in-flight request, reused by
    /// in-place retries.
    pub(crate) adapted_request: Option<(Vec<axon_types::chat::ChatMessage>, f32)>,
    pub(crate) last_command_seq: u32,
    pub(crate) resume_generate_after_rehydrate: bool,
    pub(crate) rehydrate_attempts: u32,
    pub(crate) pending_abort_epoch: Option<u32>,
    pub(crate) internal: VecDeque<Command>,
    pub(crate) event_tx: broadcast::Sender<Envelope<Event>>,
    pub(crate) worker_tx: mpsc::Sender<WorkerSignal>,
    worker_rx: mpsc::Receiver<WorkerSignal>,
    cmd_rx: mpsc::Receiver<Envelope<Command>>,
    diag_rx: mpsc::Receiver<oneshot::Sender<Diagnostics>>,
    fault_rx: mpsc::Receiver<WatchdogFault>,
}

impl Orchestrator {
    pub(crate) fn new(deps: OrchestratorDeps) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(256);
        let fsm = StateMachine::new(&deps.config, deps.clock.clone());
        let cache = Arc::new(CacheManager::new(
            deps.config.cache,
            deps.clock.clone(),
            deps.estimator.clone(),
        ));
        let models = Arc::new(ModelManager::new(
            &deps.config,
            deps.clock.clone(),
            cache.clone(),
        ));
        let healthcheck = HealthcheckManager::new(deps.config.healthcheck);
        Self {
            config: deps.config,
            clock: deps.clock,
            fsm,
            factory: deps.factory,
            hooks: deps.hooks,
            watchdog: deps.watchdog,
            healthcheck,
            cache,
            models,
            providers: deps.providers,
            estimator: deps.estimator,
            active_provider: None,
            active_supports: ProviderSupports::default(),
            selection_report: None,
            quota_report: None,
            retry: None,
            pending_model: None,
            pending_request: None,
            adapted_request: None,
            last_command_seq: 0,
            resume_generate_after_rehydrate: false,
            rehydrate_attempts: 0,
            pending_abort_epoch: None,
            internal: VecDeque::new(),
            event_tx: deps.event_tx,
            worker_tx,
            worker_rx,
            cmd_rx: deps.cmd_rx,
            diag_rx: deps.diag_rx,
            fault_rx: deps.fault_rx,
        }
    }

    /// Runs the command loop until the shutdown signal flips or every
    /// command sender is gone.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(target: "orchestrator", "command loop started");
        let mut health_ticker =
            time::interval(Duration::from_millis(self.config.healthcheck.interval_ms.max(1)));
        health_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Pull-style fallback for backends that cannot push progress.
        let mut download_ticker =
            time::interval(Duration::from_millis(self.config.watchdog.check_interval_ms.max(1)));
        download_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Self-enqueued stages run before anything new is accepted.
            if let Some(command) = self.internal.pop_front() {
                self.dispatch(command).await;
                continue;
            }

            tokio::select! {
                biased;

                Some(signal) = self.worker_rx.recv() => {
                    self.handle_worker(signal).await;
                }

                Some(fault) = self.fault_rx.recv() => {
                    self.handle_fault(fault).await;
                }

                Some(reply) = self.diag_rx.recv() => {
                    let snapshot = self.diagnostics().await;
                    reply.send(snapshot).ok();
                }

                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(envelope) => self.handle_command(envelope).await,
                        None => break,
                    }
                }

                _ = health_ticker.tick() => {
                    self.spawn_health_probe();
                }

                _ = download_ticker.tick() => {
                    self.poll_download_progress().await;
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        tracing::info!(target: "orchestrator", "command loop stopped");
    }

    async fn handle_command(&mut self, envelope: Envelope<Command>) {
        if !self.factory.is_current(envelope.epoch) {
            tracing::debug!(
                target: "orchestrator",
                "dropping stale command (epoch {} != {})",
                envelope.epoch,
                self.factory.epoch()
            );
            return;
        }
        self.last_command_seq = envelope.seq;
        self.dispatch(envelope.body).await;
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::Init { model } => self.handle_init(model).await,
            Command::SelectProvider => self.handle_select_provider().await,
            Command::PreflightQuota => self.handle_preflight_quota().await,
            Command::CheckCache => self.handle_check_cache().await,
            Command::DownloadModel => self.handle_download_model().await,
            Command::Warmup => self.handle_warmup().await,
            Command::Generate { request } => self.handle_generate(request).await,
            Command::Abort => self.handle_abort().await,
            Command::Teardown => self.handle_teardown().await,
            Command::Healthcheck => self.handle_healthcheck().await,
        }
    }

    async fn handle_worker(&mut self, signal: WorkerSignal) {
        // The stale-event rule: nothing from an old epoch may mutate state
        // or reach a listener.
        let epoch = match &signal {
            WorkerSignal::Token { epoch, .. }
            | WorkerSignal::Progress { epoch, .. }
            | WorkerSignal::InitDone { epoch, .. }
            | WorkerSignal::HealthProbe { epoch, .. }
            | WorkerSignal::GenerateDone { epoch, .. } => *epoch,
        };
        if !self.factory.is_current(epoch) {
            // One exception: the completion of an aborted generation is the
            // signal to leave GENERATING cleanly.
            if let WorkerSignal::GenerateDone { epoch, result } = signal {
                self.handle_aborted_generate_done(epoch, result).await;
            } else {
                tracing::debug!(target: "orchestrator", "dropping stale worker signal");
            }
            return;
        }

        match signal {
            WorkerSignal::Token { chunk, .. } => self.handle_token(chunk).await,
            WorkerSignal::Progress { progress, .. } => self.handle_progress(progress).await,
            WorkerSignal::InitDone { result, .. } => self.handle_init_done(result).await,
            WorkerSignal::GenerateDone { result, .. } => self.handle_generate_done(result).await,
            WorkerSignal::HealthProbe { outcome, .. } => {
                self.handle_health_probe(outcome).await;
            }
        }
    }

    /// Emits an event envelope to the boundary.
    pub(crate) fn emit(&mut self, event: Event) {
        let envelope = self.factory.create(event);
        // No subscribers is not an error.
        self.event_tx.send(envelope).ok();
    }

    /// Applies a guarded transition, then fans the new state out to the
    /// watchdog, the state-change hooks, and the event boundary.
    pub(crate) fn apply(&mut self, target: Transition) -> Result<(), EngineError> {
        self.fsm.transition(target)?;
        let state = self.fsm.current().clone();
        self.watchdog.update_state(state.clone());
        self.hooks.emit_state_change(&state);
        self.emit(Event::StateChange { state });
        Ok(())
    }

    /// Applies a transition that the caller has already validated; a
    /// rejection is surfaced as an invalid-transition fault event.
    pub(crate) async fn apply_or_report(&mut self, target: Transition) -> bool {
        match self.apply(target) {
            Ok(()) => true,
            Err(error) => {
                self.report_error(error).await;
                false
            }
        }
    }

    /// Surfaces an error at the boundary (event + hook) without routing.
    pub(crate) async fn report_error(&mut self, error: EngineError) -> ErrorReport {
        let report = ErrorReport::new(&error, Some(self.fsm.kind()));
        tracing::warn!(target: "orchestrator", "{}: {}", report.code, report.message);
        self.emit(Event::Error {
            report: report.clone(),
        });
        self.hooks.run_on_error(&report).await;
        report
    }

    /// Current-state guard for worker signals: stale state means the signal
    /// arrived after a transition already moved the engine on.
    pub(crate) fn in_state(&self, kind: StateKind) -> bool {
        self.fsm.kind() == kind
    }

    pub(crate) fn can_route_to_error(&self) -> bool {
        allowed(self.fsm.kind(), StateKind::Error)
    }

    /// Assembles the read-only diagnostics snapshot.
    pub(crate) async fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: self.fsm.current().clone(),
            selection_report: self.selection_report.clone(),
            quota_report: self.quota_report,
            retry_stats: self.retry.as_ref().map(|r| r.stats()),
            cache_stats: self.cache.get_stats().await,
            loaded_models: self.models.loaded_models().await,
        }
    }
}
