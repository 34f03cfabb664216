//! Generation, cancellation, retry, and fault routing.

use super::{Orchestrator, WorkerSignal, MAX_REHYDRATE_ATTEMPTS};
use crate::fsm::Transition;
use crate::hooks::{GenerateContext, GenerationSummary};
use crate::prompt;
use crate::retry::RetryBudget;
use crate::watchdog::WatchdogFault;
use axon_api::provider::{GenerateParams, GenerateResult};
use axon_types::chat::ChatMessage;
use axon_types::error::{EngineError, Recoverability};
use axon_types::protocol::{Command, Event, FinishReason, GenerateRequest, HealthOutcome, TokenChunk};
use axon_types::state::{RuntimeState, StateKind};
use tokio::sync::mpsc;

impl Orchestrator {
    pub(crate) async fn handle_generate(&mut self, request: GenerateRequest) {
        if !self.fsm.kind().can_generate() {
            self.report_error(EngineError::InvalidState {
                required: StateKind::Ready,
                actual: self.fsm.kind(),
            })
            .await;
            return;
        }

        if let Err(error) = prompt::validate(&request.messages, self.pending_model.as_ref()) {
            self.report_error(error).await;
            return;
        }
        let adapted =
            match prompt::adapt_for_backend(&request.messages, self.active_supports.system_role) {
                Ok(adapted) => adapted,
                Err(error) => {
                    self.report_error(error).await;
                    return;
                }
            };
        if let Some(model) = &self.pending_model {
            if !prompt::fits_context(&adapted, request.max_tokens, model.context_window) {
                let used = prompt::estimate_conversation(&adapted);
                self.report_error(EngineError::PromptBudgetOverflow {
                    would_be: model.context_window.saturating_sub(used),
                    min_tokens: self.config.retry.min_tokens,
                })
                .await;
                return;
            }
        }

        self.retry = Some(RetryBudget::new(&self.config.retry, request.max_tokens));
        self.pending_request = Some(request.clone());
        self.adapted_request = Some((adapted.clone(), request.temperature));
        self.hooks
            .run_before_generate(&GenerateContext {
                messages: adapted.clone(),
                max_tokens: request.max_tokens,
            })
            .await;

        let epoch = self.factory.epoch();
        let request_seq = self.last_command_seq;
        if !self
            .apply_or_report(Transition::Generating { epoch, request_seq })
            .await
        {
            return;
        }
        self.spawn_generate_attempt(adapted, request.max_tokens, request.temperature);
    }

    /// Spawns one generation attempt; tokens and the final result come back
    /// as worker signals tagged with the current epoch.
    pub(crate) fn spawn_generate_attempt(
        &mut self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) {
        let Some(provider) = self.active_provider.clone() else {
            return;
        };
        let epoch = self.factory.epoch();
        let worker_tx = self.worker_tx.clone();
        let params = GenerateParams {
            messages,
            max_tokens,
            temperature,
        };
        tokio::spawn(async move {
            let (token_tx, mut token_rx) = mpsc::channel::<TokenChunk>(64);
            let generate = provider.generate(params, token_tx);
            tokio::pin!(generate);
            let result = loop {
                tokio::select! {
                    biased;
                    maybe = token_rx.recv() => match maybe {
                        Some(chunk) => {
                            if worker_tx
                                .send(WorkerSignal::Token { epoch, chunk })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => break (&mut generate).await,
                    },
                    result = &mut generate => {
                        // Forward any still-buffered tokens so the
                        // completion signal stays last in line.
                        while let Some(chunk) = token_rx.recv().await {
                            if worker_tx
                                .send(WorkerSignal::Token { epoch, chunk })
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
                .send(WorkerSignal::GenerateDone { epoch, result })
                .await
                .ok();
        });
    }

    pub(crate) async fn handle_token(&mut self, chunk: TokenChunk) {
        if !self.in_state(StateKind::Generating) {
            return;
        }
        self.fsm.note_token();
        self.watchdog.update_state(self.fsm.current().clone());
        self.hooks.emit_token(&chunk);
        self.emit(Event::Token { chunk });
    }

    pub(crate) async fn handle_generate_done(
        &mut self,
        result: Result<GenerateResult, EngineError>,
    ) {
        if !self.in_state(StateKind::Generating) {
            tracing::debug!(target: "orchestrator", "generation finished outside GENERATING; ignoring");
            return;
        }

        match result {
            Ok(result) => {
                let summary = GenerationSummary {
                    text: result.text.clone(),
                    tokens_emitted: result.tokens_emitted,
                    finish: result.finish,
                };
                self.retry = None;
                self.pending_request = None;
                self.adapted_request = None;
                // A completed generation proves the engine healthy again.
                self.rehydrate_attempts = 0;
                if !self.apply_or_report(Transition::Ready).await {
                    return;
                }
                self.emit(Event::GenerationComplete {
                    text: result.text,
                    tokens_emitted: result.tokens_emitted,
                    finish: result.finish,
                });
                self.hooks.run_after_generate(&summary).await;
            }
            Err(error) => {
                if error.recoverability() == Recoverability::Recoverable {
                    self.retry_generation(error).await;
                } else {
                    self.retry = None;
                    self.route_error(error).await;
                }
            }
        }
    }

    /// Books the failure against the retry ledger and either re-runs the
    /// attempt with the reduced budget or surfaces the terminal error.
    async fn retry_generation(&mut self, error: EngineError) {
        let Some(retry) = self.retry.as_mut() else {
            self.route_error(error).await;
            return;
        };
        match retry.prepare_retry(error.clone()) {
            Ok(reduced_tokens) => {
                tracing::info!(
                    target: "orchestrator",
                    "recoverable generation failure ({}); retrying with {} tokens",
                    error,
                    reduced_tokens
                );
                let Some((messages, temperature)) = self.adapted_request.clone() else {
                    self.route_error(error).await;
                    return;
                };
                // The engine was recreated under us or the provider backed
                // off; the prefill window starts fresh.
                self.fsm.reset_generating_timing();
                self.watchdog.update_state(self.fsm.current().clone());
                self.spawn_generate_attempt(messages, reduced_tokens, temperature);
            }
            Err(terminal) => {
                self.retry = None;
                self.route_error(terminal).await;
            }
        }
    }

    /// Completion of a generation whose epoch was retired by CMD_ABORT:
    /// the provider has honored the stop, so GENERATING exits cleanly.
    pub(crate) async fn handle_aborted_generate_done(
        &mut self,
        epoch: u32,
        result: Result<GenerateResult, EngineError>,
    ) {
        if self.pending_abort_epoch != Some(epoch) {
            tracing::debug!(target: "orchestrator", "dropping stale generation result");
            return;
        }
        let matches_state = matches!(
            self.fsm.current(),
            RuntimeState::Generating {
                epoch: state_epoch,
                is_aborting: true,
                ..
            } if *state_epoch == epoch
        );
        if !matches_state {
            return;
        }

        self.pending_abort_epoch = None;
        self.retry = None;
        self.pending_request = None;
        self.adapted_request = None;
        let (text, tokens_emitted) = match result {
            Ok(result) => (result.text, result.tokens_emitted),
            Err(_) => (String::new(), 0),
        };
        if !self.apply_or_report(Transition::Ready).await {
            return;
        }
        self.emit(Event::GenerationComplete {
            text,
            tokens_emitted,
            finish: FinishReason::Aborted,
        });
        tracing::info!(target: "orchestrator", "generation aborted cleanly");
    }

    pub(crate) async fn handle_abort(&mut self) {
        match self.fsm.kind() {
            StateKind::Generating => {
                if self.fsm.is_aborting() {
                    // Idempotent: a second abort is a no-op.
                    tracing::debug!(target: "orchestrator", "abort already in progress");
                    return;
                }
                self.fsm.mark_aborting();
                self.watchdog.update_state(self.fsm.current().clone());
                if let Some(provider) = self.active_provider.clone() {
                    provider.abort().await;
                }
                // Retire the epoch: every token still in flight from this
                // generation is stale from here on.
                self.pending_abort_epoch = Some(self.factory.epoch());
                self.factory.increment_epoch();
                tracing::info!(target: "orchestrator", "abort requested; epoch advanced");
            }
            StateKind::Downloading | StateKind::WarmingUp => {
                if let Some(provider) = self.active_provider.clone() {
                    provider.abort().await;
                }
                self.factory.increment_epoch();
                let report = self.report_error(EngineError::Aborted).await;
                // A cancelled bring-up has nothing to resume; unwind to IDLE.
                if self.apply(Transition::Error { report }).is_ok() {
                    self.internal.push_back(Command::Teardown);
                }
            }
            other => {
                self.report_error(EngineError::InvalidState {
                    required: StateKind::Generating,
                    actual: other,
                })
                .await;
            }
        }
    }

    pub(crate) async fn handle_fault(&mut self, fault: WatchdogFault) {
        if !self.can_route_to_error() {
            tracing::debug!(target: "orchestrator", "fault {:?} arrived after recovery began", fault);
            return;
        }

        if let WatchdogFault::GenerationStalled { .. } = &fault {
            // Arbitrate before committing to recovery, unless an abort is
            // already pending (then the stall IS the unhonored abort).
            if self.in_state(StateKind::Generating) && !self.fsm.is_aborting() {
                if let Some(provider) = self.active_provider.clone() {
                    match self.healthcheck.arbitrate_stall(&provider).await {
                        HealthOutcome::Healthy => {
                            tracing::info!(
                                target: "orchestrator",
                                "suspected stall arbitrated healthy; ignoring this cycle"
                            );
                            self.watchdog.rearm();
                            return;
                        }
                        HealthOutcome::Stalled => {}
                        HealthOutcome::Timeout => {
                            self.route_error(EngineError::HealthcheckTimeoutDuringGeneration)
                                .await;
                            return;
                        }
                    }
                }
            }
        }

        self.route_error(fault.to_error()).await;
    }

    /// Opportunistic provider probe while GENERATING; posts a worker signal
    /// only on unfavourable outcomes.
    pub(crate) fn spawn_health_probe(&mut self) {
        if !matches!(
            self.fsm.current(),
            RuntimeState::Generating {
                is_aborting: false,
                ..
            }
        ) {
            return;
        }
        let Some(provider) = self.active_provider.clone() else {
            return;
        };
        let healthcheck = self.healthcheck.clone();
        let epoch = self.factory.epoch();
        let worker_tx = self.worker_tx.clone();
        tokio::spawn(async move {
            let outcome = healthcheck.probe(&provider).await;
            if outcome != HealthOutcome::Healthy {
                worker_tx
                    .send(WorkerSignal::HealthProbe { epoch, outcome })
                    .await
                    .ok();
            }
        });
    }

    pub(crate) async fn handle_health_probe(&mut self, outcome: HealthOutcome) {
        if !self.in_state(StateKind::Generating) || self.fsm.is_aborting() {
            return;
        }
        match outcome {
            HealthOutcome::Healthy => {}
            HealthOutcome::Stalled => {
                let idle_ms = match self.fsm.current() {
                    RuntimeState::Generating {
                        timing,
                        last_token_at_ms,
                        ..
                    } => {
                        let reference = if *last_token_at_ms > 0 {
                            *last_token_at_ms
                        } else {
                            timing.since_ms
                        };
                        self.clock.now_ms().saturating_sub(reference)
                    }
                    _ => 0,
                };
                self.route_error(EngineError::GenerationStalled { idle_ms }).await;
            }
            HealthOutcome::Timeout => {
                self.route_error(EngineError::HealthcheckTimeoutDuringGeneration)
                    .await;
            }
        }
    }

    /// Central fault routing: surface the error, enter ERROR, then recover
    /// (REHYDRATING) for recoverable faults with budget left, or unwind
    /// (TEARDOWN) otherwise.
    pub(crate) async fn route_error(&mut self, error: EngineError) {
        let report = self.report_error(error.clone()).await;
        if !self.can_route_to_error() {
            return;
        }
        if self.apply(Transition::Error { report }).is_err() {
            return;
        }

        let recoverable = error.recoverability() == Recoverability::Recoverable;
        if recoverable && self.rehydrate_attempts < MAX_REHYDRATE_ATTEMPTS {
            self.rehydrate().await;
        } else {
            self.internal.push_back(Command::Teardown);
        }
    }

    /// Tears the provider down and re-enters selection, keeping the last
    /// model spec (and the pending request, which is re-issued at READY).
    async fn rehydrate(&mut self) {
        self.rehydrate_attempts += 1;
        self.resume_generate_after_rehydrate = self.pending_request.is_some();
        if !self.apply_or_report(Transition::Rehydrating).await {
            return;
        }
        if let Some(provider) = self.active_provider.take() {
            provider.abort().await;
            if let Err(error) = provider.teardown().await {
                tracing::warn!(target: "orchestrator", "teardown during rehydrate failed: {}", error);
            }
        }
        self.models.unload_all().await;
        self.pending_abort_epoch = None;
        // Rehydration is an epoch boundary: a wedged generation must not
        // leak tokens into the recovered engine.
        self.factory.increment_epoch();
        tracing::info!(
            target: "orchestrator",
            "rehydrating (attempt {}); re-entering provider selection",
            self.rehydrate_attempts
        );
        self.internal.push_back(Command::SelectProvider);
    }
}
