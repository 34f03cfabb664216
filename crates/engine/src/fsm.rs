//! The guarded runtime state machine.
//!
//! The only way to mutate the current state record is through
//! [`StateMachine::transition`], which checks the allowed-transitions table,
//! stamps entry timing, and notifies subscribers. Progress counters inside
//! `Downloading`/`Generating` have dedicated mutators that leave entry
//! timing untouched.

use axon_telemetry::Clock;
use axon_types::config::EngineConfig;
use axon_types::error::{EngineError, ErrorReport};
use axon_types::state::{DownloadVariant, RuntimeState, StateKind, StateTiming};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A transition target: the state to enter plus its entry payload.
/// Timing is stamped by the machine, never by the caller.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Back to idle.
    Idle,
    /// Begin bring-up.
    Booting,
    /// Walk the provider policy.
    SelectingProvider,
    /// Storage preflight.
    PreflightQuota,
    /// Cache lookup.
    CheckingCache,
    /// Weights download.
    Downloading {
        /// Whether byte totals are known.
        variant: DownloadVariant,
        /// Total bytes when known up front.
        total_bytes: Option<u64>,
    },
    /// Provider init / warm load.
    WarmingUp,
    /// Accepting requests.
    Ready,
    /// A generation starts.
    Generating {
        /// The epoch the generation runs under.
        epoch: u32,
        /// The seq of the request envelope.
        request_seq: u32,
    },
    /// A fault was recorded.
    Error {
        /// The fault.
        report: ErrorReport,
    },
    /// Teardown-and-reselect recovery.
    Rehydrating,
    /// Final cleanup.
    Teardown,
}

impl Transition {
    fn kind(&self) -> StateKind {
        match self {
            Transition::Idle => StateKind::Idle,
            Transition::Booting => StateKind::Booting,
            Transition::SelectingProvider => StateKind::SelectingProvider,
            Transition::PreflightQuota => StateKind::PreflightQuota,
            Transition::CheckingCache => StateKind::CheckingCache,
            Transition::Downloading { .. } => StateKind::Downloading,
            Transition::WarmingUp => StateKind::WarmingUp,
            Transition::Ready => StateKind::Ready,
            Transition::Generating { .. } => StateKind::Generating,
            Transition::Error { .. } => StateKind::Error,
            Transition::Rehydrating => StateKind::Rehydrating,
            Transition::Teardown => StateKind::Teardown,
        }
    }
}

/// Whether `from -> to` is in the allowed-transitions set.
pub fn allowed(from: StateKind, to: StateKind) -> bool {
    use StateKind::*;
    matches!(
        (from, to),
        (Idle, Booting)
            | (Booting, SelectingProvider)
            | (Booting, Error)
            | (SelectingProvider, PreflightQuota)
            | (SelectingProvider, Error)
            | (PreflightQuota, CheckingCache)
            | (PreflightQuota, Error)
            | (CheckingCache, Downloading)
            | (CheckingCache, WarmingUp)
            | (CheckingCache, Error)
            | (Downloading, WarmingUp)
            | (Downloading, Error)
            | (WarmingUp, Ready)
            | (WarmingUp, Error)
            | (Ready, Generating)
            | (Ready, Teardown)
            | (Generating, Ready)
            | (Generating, Error)
            | (Generating, Rehydrating)
            | (Error, Rehydrating)
            | (Error, Teardown)
            | (Rehydrating, SelectingProvider)
            | (Rehydrating, Error)
            | (Teardown, Idle)
    )
}

/// Built-in deadline budget per state, before multiplier application.
/// `None` means the state is not deadline-monitored (DOWNLOADING is covered
/// by the indeterminate-stuck rule instead).
pub fn default_deadline_ms(kind: StateKind) -> Option<u64> {
    match kind {
        StateKind::Booting => Some(10_000),
        StateKind::SelectingProvider => Some(5_000),
        StateKind::PreflightQuota => Some(5_000),
        StateKind::CheckingCache => Some(5_000),
        StateKind::WarmingUp => Some(60_000),
        StateKind::Generating => Some(120_000),
        StateKind::Rehydrating => Some(30_000),
        StateKind::Idle
        | StateKind::Downloading
        | StateKind::Ready
        | StateKind::Error
        | StateKind::Teardown => None,
    }
}

type Subscriber = Box<dyn Fn(&RuntimeState) + Send + Sync>;

/// The runtime state machine.
pub struct StateMachine {
    current: RuntimeState,
    clock: Arc<dyn Clock>,
    timeout_multiplier: f64,
    deadline_overrides: HashMap<StateKind, u64>,
    subscribers: Vec<Subscriber>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("timeout_multiplier", &self.timeout_multiplier)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl StateMachine {
    /// A machine starting in IDLE.
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let current = RuntimeState::idle(clock.now_ms());
        Self {
            current,
            clock,
            timeout_multiplier: config.timeout_multiplier,
            deadline_overrides: config.watchdog.deadline_overrides.clone(),
            subscribers: Vec::new(),
        }
    }

    /// The current state record.
    pub fn current(&self) -> &RuntimeState {
        &self.current
    }

    /// The current state discriminant.
    pub fn kind(&self) -> StateKind {
        self.current.kind()
    }

    /// Registers a listener invoked after each successful transition.
    /// Listener panics are logged and swallowed.
    pub fn subscribe(&mut self, listener: impl Fn(&RuntimeState) + Send + Sync + 'static) {
        self.subscribers.push(Box::new(listener));
    }

    fn stamp(&self, kind: StateKind) -> StateTiming {
        let since_ms = self.clock.now_ms();
        let base = self
            .deadline_overrides
            .get(&kind)
            .copied()
            .or_else(|| default_deadline_ms(kind));
        let deadline_ms = base.map(|ms| (ms as f64 * self.timeout_multiplier) as u64);
        StateTiming {
            since_ms,
            deadline_ms,
            deadline_at_ms: deadline_ms.map(|d| since_ms + d),
        }
    }

    fn notify(&self) {
        for listener in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| listener(&self.current))).is_err() {
                tracing::error!(target: "fsm", "State listener panicked; continuing");
            }
        }
    }

    /// Applies a guarded transition, replacing the current record atomically.
    pub fn transition(&mut self, target: Transition) -> Result<&RuntimeState, EngineError> {
        let from = self.current.kind();
        let to = target.kind();
        if !allowed(from, to) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let timing = self.stamp(to);
        self.current = match target {
            Transition::Idle => RuntimeState::Idle { timing },
            Transition::Booting => RuntimeState::Booting { timing },
            Transition::SelectingProvider => RuntimeState::SelectingProvider { timing },
            Transition::PreflightQuota => RuntimeState::PreflightQuota { timing },
            Transition::CheckingCache => RuntimeState::CheckingCache { timing },
            Transition::Downloading {
                variant,
                total_bytes,
            } => RuntimeState::Downloading {
                timing,
                variant,
                downloaded_bytes: 0,
                total_bytes,
            },
            Transition::WarmingUp => RuntimeState::WarmingUp { timing },
            Transition::Ready => RuntimeState::Ready { timing },
            Transition::Generating { epoch, request_seq } => RuntimeState::Generating {
                timing,
                epoch,
                request_seq,
                is_aborting: false,
                tokens_emitted: 0,
                last_token_at_ms: 0,
            },
            Transition::Error { report } => RuntimeState::Error { timing, report },
            Transition::Rehydrating => RuntimeState::Rehydrating { timing },
            Transition::Teardown => RuntimeState::Teardown { timing },
        };

        tracing::debug!(target: "fsm", "{:?} -> {:?}", from, to);
        self.notify();
        Ok(&self.current)
    }

    /// Records a token arrival while GENERATING; no-op otherwise.
    pub fn note_token(&mut self) {
        let now = self.clock.now_ms();
        if let RuntimeState::Generating {
            tokens_emitted,
            last_token_at_ms,
            ..
        } = &mut self.current
        {
            *tokens_emitted += 1;
            *last_token_at_ms = now;
        }
    }

    /// Records download progress while DOWNLOADING; no-op otherwise.
    pub fn note_download(&mut self, downloaded: u64, total: Option<u64>, variant: DownloadVariant) {
        if let RuntimeState::Downloading {
            downloaded_bytes,
            total_bytes,
            variant: v,
            ..
        } = &mut self.current
        {
            *downloaded_bytes = downloaded;
            if total.is_some() {
                *total_bytes = total;
            }
            *v = variant;
        }
    }

    /// Marks the in-flight generation as aborting; no-op otherwise.
    pub fn mark_aborting(&mut self) {
        if let RuntimeState::Generating { is_aborting, .. } = &mut self.current {
            *is_aborting = true;
        }
    }

    /// Whether the in-flight generation is already aborting.
    pub fn is_aborting(&self) -> bool {
        matches!(
            self.current,
            RuntimeState::Generating {
                is_aborting: true,
                ..
            }
        )
    }

    /// Restarts GENERATING timing after an engine re-creation so the
    /// watchdog's prefill window starts fresh; no-op in any other state.
    pub fn reset_generating_timing(&mut self) {
        let timing = self.stamp(StateKind::Generating);
        if let RuntimeState::Generating {
            timing: t,
            last_token_at_ms,
            ..
        } = &mut self.current
        {
            *t = timing;
            *last_token_at_ms = 0;
        }
    }
}
