use crate::error::ErrorReport;
use serde::{Deserialize, Serialize};

/// Discriminant-only view of the runtime state, used in transition tables,
/// deadline maps, and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Nothing loaded, nothing running.
    Idle,
    /// Engine bring-up in progress.
    Booting,
    /// Walking the provider policy order.
    SelectingProvider,
    /// Estimating device storage before a download.
    PreflightQuota,
    /// Consulting the model cache.
    CheckingCache,
    /// Fetching model weights.
    Downloading,
    /// Provider initialization and model warm load.
    WarmingUp,
    /// Warm and accepting generate requests.
    Ready,
    /// A generation is in flight.
    Generating,
    /// A fault was recorded; routing to recovery or teardown.
    Error,
    /// Tearing down and re-entering provider selection.
    Rehydrating,
    /// Final cleanup before returning to idle.
    Teardown,
}

impl StateKind {
    /// Whether an in-flight operation in this state can be aborted.
    pub fn can_abort(self) -> bool {
        matches!(
            self,
            StateKind::Downloading | StateKind::WarmingUp | StateKind::Generating
        )
    }

    /// Whether a generate request may be accepted in this state.
    pub fn can_generate(self) -> bool {
        self == StateKind::Ready
    }
}

/// Whether a download reports byte counts or only liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadVariant {
    /// Total size known; progress is a byte ratio.
    Determinate,
    /// Total size unknown; progress is only a liveness signal.
    Indeterminate,
}

/// Entry timing common to every state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTiming {
    /// When the state was entered, ms since epoch.
    pub since_ms: u64,
    /// The state's deadline budget after multiplier application, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Absolute wallclock deadline (`since_ms + deadline_ms`), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at_ms: Option<u64>,
}

impl StateTiming {
    /// Timing with no deadline, entered at `since_ms`.
    pub fn unbounded(since_ms: u64) -> Self {
        Self {
            since_ms,
            deadline_ms: None,
            deadline_at_ms: None,
        }
    }
}

/// The current state of the engine, one variant per named lifecycle state.
///
/// The record is replaced atomically on every transition; mutation outside a
/// transition is limited to the progress counters inside `Downloading` and
/// `Generating`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    /// Nothing loaded, nothing running.
    Idle {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Engine bring-up in progress.
    Booting {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Walking the provider policy order.
    SelectingProvider {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Estimating device storage before a download.
    PreflightQuota {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Consulting the model cache.
    CheckingCache {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Fetching model weights.
    Downloading {
        /// Entry timing.
        timing: StateTiming,
        /// Whether byte totals are known.
        variant: DownloadVariant,
        /// Bytes fetched so far.
        downloaded_bytes: u64,
        /// Total bytes when the variant is determinate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },
    /// Provider initialization and model warm load.
    WarmingUp {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Warm and accepting generate requests.
    Ready {
        /// Entry timing.
        timing: StateTiming,
    },
    /// A generation is in flight.
    Generating {
        /// Entry timing.
        timing: StateTiming,
        /// The epoch this generation was started under.
        epoch: u32,
        /// The sequence number of the request envelope.
        request_seq: u32,
        /// Set when an abort has been requested and not yet honored.
        is_aborting: bool,
        /// Tokens delivered so far.
        tokens_emitted: u64,
        /// Wallclock of the most recent token; 0 until the first token.
        last_token_at_ms: u64,
    },
    /// A fault was recorded; routing to recovery or teardown.
    Error {
        /// Entry timing.
        timing: StateTiming,
        /// The fault that put the engine here.
        report: ErrorReport,
    },
    /// Tearing down and re-entering provider selection.
    Rehydrating {
        /// Entry timing.
        timing: StateTiming,
    },
    /// Final cleanup before returning to idle.
    Teardown {
        /// Entry timing.
        timing: StateTiming,
    },
}

impl RuntimeState {
    /// The initial state record.
    pub fn idle(now_ms: u64) -> Self {
        RuntimeState::Idle {
            timing: StateTiming::unbounded(now_ms),
        }
    }

    /// The discriminant of this record.
    pub fn kind(&self) -> StateKind {
        match self {
            RuntimeState::Idle { .. } => StateKind::Idle,
            RuntimeState::Booting { .. } => StateKind::Booting,
            RuntimeState::SelectingProvider { .. } => StateKind::SelectingProvider,
            RuntimeState::PreflightQuota { .. } => StateKind::PreflightQuota,
            RuntimeState::CheckingCache { .. } => StateKind::CheckingCache,
            RuntimeState::Downloading { .. } => StateKind::Downloading,
            RuntimeState::WarmingUp { .. } => StateKind::WarmingUp,
            RuntimeState::Ready { .. } => StateKind::Ready,
            RuntimeState::Generating { .. } => StateKind::Generating,
            RuntimeState::Error { .. } => StateKind::Error,
            RuntimeState::Rehydrating { .. } => StateKind::Rehydrating,
            RuntimeState::Teardown { .. } => StateKind::Teardown,
        }
    }

    /// Shared entry-timing view.
    pub fn timing(&self) -> &StateTiming {
        match self {
            RuntimeState::Idle { timing }
            | RuntimeState::Booting { timing }
            | RuntimeState::SelectingProvider { timing }
            | RuntimeState::PreflightQuota { timing }
            | RuntimeState::CheckingCache { timing }
            | RuntimeState::Downloading { timing, .. }
            | RuntimeState::WarmingUp { timing }
            | RuntimeState::Ready { timing }
            | RuntimeState::Generating { timing, .. }
            | RuntimeState::Error { timing, .. }
            | RuntimeState::Rehydrating { timing }
            | RuntimeState::Teardown { timing } => timing,
        }
    }

    /// Mutable entry-timing view.
    pub fn timing_mut(&mut self) -> &mut StateTiming {
        match self {
            RuntimeState::Idle { timing }
            | RuntimeState::Booting { timing }
            | RuntimeState::SelectingProvider { timing }
            | RuntimeState::PreflightQuota { timing }
            | RuntimeState::CheckingCache { timing }
            | RuntimeState::Downloading { timing, .. }
            | RuntimeState::WarmingUp { timing }
            | RuntimeState::Ready { timing }
            | RuntimeState::Generating { timing, .. }
            | RuntimeState::Error { timing, .. }
            | RuntimeState::Rehydrating { timing }
            | RuntimeState::Teardown { timing } => timing,
        }
    }
}
