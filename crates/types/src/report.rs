use crate::model::{LoadedModel, ProviderId};
use crate::state::RuntimeState;
use serde::{Deserialize, Serialize};

/// The outcome of probing one provider candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    /// The candidate probed.
    pub id: ProviderId,
    /// Whether the candidate reported itself usable.
    pub available: bool,
    /// The candidate's own explanation (or the captured probe failure).
    pub reason: String,
}

/// Ordered per-candidate outcome list produced by provider selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionReport {
    /// The winner, when selection succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<ProviderId>,
    /// One entry per candidate, in policy order.
    pub candidates: Vec<CandidateOutcome>,
}

/// Which storage estimator produced a quota report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaEstimator {
    /// The platform storage API answered.
    Platform,
    /// The platform has no storage API; preflight passed optimistically.
    Unsupported,
}

/// Result of the storage preflight computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReport {
    /// Whether the download may proceed.
    pub ok: bool,
    /// Model size plus safety margin.
    pub required_bytes: u64,
    /// The safety margin applied on top of the model size.
    pub margin_bytes: u64,
    /// Total quota reported by the platform, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    /// Current usage reported by the platform, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
    /// Which estimator produced this report.
    pub estimator: QuotaEstimator,
}

/// Snapshot of the retry ledger for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Maximum retries permitted.
    pub max_retries: u32,
    /// Retries consumed so far.
    pub current_attempt: u32,
    /// The budget the request started with.
    pub original_max_tokens: u32,
    /// The budget the next attempt will run with.
    pub remaining_tokens: u32,
    /// Code of the error that triggered the last retry, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
}

/// Aggregate view of the model cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached models.
    pub model_count: usize,
    /// Sum of cached model sizes.
    pub total_bytes: u64,
    /// Platform quota, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    /// `total_bytes / quota_bytes`, when quota is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_ratio: Option<f64>,
}

/// Read-only snapshot of everything an operator needs to debug the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Current runtime state record.
    pub state: RuntimeState,
    /// Last provider selection, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_report: Option<SelectionReport>,
    /// Last storage preflight, if one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_report: Option<QuotaReport>,
    /// Retry ledger of the in-flight request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_stats: Option<RetryStats>,
    /// Aggregate cache view.
    pub cache_stats: CacheStats,
    /// All resident-model records.
    pub loaded_models: Vec<LoadedModel>,
}
