//! Core error types for the axon engine.

use crate::state::StateKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Whether the engine can recover from an error without a full teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recoverability {
    /// The engine may rehydrate and retry.
    Recoverable,
    /// The engine must tear down and return to idle.
    NonRecoverable,
}

/// Every fault the engine can surface across its boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A generate request carried no messages, or no user message.
    #[error("Message list is empty or contains no user message")]
    EmptyMessages,
    /// The model declares a chat template dialect the engine cannot render.
    #[error("Unsupported chat template format: {format}")]
    TemplateFormatUnsupported {
        /// The declared dialect (e.g. `jinja`).
        format: String,
    },
    /// An operation was issued in a state that does not permit it.
    #[error("Operation requires state {required:?}, but engine is in {actual:?}")]
    InvalidState {
        /// The state the operation demands.
        required: StateKind,
        /// The state the engine was actually in.
        actual: StateKind,
    },
    /// A state transition outside the allowed-transitions set was attempted.
    #[error("Illegal state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// The state the engine was in.
        from: StateKind,
        /// The state the transition targeted.
        to: StateKind,
    },
    /// No provider in the policy order reported itself available.
    #[error("No inference provider available")]
    NoProviderAvailable,
    /// The device does not have enough free storage for the model plus margin.
    #[error("Insufficient storage: need {required_bytes} bytes, {available_bytes} available")]
    QuotaInsufficient {
        /// Model size plus safety margin.
        required_bytes: u64,
        /// What the platform estimator reported as free.
        available_bytes: u64,
    },
    /// The model cache is in an inconsistent state.
    #[error("Model cache corrupt: {0}")]
    CacheCorrupt(String),
    /// A state outlived its deadline.
    #[error("Timed out in state {state:?} after {elapsed_ms} ms")]
    Timeout {
        /// The state that overran.
        state: StateKind,
        /// Time spent in the state when the watchdog fired.
        elapsed_ms: u64,
    },
    /// Token flow ceased during generation.
    #[error("Generation stalled: no token for {idle_ms} ms")]
    GenerationStalled {
        /// Milliseconds since the last token (or since generation start
        /// when no token was ever emitted).
        idle_ms: u64,
    },
    /// The provider did not answer a healthcheck ping while generating.
    #[error("Healthcheck ping timed out during generation")]
    HealthcheckTimeoutDuringGeneration,
    /// An indeterminate download made no observable progress.
    #[error("Download stuck with no progress signal for {elapsed_ms} ms")]
    NativeDownloadStuck {
        /// Time spent in DOWNLOADING when the watchdog fired.
        elapsed_ms: u64,
    },
    /// Every retry attempt was consumed without a successful generation.
    #[error("Prompt still too large after {attempts} attempts")]
    PromptTooLargeAfterRetries {
        /// Attempts performed, including the original.
        attempts: u32,
    },
    /// A budget reduction would fall below the minimum useful budget.
    #[error("Token budget reduction to {would_be} falls below minimum {min_tokens}")]
    PromptBudgetOverflow {
        /// What the reduced budget would have been.
        would_be: u32,
        /// The configured floor.
        min_tokens: u32,
    },
    /// The provider failed to load or initialize the model.
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    /// The provider ran out of device memory.
    #[error("Out of memory: {0}")]
    Oom(String),
    /// The operation was cancelled by request.
    #[error("Aborted")]
    Aborted,
    /// An unclassified provider or platform failure.
    #[error("Unknown failure: {0}")]
    Unknown(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::EmptyMessages => "ERROR_INVALID_INPUT_EMPTY_MESSAGES",
            Self::TemplateFormatUnsupported { .. } => "ERROR_TEMPLATE_FORMAT_UNSUPPORTED",
            Self::InvalidState { .. } => "ERROR_INVALID_STATE",
            Self::InvalidTransition { .. } => "ERROR_INVALID_TRANSITION",
            Self::NoProviderAvailable => "ERROR_NO_PROVIDER_AVAILABLE",
            Self::QuotaInsufficient { .. } => "ERROR_QUOTA_INSUFFICIENT",
            Self::CacheCorrupt(_) => "ERROR_CACHE_CORRUPT",
            Self::Timeout { .. } => "ERROR_TIMEOUT",
            Self::GenerationStalled { .. } => "ERROR_GENERATION_STALLED",
            Self::HealthcheckTimeoutDuringGeneration => {
                "ERROR_HEALTHCHECK_TIMEOUT_DURING_GENERATION"
            }
            Self::NativeDownloadStuck { .. } => "ERROR_NATIVE_DOWNLOAD_STUCK",
            Self::PromptTooLargeAfterRetries { .. } => "ERROR_PROMPT_TOO_LARGE_AFTER_RETRIES",
            Self::PromptBudgetOverflow { .. } => "ERROR_PROMPT_BUDGET_OVERFLOW",
            Self::ModelLoad(_) => "ERROR_MODEL_LOAD",
            Self::Oom(_) => "ERROR_OOM",
            Self::Aborted => "ERROR_ABORTED",
            Self::Unknown(_) => "ERROR_UNKNOWN",
        }
    }
}

impl EngineError {
    /// Whether the engine may rehydrate after this error instead of tearing
    /// down.
    pub fn recoverability(&self) -> Recoverability {
        match self {
            Self::Timeout { .. }
            | Self::GenerationStalled { .. }
            | Self::HealthcheckTimeoutDuringGeneration
            | Self::NativeDownloadStuck { .. }
            | Self::ModelLoad(_)
            | Self::Oom(_)
            | Self::Aborted
            | Self::Unknown(_) => Recoverability::Recoverable,
            Self::EmptyMessages
            | Self::TemplateFormatUnsupported { .. }
            | Self::InvalidState { .. }
            | Self::InvalidTransition { .. }
            | Self::NoProviderAvailable
            | Self::QuotaInsufficient { .. }
            | Self::CacheCorrupt(_)
            | Self::PromptTooLargeAfterRetries { .. }
            | Self::PromptBudgetOverflow { .. } => Recoverability::NonRecoverable,
        }
    }

    /// A short instruction for the end user, when one exists.
    pub fn user_action(&self) -> Option<&'static str> {
        match self {
            Self::QuotaInsufficient { .. } => Some("Free up device storage and try again."),
            Self::NoProviderAvailable => {
                Some("This device has no supported inference backend enabled.")
            }
            Self::PromptTooLargeAfterRetries { .. } | Self::PromptBudgetOverflow { .. } => {
                Some("Shorten the conversation and try again.")
            }
            Self::Oom(_) => Some("Close other applications or pick a smaller model."),
            Self::Timeout { .. }
            | Self::GenerationStalled { .. }
            | Self::NativeDownloadStuck { .. } => Some("Retry; the engine will restart itself."),
            _ => None,
        }
    }

    /// A short instruction for the integrating developer, when one exists.
    pub fn dev_action(&self) -> Option<&'static str> {
        match self {
            Self::EmptyMessages => Some("Pass at least one user message in the request."),
            Self::TemplateFormatUnsupported { .. } => {
                Some("Pick a model without a jinja chat template, or pre-render the prompt.")
            }
            Self::InvalidState { .. } | Self::InvalidTransition { .. } => {
                Some("Wait for the engine to reach READY before issuing this command.")
            }
            Self::CacheCorrupt(_) => Some("Purge the model cache and re-download."),
            Self::HealthcheckTimeoutDuringGeneration => {
                Some("Check the provider worker; it stopped answering pings.")
            }
            _ => None,
        }
    }
}

/// The serializable error surface attached to `EVENT_ERROR` envelopes and
/// the `Error` runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Stable machine-readable code (`ERROR_*`).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the engine will attempt rehydration.
    pub recoverability: Recoverability,
    /// The state the engine was in when the error surfaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_state: Option<StateKind>,
    /// Suggested end-user action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    /// Suggested developer action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_action: Option<String>,
}

impl ErrorReport {
    /// Builds the report for an error observed in `at_state`.
    pub fn new(error: &EngineError, at_state: Option<StateKind>) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            recoverability: error.recoverability(),
            at_state,
            user_action: error.user_action().map(str::to_string),
            dev_action: error.dev_action().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            EngineError::EmptyMessages.code(),
            "ERROR_INVALID_INPUT_EMPTY_MESSAGES"
        );
        assert_eq!(
            EngineError::GenerationStalled { idle_ms: 0 }.code(),
            "ERROR_GENERATION_STALLED"
        );
        assert_eq!(
            EngineError::PromptTooLargeAfterRetries { attempts: 3 }.code(),
            "ERROR_PROMPT_TOO_LARGE_AFTER_RETRIES"
        );
        assert_eq!(EngineError::Aborted.code(), "ERROR_ABORTED");
    }

    #[test]
    fn test_recoverability_split() {
        assert_eq!(
            EngineError::GenerationStalled { idle_ms: 30_000 }.recoverability(),
            Recoverability::Recoverable
        );
        assert_eq!(
            EngineError::QuotaInsufficient {
                required_bytes: 1,
                available_bytes: 0
            }
            .recoverability(),
            Recoverability::NonRecoverable
        );
    }

    #[test]
    fn test_report_carries_state_and_actions() {
        let err = EngineError::QuotaInsufficient {
            required_bytes: 100,
            available_bytes: 10,
        };
        let report = ErrorReport::new(&err, Some(StateKind::PreflightQuota));
        assert_eq!(report.code, "ERROR_QUOTA_INSUFFICIENT");
        assert_eq!(report.at_state, Some(StateKind::PreflightQuota));
        assert!(report.user_action.is_some());
    }
}
