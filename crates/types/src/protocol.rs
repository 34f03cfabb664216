//! The envelope protocol spoken across the engine boundary.
//!
//! Every command entering the engine and every event leaving it is wrapped
//! in an `Envelope` carrying `(epoch, seq)`. The epoch is bumped on every
//! abort/teardown boundary; the seq is a per-epoch counter. Anything tagged
//! with a non-current epoch is stale and dropped before it can touch state.

use crate::chat::ChatMessage;
use crate::error::ErrorReport;
use crate::model::{ModelId, ModelSpec};
use crate::report::{QuotaReport, SelectionReport};
use crate::state::{DownloadVariant, RuntimeState, StateKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An epoch- and sequence-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Abort/teardown generation counter.
    pub epoch: u32,
    /// Per-epoch delivery order.
    pub seq: u32,
    /// The typed payload.
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wraps `body` with explicit coordinates.
    pub fn new(epoch: u32, seq: u32, body: T) -> Self {
        Self { epoch, seq, body }
    }
}

/// Decoding parameters plus the conversation to continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Ordered conversation turns. Must contain at least one user message.
    pub messages: Vec<ChatMessage>,
    /// Upper bound on tokens to decode.
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f32,
}

/// One streamed piece of generated output.
///
/// The optional `raw` buffer is handed off by ownership transfer: `Bytes`
/// moves across channels without copying the backing allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    /// Decoded text of this chunk.
    pub text: String,
    /// Raw provider-side bytes for the chunk, when the backend exposes them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Bytes>,
}

impl TokenChunk {
    /// A plain text chunk.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw: None,
        }
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model finished or hit the token budget.
    Complete,
    /// The request was aborted on command.
    Aborted,
}

/// A point-in-time view of a model download.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Whether byte totals are known.
    pub variant: DownloadVariant,
    /// Bytes fetched so far (0 for pure liveness signals).
    pub downloaded_bytes: u64,
    /// Total bytes when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Set on the final progress report.
    #[serde(default)]
    pub complete: bool,
}

/// Outcome of a provider healthcheck ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthOutcome {
    /// The provider answered in time.
    Healthy,
    /// The provider answered but work is not progressing.
    Stalled,
    /// The provider did not answer before the ping deadline.
    Timeout,
}

/// Commands accepted by the engine (main → worker direction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    /// Begin bring-up toward READY for the given model.
    #[serde(rename = "CMD_INIT")]
    Init {
        /// The model to prepare. `None` re-uses the last requested spec.
        model: Option<ModelSpec>,
    },
    /// Walk the provider policy order.
    #[serde(rename = "CMD_SELECT_PROVIDER")]
    SelectProvider,
    /// Run the storage preflight for the pending model.
    #[serde(rename = "CMD_PREFLIGHT_QUOTA")]
    PreflightQuota,
    /// Consult the model cache for the pending model.
    #[serde(rename = "CMD_CHECK_CACHE")]
    CheckCache,
    /// Fetch the pending model's weights.
    #[serde(rename = "CMD_DOWNLOAD_MODEL")]
    DownloadModel,
    /// Initialize the provider with the (now cached) model.
    #[serde(rename = "CMD_WARMUP")]
    Warmup,
    /// Run a generation. Requires READY.
    #[serde(rename = "CMD_GENERATE")]
    Generate {
        /// The conversation and decoding parameters.
        request: GenerateRequest,
    },
    /// Cancel the in-flight download/warmup/generation.
    #[serde(rename = "CMD_ABORT")]
    Abort,
    /// Tear the engine down to IDLE.
    #[serde(rename = "CMD_TEARDOWN")]
    Teardown,
    /// Ping the active provider and report engine health.
    #[serde(rename = "CMD_HEALTHCHECK")]
    Healthcheck,
}

/// Events emitted by the engine (worker → main direction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    /// The runtime state changed.
    #[serde(rename = "EVENT_STATE_CHANGE")]
    StateChange {
        /// The new state record.
        state: RuntimeState,
    },
    /// Provider selection finished.
    #[serde(rename = "EVENT_PROVIDER_SELECTED")]
    ProviderSelected {
        /// Per-candidate outcomes in policy order.
        report: SelectionReport,
    },
    /// Storage preflight finished.
    #[serde(rename = "EVENT_QUOTA_RESULT")]
    QuotaResult {
        /// The preflight computation.
        report: QuotaReport,
    },
    /// Cache lookup finished.
    #[serde(rename = "EVENT_CACHE_RESULT")]
    CacheResult {
        /// The model that was looked up.
        model_id: ModelId,
        /// Whether the weights are already on disk.
        cached: bool,
    },
    /// Download advanced.
    #[serde(rename = "EVENT_DOWNLOAD_PROGRESS")]
    DownloadProgress {
        /// The progress snapshot.
        progress: DownloadProgress,
    },
    /// Provider initialization finished; the engine is READY.
    #[serde(rename = "EVENT_WARMUP_COMPLETE")]
    WarmupComplete {
        /// The model now warm.
        model_id: ModelId,
        /// Wallclock spent warming up.
        elapsed_ms: u64,
    },
    /// One streamed token.
    #[serde(rename = "EVENT_TOKEN")]
    Token {
        /// The streamed chunk.
        chunk: TokenChunk,
    },
    /// Generation finished cleanly.
    #[serde(rename = "EVENT_GENERATION_COMPLETE")]
    GenerationComplete {
        /// Full concatenated output text.
        text: String,
        /// Number of token chunks emitted.
        tokens_emitted: u64,
        /// Why the generation ended.
        finish: FinishReason,
    },
    /// A fault surfaced.
    #[serde(rename = "EVENT_ERROR")]
    Error {
        /// The fault report.
        report: ErrorReport,
    },
    /// Answer to `CMD_HEALTHCHECK`.
    #[serde(rename = "EVENT_HEALTHCHECK_RESPONSE")]
    HealthcheckResponse {
        /// Ping classification.
        outcome: HealthOutcome,
        /// Engine state at response time.
        state: StateKind,
    },
    /// Teardown finished; the engine is IDLE.
    #[serde(rename = "EVENT_TEARDOWN_COMPLETE")]
    TeardownComplete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_discriminator_is_wire_stable() {
        let cmd = Command::Abort;
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "CMD_ABORT");
    }

    #[test]
    fn test_event_discriminator_is_wire_stable() {
        let ev = Event::Token {
            chunk: TokenChunk::text("hi"),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "EVENT_TOKEN");
        assert_eq!(json["payload"]["chunk"]["text"], "hi");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(3, 14, Command::Healthcheck);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope<Command> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
