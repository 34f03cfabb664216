use async_trait::async_trait;
use axon_types::chat::ChatMessage;
use axon_types::config::EngineConfig;
use axon_types::error::EngineError;
use axon_types::model::{ModelSpec, ProviderId};
use axon_types::protocol::{DownloadProgress, FinishReason, TokenChunk};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Channel half a provider streams token chunks into.
pub type TokenSender = mpsc::Sender<TokenChunk>;

/// Channel half a provider reports download progress into.
pub type ProgressSender = mpsc::Sender<DownloadProgress>;

/// A provider's statement about where inference actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyClaim {
    /// The provider claims all computation stays on this device.
    #[serde(rename = "on-device-claimed")]
    OnDeviceClaimed,
    /// The provider makes no claim.
    #[serde(rename = "unknown")]
    Unknown,
}

/// Feature surface a provider advertises at detect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSupports {
    /// Tokens are streamed as they decode.
    pub streaming: bool,
    /// `abort()` actually interrupts an in-flight generate.
    pub abort: bool,
    /// The backend accepts a dedicated system role.
    pub system_role: bool,
    /// The backend can report download byte counts.
    pub download_progress: bool,
}

impl Default for ProviderSupports {
    fn default() -> Self {
        Self {
            streaming: true,
            abort: true,
            system_role: true,
            download_progress: false,
        }
    }
}

/// The outcome of asking a provider whether it can run here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResult {
    /// Whether the provider can serve requests on this device.
    pub available: bool,
    /// Human-readable availability explanation.
    pub reason: String,
    /// Privacy statement, when the provider makes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_claim: Option<PrivacyClaim>,
    /// Advertised feature surface.
    #[serde(default)]
    pub supports: ProviderSupports,
}

impl DetectResult {
    /// An unavailable result with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
            privacy_claim: None,
            supports: ProviderSupports::default(),
        }
    }
}

/// Fully adapted decoding parameters handed to a provider.
///
/// Messages are already canonicalized for this backend (system turns
/// flattened when the backend lacks a system role) and the token budget
/// already reflects any retry reductions.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    /// Canonicalized conversation.
    pub messages: Vec<ChatMessage>,
    /// Token budget for this attempt.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// What a finished generation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResult {
    /// Full concatenated output.
    pub text: String,
    /// Number of token chunks streamed.
    pub tokens_emitted: u64,
    /// Why decoding ended.
    pub finish: FinishReason,
}

/// The capability interface every inference backend implements.
///
/// The engine holds providers as `Arc<dyn Provider>`; at most one
/// orchestrator call is active against a provider at any time.
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// The provider family id (`native`, `webllm`, `wasm`, `mock`, ...).
    fn id(&self) -> ProviderId;

    /// Probes whether this provider can run on the current device.
    /// Must not mutate provider state.
    async fn detect(&self, cfg: &EngineConfig) -> DetectResult;

    /// Creates the underlying engine, downloading `model` if needed.
    ///
    /// When a `progress` sender is supplied the provider pushes
    /// `DownloadProgress` snapshots through it, ending with one where
    /// `complete == true` once all bytes are local. `init` returns only
    /// when the engine is warm.
    async fn init(
        &self,
        cfg: &EngineConfig,
        model: Option<&ModelSpec>,
        progress: Option<ProgressSender>,
    ) -> Result<(), EngineError>;

    /// Runs one generation, streaming chunks into `tokens`.
    ///
    /// On a honored abort the provider returns `Err(EngineError::Aborted)`
    /// promptly and stops streaming.
    async fn generate(
        &self,
        params: GenerateParams,
        tokens: TokenSender,
    ) -> Result<GenerateResult, EngineError>;

    /// Requests cancellation of the in-flight `init` or `generate`.
    async fn abort(&self);

    /// Releases the underlying engine.
    async fn teardown(&self) -> Result<(), EngineError>;

    /// Pull-style progress probe for backends that cannot push.
    fn download_progress(&self) -> Option<DownloadProgress> {
        None
    }

    /// Liveness probe used by the healthcheck manager.
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }
}
