use serde::{Deserialize, Serialize};
use std::fmt;

/// The identifier of an inference backend provider (e.g. `native`, `webllm`,
/// `wasm`, `mock`). Normalized to lowercase on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Creates a provider id, lowercasing the input.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_lowercase())
    }

    /// The normalized id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The identifier of a model. Case-insensitive: normalized to lowercase on
/// construction so that lookups are canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Creates a model id, lowercasing the input.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_lowercase())
    }

    /// The normalized id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Declares how a model expects its prompt to be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplate {
    /// The template dialect (e.g. `chatml`). `jinja` is rejected at
    /// validation time; the engine does not ship a template interpreter.
    pub format: String,
}

/// A static description of a downloadable model variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Canonical lowercase model id.
    pub id: ModelId,
    /// The provider family this model targets.
    pub provider: ProviderId,
    /// The upstream repository the weights are fetched from.
    pub hf_repo: String,
    /// Quality/size tier, 1 being the smallest.
    pub tier: u8,
    /// Size of the packed weights in bytes, used for storage preflight.
    pub size_bytes: u64,
    /// The maximum context window in tokens.
    pub context_window: u32,
    /// Optional chat template declaration.
    #[serde(default)]
    pub chat_template: Option<ChatTemplate>,
}

/// Lifecycle status of a resident model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Known but not resident.
    Unloaded,
    /// A load is in flight.
    Loading,
    /// Resident and usable.
    Ready,
    /// The last load attempt failed.
    Error,
    /// An unload is in flight.
    Unloading,
}

/// Bookkeeping record for a model the manager keeps (or kept) resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModel {
    /// The spec this record tracks. There is exactly one record per spec id.
    pub spec: ModelSpec,
    /// The provider the model was loaded through.
    pub provider: ProviderId,
    /// Current lifecycle status.
    pub status: ModelStatus,
    /// When the load completed, ms since epoch.
    pub loaded_at_ms: u64,
    /// Last use, drives LRU eviction.
    pub last_used_at_ms: u64,
    /// Failure message when `status == Error`.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_normalizes_case() {
        let a = ModelId::new("Gemma-2B-It");
        let b = ModelId::new("gemma-2b-it");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "gemma-2b-it");
    }

    #[test]
    fn test_provider_id_normalizes_case() {
        assert_eq!(ProviderId::new("WebLLM"), ProviderId::new("webllm"));
    }
}
