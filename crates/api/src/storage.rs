use async_trait::async_trait;
use std::fmt::Debug;

/// What the platform storage API reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    /// Total bytes this origin/app may use.
    pub quota_bytes: u64,
    /// Bytes already in use.
    pub usage_bytes: u64,
}

impl StorageEstimate {
    /// Bytes still available under the quota.
    pub fn available_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.usage_bytes)
    }
}

/// Seam over the platform storage estimation API.
///
/// `None` means the platform exposes no usable estimate; the preflight
/// treats that as optimistically passable and flags it in its report.
#[async_trait]
pub trait StorageEstimator: Send + Sync + Debug {
    /// Queries the platform for quota and usage.
    async fn estimate(&self) -> Option<StorageEstimate>;
}

/// An estimator that always reports the same figures. Useful for tests and
/// for platforms where the budget is known out of band.
#[derive(Debug, Clone)]
pub struct FixedStorageEstimator {
    estimate: Option<StorageEstimate>,
}

impl FixedStorageEstimator {
    /// An estimator reporting the given quota and usage.
    pub fn new(quota_bytes: u64, usage_bytes: u64) -> Self {
        Self {
            estimate: Some(StorageEstimate {
                quota_bytes,
                usage_bytes,
            }),
        }
    }

    /// An estimator behaving like a platform without a storage API.
    pub fn unsupported() -> Self {
        Self { estimate: None }
    }
}

#[async_trait]
impl StorageEstimator for FixedStorageEstimator {
    async fn estimate(&self) -> Option<StorageEstimate> {
        self.estimate
    }
}
