//! Storage preflight.
//!
//! Before a download the engine asks the platform how much space is left
//! and refuses to start a fetch that would land the device in a
//! near-full state. The margin scales with the model but is clamped to
//! a fixed band.

use axon_api::storage::StorageEstimator;
use axon_types::report::{QuotaEstimator, QuotaReport};
use axon_types::MIB;

/// The safety margin reserved on top of the model size:
/// `min(500 MiB, max(200 MiB, size / 10))`.
pub fn quota_margin_bytes(model_size_bytes: u64) -> u64 {
    (model_size_bytes / 10).clamp(200 * MIB, 500 * MIB)
}

/// Runs the preflight for a model of the given size.
///
/// A platform without a storage API yields an optimistic pass, flagged via
/// `QuotaEstimator::Unsupported` so diagnostics and the outer UI can warn.
pub async fn preflight(estimator: &dyn StorageEstimator, model_size_bytes: u64) -> QuotaReport {
    let margin_bytes = quota_margin_bytes(model_size_bytes);
    let required_bytes = model_size_bytes + margin_bytes;

    match estimator.estimate().await {
        Some(estimate) => QuotaReport {
            ok: estimate.available_bytes() >= required_bytes,
            required_bytes,
            margin_bytes,
            quota_bytes: Some(estimate.quota_bytes),
            usage_bytes: Some(estimate.usage_bytes),
            estimator: QuotaEstimator::Platform,
        },
        None => {
            tracing::warn!(
                target: "quota",
                "platform storage estimate unsupported; preflight passes optimistically"
            );
            QuotaReport {
                ok: true,
                required_bytes,
                margin_bytes,
                quota_bytes: None,
                usage_bytes: None,
                estimator: QuotaEstimator::Unsupported,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_api::storage::FixedStorageEstimator;

    #[test]
    fn test_margin_clamps_low() {
        // 10% of 1 GiB = ~102 MiB, below the 200 MiB floor.
        assert_eq!(quota_margin_bytes(1024 * MIB), 200 * MIB);
    }

    #[test]
    fn test_margin_scales_mid_band() {
        // 10% of 3000 MiB = 300 MiB, inside the band.
        assert_eq!(quota_margin_bytes(3_000 * MIB), 300 * MIB);
    }

    #[test]
    fn test_margin_clamps_high() {
        // 10% of 10 GiB = 1 GiB, above the 500 MiB ceiling.
        assert_eq!(quota_margin_bytes(10 * 1024 * MIB), 500 * MIB);
    }

    #[tokio::test]
    async fn test_preflight_pass_and_fail() {
        let size = 1024 * MIB;
        let required = size + 200 * MIB;

        let roomy = FixedStorageEstimator::new(10 * 1024 * MIB, 0);
        let report = preflight(&roomy, size).await;
        assert!(report.ok);
        assert_eq!(report.required_bytes, required);
        assert_eq!(report.estimator, QuotaEstimator::Platform);

        let tight = FixedStorageEstimator::new(required - 1, 0);
        let report = preflight(&tight, size).await;
        assert!(!report.ok);
    }

    #[tokio::test]
    async fn test_unsupported_estimator_is_optimistic_but_flagged() {
        let report = preflight(&FixedStorageEstimator::unsupported(), MIB).await;
        assert!(report.ok);
        assert_eq!(report.estimator, QuotaEstimator::Unsupported);
        assert_eq!(report.quota_bytes, None);
    }
}
