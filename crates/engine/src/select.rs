//! Provider selection.
//!
//! A chain-of-responsibility walk over the policy order: each candidate is
//! probed with `detect`, and the first available one wins. Probe failures
//! never abort the walk; they are captured as unavailable candidates in the
//! selection report.

use axon_api::provider::{DetectResult, PrivacyClaim, Provider};
use axon_types::config::{EngineConfig, PrivacyMode};
use axon_types::error::EngineError;
use axon_types::model::ProviderId;
use axon_types::report::{CandidateOutcome, SelectionReport};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// The winner plus the full per-candidate report.
#[derive(Debug, Clone)]
pub struct Selection {
    /// The selected provider.
    pub provider: Arc<dyn Provider>,
    /// The winner's detect result (feature surface, privacy claim).
    pub detect: DetectResult,
    /// Ordered candidate outcomes, including the winner.
    pub report: SelectionReport,
}

impl Selection {
    /// The winner's id.
    pub fn provider_id(&self) -> ProviderId {
        self.provider.id()
    }
}

/// Walks the policy order and returns the first available provider.
///
/// Unknown ids in the policy are recorded as unavailable ("not registered").
/// In strict privacy mode a candidate must also claim on-device execution.
/// On exhaustion the full report rides along with the error so diagnostics
/// can show why every candidate was rejected.
pub async fn select_provider(
    config: &EngineConfig,
    providers: &HashMap<ProviderId, Arc<dyn Provider>>,
) -> Result<Selection, (EngineError, SelectionReport)> {
    let mut candidates = Vec::with_capacity(config.provider_policy.order.len());

    for id in &config.provider_policy.order {
        let Some(provider) = providers.get(id) else {
            candidates.push(CandidateOutcome {
                id: id.clone(),
                available: false,
                reason: "not registered".to_string(),
            });
            continue;
        };

        // A panicking detect is an unavailable candidate, not a fault.
        let detect = AssertUnwindSafe(provider.detect(config)).catch_unwind().await;
        let result = match detect {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(target: "select", "detect panicked for provider '{}'", id);
                candidates.push(CandidateOutcome {
                    id: id.clone(),
                    available: false,
                    reason: "detect panicked".to_string(),
                });
                continue;
            }
        };

        let mut available = result.available;
        let mut reason = result.reason.clone();
        if available
            && config.privacy_mode == PrivacyMode::Strict
            && result.privacy_claim != Some(PrivacyClaim::OnDeviceClaimed)
        {
            available = false;
            reason = format!("rejected by strict privacy mode ({reason})");
        }

        candidates.push(CandidateOutcome {
            id: id.clone(),
            available,
            reason,
        });

        if available {
            let report = SelectionReport {
                selected: Some(id.clone()),
                candidates,
            };
            tracing::info!(target: "select", "selected provider '{}'", id);
            return Ok(Selection {
                provider: provider.clone(),
                detect: result,
                report,
            });
        }
    }

    let report = SelectionReport {
        selected: None,
        candidates,
    };
    tracing::warn!(target: "select", "no provider available");
    Err((EngineError::NoProviderAvailable, report))
}
