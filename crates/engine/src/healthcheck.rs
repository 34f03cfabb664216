//! Stall arbitration.
//!
//! A suspected stall is not always a dead engine: heavy prefill or a busy
//! GPU can silence the token stream while the provider is still alive. The
//! healthcheck manager pings the active provider with a widened deadline
//! before the orchestrator commits to a recovery transition.

use axon_api::provider::Provider;
use axon_types::config::HealthcheckConfig;
use axon_types::protocol::HealthOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Classifies provider liveness for the orchestrator.
#[derive(Debug, Clone)]
pub struct HealthcheckManager {
    config: HealthcheckConfig,
}

impl HealthcheckManager {
    /// A manager with the given tuning.
    pub fn new(config: HealthcheckConfig) -> Self {
        Self { config }
    }

    /// On-demand probe (CMD_HEALTHCHECK): pings with the base deadline.
    pub async fn probe(&self, provider: &Arc<dyn Provider>) -> HealthOutcome {
        self.ping_with_deadline(provider, self.config.ping_timeout_ms)
            .await
    }

    /// Arbitrates a suspected stall: pings with the widened deadline
    /// (`ping_timeout_ms x stalled_timeout_multiplier`). A healthy answer
    /// means the stall is ignored for this cycle.
    pub async fn arbitrate_stall(&self, provider: &Arc<dyn Provider>) -> HealthOutcome {
        let deadline_ms =
            self.config.ping_timeout_ms * u64::from(self.config.stalled_timeout_multiplier.max(1));
        let outcome = self.ping_with_deadline(provider, deadline_ms).await;
        tracing::info!(target: "healthcheck", "stall arbitration: {:?}", outcome);
        outcome
    }

    async fn ping_with_deadline(
        &self,
        provider: &Arc<dyn Provider>,
        deadline_ms: u64,
    ) -> HealthOutcome {
        match timeout(Duration::from_millis(deadline_ms.max(1)), provider.ping()).await {
            Ok(Ok(())) => HealthOutcome::Healthy,
            Ok(Err(error)) => {
                tracing::warn!(target: "healthcheck", "ping answered unhealthy: {}", error);
                HealthOutcome::Stalled
            }
            Err(_) => {
                tracing::warn!(target: "healthcheck", "ping exceeded {} ms", deadline_ms);
                HealthOutcome::Timeout
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_api::MockProvider;
    use axon_types::error::EngineError;

    fn manager() -> HealthcheckManager {
        let mut config = HealthcheckConfig::default();
        // Keep test wallclock small.
        config.ping_timeout_ms = 20;
        config.stalled_timeout_multiplier = 2;
        HealthcheckManager::new(config)
    }

    #[tokio::test]
    async fn test_healthy_ping() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new());
        assert_eq!(
            manager().arbitrate_stall(&provider).await,
            HealthOutcome::Healthy
        );
    }

    #[tokio::test]
    async fn test_unhealthy_ping_is_stalled() {
        let provider: Arc<dyn Provider> = Arc::new(
            MockProvider::new()
                .with_ping_result(Err(EngineError::Unknown("wedged".to_string()))),
        );
        assert_eq!(
            manager().arbitrate_stall(&provider).await,
            HealthOutcome::Stalled
        );
    }

    #[tokio::test]
    async fn test_hanging_ping_times_out() {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new().with_hanging_ping());
        assert_eq!(
            manager().arbitrate_stall(&provider).await,
            HealthOutcome::Timeout
        );
        assert_eq!(manager().probe(&provider).await, HealthOutcome::Timeout);
    }
}
