//! The per-request retry ledger.
//!
//! One budget is created per generate request and destroyed on success,
//! exhaustion, or teardown. Every recoverable generation failure passes
//! through [`RetryBudget::prepare_retry`], which decays the token budget
//! deterministically: `remaining = floor(remaining * reduction_factor)`,
//! erroring instead of falling below `min_tokens`.

use axon_types::config::RetryConfig;
use axon_types::error::{EngineError, ErrorCode};
use axon_types::report::RetryStats;

/// The retry ledger for one in-flight request.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    reduction_factor: f64,
    min_tokens: u32,
    current_attempt: u32,
    original_max_tokens: u32,
    remaining_tokens: u32,
    last_error: Option<EngineError>,
}

impl RetryBudget {
    /// A fresh ledger for a request that asked for `max_tokens`.
    pub fn new(config: &RetryConfig, max_tokens: u32) -> Self {
        Self {
            max_retries: config.max_retries,
            reduction_factor: config.reduction_factor,
            min_tokens: config.min_tokens,
            current_attempt: 0,
            original_max_tokens: max_tokens,
            remaining_tokens: max_tokens,
            last_error: None,
        }
    }

    /// The token budget the next attempt runs with.
    pub fn remaining_tokens(&self) -> u32 {
        self.remaining_tokens
    }

    /// Retries consumed so far.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Books a recoverable failure and computes the next attempt's budget.
    ///
    /// Returns the reduced token budget, or the terminal error once the
    /// ledger is spent (`ERROR_PROMPT_TOO_LARGE_AFTER_RETRIES` when the
    /// attempt count runs out, `ERROR_PROMPT_BUDGET_OVERFLOW` when the
    /// reduction would land below the minimum useful budget).
    pub fn prepare_retry(&mut self, error: EngineError) -> Result<u32, EngineError> {
        self.last_error = Some(error);
        if self.current_attempt >= self.max_retries {
            // Incrementing would break the `current_attempt <= max_retries`
            // invariant; the ledger is spent.
            return Err(EngineError::PromptTooLargeAfterRetries {
                // The original attempt plus every retry.
                attempts: self.max_retries + 1,
            });
        }
        self.current_attempt += 1;

        let reduced = (self.remaining_tokens as f64 * self.reduction_factor).floor() as u32;
        if reduced < self.min_tokens {
            return Err(EngineError::PromptBudgetOverflow {
                would_be: reduced,
                min_tokens: self.min_tokens,
            });
        }
        self.remaining_tokens = reduced;
        Ok(self.remaining_tokens)
    }

    /// Snapshot for diagnostics.
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            max_retries: self.max_retries,
            current_attempt: self.current_attempt,
            original_max_tokens: self.original_max_tokens,
            remaining_tokens: self.remaining_tokens,
            last_error_code: self.last_error.as_ref().map(|e| e.code().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recoverable() -> EngineError {
        EngineError::Oom("test".to_string())
    }

    #[test]
    fn test_reduction_sequence_for_1000() {
        let mut budget = RetryBudget::new(&RetryConfig::default(), 1_000);
        assert_eq!(budget.remaining_tokens(), 1_000);
        assert_eq!(budget.prepare_retry(recoverable()).unwrap(), 800);
        assert_eq!(budget.prepare_retry(recoverable()).unwrap(), 640);
        let err = budget.prepare_retry(recoverable()).unwrap_err();
        assert_eq!(err, EngineError::PromptTooLargeAfterRetries { attempts: 3 });
    }

    #[test]
    fn test_reduction_sequence_for_100() {
        let mut budget = RetryBudget::new(&RetryConfig::default(), 100);
        assert_eq!(budget.prepare_retry(recoverable()).unwrap(), 80);
        assert_eq!(budget.prepare_retry(recoverable()).unwrap(), 64);
        assert!(budget.prepare_retry(recoverable()).is_err());
    }

    #[test]
    fn test_overflow_below_min_tokens() {
        let mut budget = RetryBudget::new(&RetryConfig::default(), 60);
        // floor(60 * 0.8) = 48 < 50
        let err = budget.prepare_retry(recoverable()).unwrap_err();
        assert_eq!(
            err,
            EngineError::PromptBudgetOverflow {
                would_be: 48,
                min_tokens: 50,
            }
        );
    }

    #[test]
    fn test_attempt_never_exceeds_max() {
        let mut budget = RetryBudget::new(&RetryConfig::default(), 1_000);
        let _ = budget.prepare_retry(recoverable());
        let _ = budget.prepare_retry(recoverable());
        let _ = budget.prepare_retry(recoverable());
        let stats = budget.stats();
        // The spent third call does not push the attempt count past max.
        assert!(stats.current_attempt <= stats.max_retries);
        assert_eq!(stats.original_max_tokens, 1_000);
        assert_eq!(stats.remaining_tokens, 640);
        assert_eq!(stats.last_error_code.as_deref(), Some("ERROR_OOM"));
    }
}
