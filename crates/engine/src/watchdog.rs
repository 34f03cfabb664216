//! Deadline and token-flow monitoring.
//!
//! The watchdog never mutates engine state. It holds the latest state
//! snapshot (pushed by the orchestrator after every transition and token),
//! evaluates the timing rules once per tick, and posts at most one fault
//! per state entry into the orchestrator's fault channel. The orchestrator
//! turns faults into transitions; user code never observes a hang.

use axon_telemetry::Clock;
use axon_types::config::WatchdogConfig;
use axon_types::error::EngineError;
use axon_types::state::{DownloadVariant, RuntimeState, StateKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

/// An indeterminate download with no progress for this long is stuck.
pub const INDETERMINATE_STUCK_WATCHDOG_MS: u64 = 120_000;

/// A generation that has emitted nothing for this long never will (the
/// prefill window).
pub const PREFILL_TIMEOUT_MS: u64 = 60_000;

/// A fault detected by the watchdog.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogFault {
    /// A state outlived its deadline.
    Timeout {
        /// The overrunning state.
        state: StateKind,
        /// Time spent in the state.
        elapsed_ms: u64,
    },
    /// An indeterminate download shows no liveness.
    DownloadStuck {
        /// Time spent downloading.
        elapsed_ms: u64,
    },
    /// Token flow ceased during generation.
    GenerationStalled {
        /// Silence duration (since last token, or since entry during
        /// prefill).
        idle_ms: u64,
        /// True when no token was ever emitted.
        prefill: bool,
    },
}

impl WatchdogFault {
    /// The error this fault surfaces as.
    pub fn to_error(&self) -> EngineError {
        match *self {
            WatchdogFault::Timeout { state, elapsed_ms } => {
                EngineError::Timeout { state, elapsed_ms }
            }
            WatchdogFault::DownloadStuck { elapsed_ms } => {
                EngineError::NativeDownloadStuck { elapsed_ms }
            }
            WatchdogFault::GenerationStalled { idle_ms, .. } => {
                EngineError::GenerationStalled { idle_ms }
            }
        }
    }
}

/// The watchdog. Shared between the orchestrator (which pushes snapshots)
/// and its own tick task.
pub struct Watchdog {
    snapshot: Mutex<Option<RuntimeState>>,
    reported: AtomicBool,
    clock: Arc<dyn Clock>,
    stalled_threshold_ms: u64,
    check_interval_ms: u64,
    fault_tx: mpsc::Sender<WatchdogFault>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("check_interval_ms", &self.check_interval_ms)
            .field("stalled_threshold_ms", &self.stalled_threshold_ms)
            .finish()
    }
}

impl Watchdog {
    /// A watchdog posting faults into `fault_tx`.
    pub fn new(
        config: &WatchdogConfig,
        stalled_threshold_ms: u64,
        clock: Arc<dyn Clock>,
        fault_tx: mpsc::Sender<WatchdogFault>,
    ) -> Self {
        Self {
            snapshot: Mutex::new(None),
            reported: AtomicBool::new(false),
            clock,
            stalled_threshold_ms,
            check_interval_ms: config.check_interval_ms,
            fault_tx,
        }
    }

    /// Replaces the tracked snapshot. A new state entry (different kind or
    /// entry stamp) re-arms fault reporting, so the watchdog never fires
    /// for an old state.
    pub fn update_state(&self, state: RuntimeState) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            let rearm = match snapshot.as_ref() {
                Some(prev) => {
                    prev.kind() != state.kind()
                        || prev.timing().since_ms != state.timing().since_ms
                }
                None => true,
            };
            if rearm {
                self.reported.store(false, Ordering::SeqCst);
            }
            *snapshot = Some(state);
        }
    }

    fn evaluate(&self, state: &RuntimeState, now_ms: u64) -> Option<WatchdogFault> {
        let timing = state.timing();
        let elapsed_ms = now_ms.saturating_sub(timing.since_ms);

        if let Some(deadline_ms) = timing.deadline_ms {
            if elapsed_ms > deadline_ms {
                return Some(WatchdogFault::Timeout {
                    state: state.kind(),
                    elapsed_ms,
                });
            }
        }

        match state {
            RuntimeState::Downloading { variant, .. }
                if *variant == DownloadVariant::Indeterminate
                    && elapsed_ms > INDETERMINATE_STUCK_WATCHDOG_MS =>
            {
                Some(WatchdogFault::DownloadStuck { elapsed_ms })
            }
            RuntimeState::Generating {
                last_token_at_ms, ..
            } => {
                if *last_token_at_ms > 0 {
                    let idle_ms = now_ms.saturating_sub(*last_token_at_ms);
                    if idle_ms > self.stalled_threshold_ms {
                        return Some(WatchdogFault::GenerationStalled {
                            idle_ms,
                            prefill: false,
                        });
                    }
                } else if elapsed_ms > PREFILL_TIMEOUT_MS {
                    return Some(WatchdogFault::GenerationStalled {
                        idle_ms: elapsed_ms,
                        prefill: true,
                    });
                }
                None
            }
            _ => None,
        }
    }

    /// Re-arms fault reporting for the current state entry. Called after a
    /// healthcheck declares a suspected stall healthy, so the next silent
    /// window can fire again.
    pub fn rearm(&self) {
        self.reported.store(false, Ordering::SeqCst);
    }

    /// Evaluates the rules once. At most one fault is posted per state
    /// entry. Returns the fault for callers that drive ticks by hand.
    pub fn tick(&self) -> Option<WatchdogFault> {
        let state = match self.snapshot.lock() {
            Ok(snapshot) => snapshot.clone()?,
            Err(_) => return None,
        };
        if self.reported.load(Ordering::SeqCst) {
            return None;
        }
        let fault = self.evaluate(&state, self.clock.now_ms())?;
        self.reported.store(true, Ordering::SeqCst);
        tracing::warn!(target: "watchdog", "fault in {:?}: {:?}", state.kind(), fault);
        if self.fault_tx.try_send(fault.clone()).is_err() {
            tracing::error!(target: "watchdog", "fault channel full or closed; dropping fault");
        }
        Some(fault)
    }

    /// The periodic tick task. Runs until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = time::interval(Duration::from_millis(self.check_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        tracing::debug!(target: "watchdog", "tick task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_telemetry::ManualClock;
    use axon_types::state::StateTiming;

    fn watchdog_with_clock(
        clock: Arc<ManualClock>,
    ) -> (Arc<Watchdog>, mpsc::Receiver<WatchdogFault>) {
        let (fault_tx, fault_rx) = mpsc::channel(8);
        let watchdog = Arc::new(Watchdog::new(
            &WatchdogConfig::default(),
            30_000,
            clock,
            fault_tx,
        ));
        (watchdog, fault_rx)
    }

    fn generating(since_ms: u64, last_token_at_ms: u64) -> RuntimeState {
        RuntimeState::Generating {
            timing: StateTiming {
                since_ms,
                deadline_ms: Some(120_000),
                deadline_at_ms: Some(since_ms + 120_000),
            },
            epoch: 0,
            request_seq: 0,
            is_aborting: false,
            tokens_emitted: u64::from(last_token_at_ms > 0),
            last_token_at_ms,
        }
    }

    #[test]
    fn test_deadline_overrun_fires_once() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, mut rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(RuntimeState::Booting {
            timing: StateTiming {
                since_ms: 0,
                deadline_ms: Some(10_000),
                deadline_at_ms: Some(10_000),
            },
        });

        clock.set(9_000);
        assert_eq!(watchdog.tick(), None);

        clock.set(10_001);
        let fault = watchdog.tick().unwrap();
        assert_eq!(
            fault,
            WatchdogFault::Timeout {
                state: StateKind::Booting,
                elapsed_ms: 10_001,
            }
        );
        assert_eq!(rx.try_recv().unwrap(), fault);
        // Same state entry: no second report.
        clock.set(20_000);
        assert_eq!(watchdog.tick(), None);
    }

    #[test]
    fn test_new_state_entry_rearms() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, mut rx) = watchdog_with_clock(clock.clone());
        let booting = |since_ms: u64| RuntimeState::Booting {
            timing: StateTiming {
                since_ms,
                deadline_ms: Some(10_000),
                deadline_at_ms: Some(since_ms + 10_000),
            },
        };
        watchdog.update_state(booting(0));
        clock.set(10_001);
        assert!(watchdog.tick().is_some());
        // Re-entry with a fresh stamp re-arms the tracker.
        watchdog.update_state(booting(10_001));
        clock.set(30_000);
        assert!(watchdog.tick().is_some());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_indeterminate_download_stuck() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(RuntimeState::Downloading {
            timing: StateTiming::unbounded(0),
            variant: DownloadVariant::Indeterminate,
            downloaded_bytes: 0,
            total_bytes: None,
        });

        clock.set(INDETERMINATE_STUCK_WATCHDOG_MS);
        assert_eq!(watchdog.tick(), None);
        clock.set(INDETERMINATE_STUCK_WATCHDOG_MS + 1);
        assert_eq!(
            watchdog.tick(),
            Some(WatchdogFault::DownloadStuck {
                elapsed_ms: INDETERMINATE_STUCK_WATCHDOG_MS + 1,
            })
        );
    }

    #[test]
    fn test_determinate_download_not_stuck() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(RuntimeState::Downloading {
            timing: StateTiming::unbounded(0),
            variant: DownloadVariant::Determinate,
            downloaded_bytes: 10,
            total_bytes: Some(100),
        });
        clock.set(INDETERMINATE_STUCK_WATCHDOG_MS * 2);
        assert_eq!(watchdog.tick(), None);
    }

    #[test]
    fn test_token_stall() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(generating(0, 1_000));

        clock.set(31_000);
        assert_eq!(watchdog.tick(), None);
        clock.set(31_001);
        assert_eq!(
            watchdog.tick(),
            Some(WatchdogFault::GenerationStalled {
                idle_ms: 30_001,
                prefill: false,
            })
        );
    }

    #[test]
    fn test_prefill_timeout() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(generating(0, 0));

        clock.set(PREFILL_TIMEOUT_MS);
        assert_eq!(watchdog.tick(), None);
        clock.set(PREFILL_TIMEOUT_MS + 1);
        assert_eq!(
            watchdog.tick(),
            Some(WatchdogFault::GenerationStalled {
                idle_ms: PREFILL_TIMEOUT_MS + 1,
                prefill: true,
            })
        );
    }

    #[test]
    fn test_token_updates_defer_the_stall() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(generating(0, 1_000));
        // A fresh token snapshot (same entry stamp) pushes the stall out.
        clock.set(29_000);
        watchdog.update_state(generating(0, 29_000));
        clock.set(40_000);
        assert_eq!(watchdog.tick(), None);
        clock.set(59_001);
        assert!(watchdog.tick().is_some());
    }

    #[test]
    fn test_ready_state_never_faults() {
        let clock = Arc::new(ManualClock::new(0));
        let (watchdog, _rx) = watchdog_with_clock(clock.clone());
        watchdog.update_state(RuntimeState::Ready {
            timing: StateTiming::unbounded(0),
        });
        clock.set(u64::MAX / 2);
        assert_eq!(watchdog.tick(), None);
    }
}
