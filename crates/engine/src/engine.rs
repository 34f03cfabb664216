//! The engine façade.
//!
//! [`Engine`] assembles the orchestrator and watchdog, spawns them, and
//! returns an [`EngineHandle`] for submitting command envelopes, consuming
//! event envelopes, and shutting the tasks down.

use crate::envelope::EnvelopeFactory;
use crate::hooks::HookRegistry;
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::watchdog::Watchdog;
use axon_api::provider::Provider;
use axon_api::storage::{FixedStorageEstimator, StorageEstimator};
use axon_telemetry::{Clock, SystemClock};
use axon_types::config::EngineConfig;
use axon_types::error::EngineError;
use axon_types::model::ProviderId;
use axon_types::protocol::{Command, Envelope, Event};
use axon_types::report::Diagnostics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Builder for a runnable engine.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
    estimator: Arc<dyn StorageEstimator>,
    hooks: HookRegistry,
}

impl Engine {
    /// An engine with the given configuration, the system clock, and no
    /// registered providers. Without a platform estimator the storage
    /// preflight passes optimistically (and says so in diagnostics).
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
            providers: HashMap::new(),
            estimator: Arc::new(FixedStorageEstimator::unsupported()),
            hooks: HookRegistry::new(),
        }
    }

    /// Registers a provider under its own id.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.id(), provider);
        self
    }

    /// Installs a platform storage estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn StorageEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replaces the clock (tests inject a manual one).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The lifecycle hook registry, for pre-start registration.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Spawns the orchestrator command loop and the watchdog.
    pub fn start(self) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, _keepalive_rx) = broadcast::channel(256);
        let (diag_tx, diag_rx) = mpsc::channel(8);
        let (fault_tx, fault_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let factory = EnvelopeFactory::new();
        let epoch_cell = factory.epoch_cell();
        let watchdog = Arc::new(Watchdog::new(
            &self.config.watchdog,
            self.config.healthcheck.stalled_threshold_ms,
            self.clock.clone(),
            fault_tx,
        ));

        let orchestrator = Orchestrator::new(OrchestratorDeps {
            config: self.config,
            clock: self.clock,
            providers: self.providers,
            estimator: self.estimator,
            hooks: self.hooks,
            cmd_rx,
            event_tx: event_tx.clone(),
            diag_rx,
            factory,
            watchdog: watchdog.clone(),
            fault_rx,
        });

        let tasks = vec![
            tokio::spawn(orchestrator.run(shutdown_rx.clone())),
            tokio::spawn(watchdog.run(shutdown_rx)),
        ];

        EngineHandle {
            cmd_tx,
            event_tx,
            diag_tx,
            epoch: epoch_cell,
            mint: Mutex::new(MintState { epoch: 0, seq: 0 }),
            shutdown_tx,
            tasks,
        }
    }
}

struct MintState {
    epoch: u32,
    seq: u32,
}

/// Handle to a running engine.
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Envelope<Command>>,
    event_tx: broadcast::Sender<Envelope<Event>>,
    diag_tx: mpsc::Sender<oneshot::Sender<Diagnostics>>,
    epoch: Arc<AtomicU32>,
    mint: Mutex<MintState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Subscribes to the event envelope stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<Event>> {
        self.event_tx.subscribe()
    }

    /// The engine's current epoch.
    pub fn current_epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wraps a command in an envelope minted against the live epoch and
    /// submits it. Commands minted before an abort boundary are dropped by
    /// the orchestrator as stale.
    pub async fn submit(&self, command: Command) -> Result<(), EngineError> {
        let envelope = {
            let mut mint = self
                .mint
                .lock()
                .map_err(|_| EngineError::Unknown("command mint poisoned".to_string()))?;
            let epoch = self.epoch.load(Ordering::SeqCst);
            if mint.epoch != epoch {
                mint.epoch = epoch;
                mint.seq = 0;
            }
            let envelope = Envelope::new(epoch, mint.seq, command);
            mint.seq += 1;
            envelope
        };
        self.cmd_tx
            .send(envelope)
            .await
            .map_err(|_| EngineError::Unknown("engine command loop is gone".to_string()))
    }

    /// Fetches the read-only diagnostics snapshot.
    pub async fn diagnostics(&self) -> Result<Diagnostics, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.diag_tx
            .send(reply_tx)
            .await
            .map_err(|_| EngineError::Unknown("engine command loop is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unknown("engine dropped the diagnostics request".to_string()))
    }

    /// Stops the orchestrator and watchdog tasks and waits them out.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).ok();
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::warn!(target: "orchestrator", "engine task panicked on shutdown: {}", error);
            }
        }
    }
}
