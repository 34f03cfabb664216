//! Structured logging initialization.
//!
//! The engine logs through `tracing` with one target per subsystem
//! (`orchestrator`, `watchdog`, `model_cache`, ...). The default filter
//! keeps those at INFO and everything else at WARN; `RUST_LOG` overrides
//! the whole directive set.

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// The engine's subsystem log targets.
const SUBSYSTEM_TARGETS: &[&str] = &[
    "orchestrator",
    "fsm",
    "select",
    "quota",
    "model_cache",
    "models",
    "watchdog",
    "healthcheck",
    "hooks",
];

/// The default filter: INFO for every engine subsystem, WARN for the rest.
pub fn default_filter() -> EnvFilter {
    let mut filter = EnvFilter::new("warn");
    for target in SUBSYSTEM_TARGETS {
        if let Ok(directive) = format!("{target}=info").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initializes the global `tracing` subscriber for structured JSON logging,
/// honoring `RUST_LOG` when set and falling back to [`default_filter`].
pub fn init_tracing() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());
    init_tracing_with_filter(filter)
}

/// Installs the JSON subscriber with an explicit filter. Fails if a global
/// subscriber is already installed, so callers sharing a process (test
/// binaries) discard the second result.
pub fn init_tracing_with_filter(filter: EnvFilter) -> Result<(), anyhow::Error> {
    let fmt_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    // Bridge the `log` macros used by provider implementations.
    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
