#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! # Axon Engine
//!
//! The in-process orchestration core for on-device language-model inference.
//! A request (chat messages plus decoding parameters) is driven through
//! provider selection, storage preflight, cache check, download, warmup,
//! generation, and teardown, with epoch-tagged progress/token events,
//! cancellation, stall recovery, and resource budgeting along the way.
//!
//! The entry point is [`Engine`], which spawns the orchestrator command loop
//! and the watchdog and hands back an [`EngineHandle`] for submitting
//! commands and subscribing to events.

/// The engine façade: task spawning, handles, shutdown.
mod engine;
/// The `(epoch, seq)` envelope factory.
pub mod envelope;
/// The guarded runtime state machine.
pub mod fsm;
/// Stall arbitration via provider pings.
pub mod healthcheck;
/// The lifecycle hook registry.
pub mod hooks;
/// The resident-model manager.
pub mod models;
/// The command loop driving everything.
pub mod orchestrator;
/// Message canonicalization and token budgeting.
pub mod prompt;
/// The per-request retry ledger.
pub mod retry;
/// Provider selection over the policy order.
pub mod select;
/// Model cache and storage preflight.
pub mod storage;
/// Deadline and token-flow monitoring.
pub mod watchdog;

pub use engine::{Engine, EngineHandle};
pub use orchestrator::Orchestrator;
