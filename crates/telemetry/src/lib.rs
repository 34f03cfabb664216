#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # Axon Telemetry
//!
//! Observability infrastructure for the axon engine: structured logging
//! initialization and the engine-wide clock abstraction used for state
//! timing stamps.

/// The engine clock abstraction (`Clock`, `SystemClock`, `ManualClock`).
pub mod clock;
/// The initialization routine for global structured logging.
pub mod init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use init::{default_filter, init_tracing, init_tracing_with_filter};
