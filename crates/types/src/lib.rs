#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Axon Types
//!
//! This crate is the foundational library for the axon engine, containing all
//! core data structures, error types, and configuration objects.
//!
//! ## Architectural Role
//!
//! As the base crate, `axon-types` has minimal dependencies and is itself a
//! dependency for every other crate in the workspace. This structure prevents
//! circular dependencies and provides a stable, canonical definition for
//! shared types like `RuntimeState`, `Envelope`, `ModelSpec`, and the engine
//! error taxonomy.

/// One mebibyte, the unit used by every storage threshold in the engine.
pub const MIB: u64 = 1024 * 1024;

/// A top-level, crate-wide `Result` type alias with a default error type.
pub type Result<T, E = crate::error::EngineError> = std::result::Result<T, E>;

/// Chat message structures exchanged with inference providers.
pub mod chat;
/// Engine configuration structures and their TOML loading helpers.
pub mod config;
/// The unified error taxonomy with stable machine-readable codes.
pub mod error;
/// Model specifications and resident-model bookkeeping records.
pub mod model;
/// The command/event envelope protocol spoken across the engine boundary.
pub mod protocol;
/// Read-only report and diagnostics structures.
pub mod report;
/// The runtime state machine's state records.
pub mod state;
