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

//! # Axon API
//!
//! The abstraction seams of the axon engine: the `Provider` capability trait
//! every inference backend implements, the `StorageEstimator` seam for
//! platform quota probing, and the deterministic `MockProvider` used by the
//! test suites and as the `mock` provider family at runtime.

/// The deterministic mock backend.
pub mod mock;
/// The provider capability interface.
pub mod provider;
/// The platform storage estimation seam.
pub mod storage;

pub use mock::MockProvider;
pub use provider::{
    DetectResult, PrivacyClaim, ProgressSender, Provider, ProviderSupports, TokenSender,
};
pub use storage::{StorageEstimate, StorageEstimator};
