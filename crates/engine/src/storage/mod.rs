//! Model storage: quota preflight and the LRU cache manager.

/// The LRU model cache registry.
pub mod cache;
/// The storage preflight computation.
pub mod quota;

pub use cache::{CacheManager, EvictionOutcome};
pub use quota::{preflight, quota_margin_bytes};
