//! hc-core: stable foundation for hydrocouple.
//!
//! Contains:
//! - timeline (engine offset <-> calendar time bookkeeping)
//! - messages (drainable buffer for engine diagnostics)
//! - status (model run status)

pub mod messages;
pub mod status;
pub mod timeline;

// Re-exports: nice ergonomics for downstream crates
pub use messages::MessageBuffer;
pub use status::ModelStatus;
pub use timeline::ExecutionTimeline;
