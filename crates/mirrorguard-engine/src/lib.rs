/*
[INPUT]:  Public API exports for mirrorguard-engine crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod engine;
pub mod linkid;
pub mod merge;
pub mod mirror;
pub mod monitor;
pub mod reconcile;
pub mod registry;
pub mod resilience;
pub mod store;
pub mod supervisor;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use engine::Engine;
pub use monitor::{AccountRole, Monitor, MonitorKey, Phase};
pub use registry::MonitorRegistry;
pub use store::PersistedStore;
pub use supervisor::Supervisor;
