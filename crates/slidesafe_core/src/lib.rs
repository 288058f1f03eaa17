//! Editing resilience core for the slidesafe presentation editor.
//!
//! Persists in-progress edits through a debounced, write-through save
//! scheduler and confines per-slide render/generation failures with a
//! bounded-retry recovery state machine.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, CoreConfig, RecoveryConfig, SaveConfig};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::recovery::{
    FallbackStrategy, PlaceholderSlide, RecoveredData, RecoveryResult, SlideRecoveryState,
    SlideStatus,
};
pub use model::snapshot::LocalSnapshot;
pub use repo::kv_store::{
    KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore, StoreError, StoreResult,
};
pub use repo::local_buffer::LocalBuffer;
pub use service::save_scheduler::{
    DocumentPayload, RemotePersistence, RemoteSaveError, SaveCallback, SaveOptions, SaveOutcome,
    SaveScheduler,
};
pub use service::save_status::SaveStatus;
pub use service::session::EditingSession;
pub use service::slide_recovery::{ProgressObserver, RecoveryOptions, RecoveryService};

/// Minimal health-check API for host integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
