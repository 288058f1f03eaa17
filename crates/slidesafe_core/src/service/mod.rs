//! Editing resilience services.
//!
//! # Responsibility
//! - `save_scheduler`: debounced, write-through document persistence.
//! - `slide_recovery` + `fallback`: per-slide failure isolation.
//! - `session`: one explicit context owning both for an open editor.
//!
//! # Invariants
//! - Services hold no process-wide state; every instance is independent.

pub mod fallback;
pub mod save_scheduler;
pub mod save_status;
pub mod session;
pub mod slide_recovery;
