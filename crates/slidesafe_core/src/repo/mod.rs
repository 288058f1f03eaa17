//! Local persistence behind the save scheduler.
//!
//! # Responsibility
//! - Define the key-value contract the durable buffer writes through.
//! - Provide SQLite and in-memory stores implementing it.
//!
//! # Invariants
//! - Store failures are reported as `StoreError`; only `LocalBuffer` decides
//!   to swallow them.

pub mod kv_store;
pub mod local_buffer;
