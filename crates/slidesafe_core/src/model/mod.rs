//! Value types shared by the save and recovery services.
//!
//! # Invariants
//! - Document and slide payloads stay opaque: nothing in this module inspects them.
//! - Timestamps are Unix epoch milliseconds.

pub mod recovery;
pub mod snapshot;
