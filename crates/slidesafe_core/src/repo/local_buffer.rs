//! Best-effort write-through snapshot buffer.
//!
//! # Responsibility
//! - Keep the latest edited payload of each document in local storage so a
//!   crash before the remote write still leaves recoverable state.
//!
//! # Invariants
//! - `save` and `clear` never fail from the caller's point of view; storage
//!   errors are logged and absorbed.
//! - Keys are `<prefix><id>`.
//! - Unreadable or undecodable snapshots restore as `None`.

use crate::config::DEFAULT_KEY_PREFIX;
use crate::model::snapshot::LocalSnapshot;
use crate::repo::kv_store::{KeyValueStore, StoreResult};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Durable buffer over any [`KeyValueStore`].
pub struct LocalBuffer<S> {
    store: S,
    key_prefix: String,
}

impl<S: KeyValueStore> LocalBuffer<S> {
    pub fn new(store: S) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: S, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Overwrites the snapshot for `id` with `data` stamped at the current time.
    ///
    /// Returns whether the write landed. Failures are logged, never raised.
    pub fn save<P: Serialize>(&self, id: &str, data: &P) -> bool {
        match self.try_save(id, data) {
            Ok(()) => {
                debug!("event=buffer_save module=local_buffer status=ok");
                true
            }
            Err(err) => {
                warn!(
                    "event=buffer_save module=local_buffer status=error error_code={} error={}",
                    err.code(),
                    err
                );
                false
            }
        }
    }

    /// Reads back the snapshot for `id`.
    pub fn restore<P: DeserializeOwned>(&self, id: &str) -> Option<LocalSnapshot<P>> {
        let raw = match self.store.get(&self.key_for(id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(
                    "event=buffer_restore module=local_buffer status=error error_code={} error={}",
                    err.code(),
                    err
                );
                return None;
            }
        };

        match serde_json::from_str::<LocalSnapshot<P>>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    "event=buffer_restore module=local_buffer status=error error_code=decode_failed error={}",
                    err
                );
                None
            }
        }
    }

    /// Drops the snapshot for `id`.
    pub fn clear(&self, id: &str) {
        if let Err(err) = self.store.remove(&self.key_for(id)) {
            warn!(
                "event=buffer_clear module=local_buffer status=error error_code={} error={}",
                err.code(),
                err
            );
        }
    }

    fn try_save<P: Serialize>(&self, id: &str, data: &P) -> StoreResult<()> {
        let encoded = serde_json::to_string(&LocalSnapshot::new(data))?;
        self.store.set(&self.key_for(id), &encoded)
    }
}
