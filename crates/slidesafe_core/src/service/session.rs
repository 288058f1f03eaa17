//! Editing session context.
//!
//! Owns the save scheduler and the slide recovery service for one open
//! editor, so independent editors (and tests) never share hidden state.

use crate::config::CoreConfig;
use crate::repo::kv_store::KeyValueStore;
use crate::repo::local_buffer::LocalBuffer;
use crate::service::save_scheduler::{DocumentPayload, RemotePersistence, SaveScheduler};
use crate::service::slide_recovery::{RecoveryOptions, RecoveryService};
use log::info;
use tokio::runtime::Handle;

pub struct EditingSession<P, D, R, S> {
    config: CoreConfig,
    scheduler: SaveScheduler<P, R, S>,
    recovery: RecoveryService<D>,
}

impl<P, D, R, S> EditingSession<P, D, R, S>
where
    P: DocumentPayload,
    D: Clone,
    R: RemotePersistence<P> + 'static,
    S: KeyValueStore + 'static,
{
    /// Builds a session from `config`; timers and writes run on `runtime`.
    pub fn new(config: CoreConfig, runtime: Handle, remote: R, store: S) -> Self {
        let buffer = LocalBuffer::with_prefix(store, config.save.key_prefix.clone());
        let scheduler = SaveScheduler::new(runtime, remote, buffer, config.save.delay());
        info!(
            "event=session_open module=session delay_ms={} max_retries={} fallback={}",
            config.save.delay_ms, config.recovery.max_retries, config.recovery.fallback_strategy
        );
        Self {
            config,
            scheduler,
            recovery: RecoveryService::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &SaveScheduler<P, R, S> {
        &self.scheduler
    }

    pub fn recovery(&self) -> &RecoveryService<D> {
        &self.recovery
    }

    /// Recovery options seeded from the session config.
    pub fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions::from_config(&self.config.recovery)
    }

    /// Drains pending saves, then tears down scheduler and recovery state.
    ///
    /// Documents whose final write failed stay in the local buffer.
    pub async fn shutdown(self) {
        self.scheduler.flush_all().await;
        let unsaved = self
            .scheduler
            .tracked_documents()
            .into_iter()
            .filter(|id| self.scheduler.is_dirty(id))
            .count();
        self.scheduler.destroy();
        self.recovery.reset();
        info!("event=session_close module=session unsaved_documents={unsaved}");
    }
}
