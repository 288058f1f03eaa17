//! Debounced document save scheduler.
//!
//! # Responsibility
//! - Coalesce bursts of edits into one remote write per quiet period.
//! - Write every edit through to the local durable buffer before anything else.
//! - Expose dirty/saving observers for the editor chrome.
//!
//! # Invariants
//! - At most one pending debounce timer per document id; rescheduling aborts
//!   the previous one.
//! - At most one in-flight remote write per document id. A trigger arriving
//!   mid-flight is deferred and re-checked once the flight settles.
//! - `dirty` is cleared only by a successful write of the latest revision.
//! - A failed write is never retried on its own; the next `schedule_save` or
//!   `flush_all` retries it.
//! - Results of a write that settles after `cancel_save`/`destroy` are dropped.

use crate::logging::{sanitize_message, MAX_ERROR_MESSAGE_CHARS};
use crate::model::snapshot::{now_epoch_ms, LocalSnapshot};
use crate::repo::kv_store::KeyValueStore;
use crate::repo::local_buffer::LocalBuffer;
use crate::service::save_status::SaveStatus;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Bounds every document payload must satisfy.
pub trait DocumentPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> DocumentPayload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Failure reported by the remote persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSaveError {
    /// Server answered with a non-success status.
    Status { code: u16, reason: String },
    /// Request never completed (offline, DNS, reset, timeout).
    Network(String),
}

impl Display for RemoteSaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { code, reason } => write!(f, "server returned {code} {reason}"),
            Self::Network(details) => write!(f, "network error: {details}"),
        }
    }
}

impl Error for RemoteSaveError {}

/// Remote persistence collaborator.
#[async_trait]
pub trait RemotePersistence<P: Sync>: Send + Sync {
    async fn persist(&self, document_id: &str, payload: &P) -> Result<(), RemoteSaveError>;
}

#[async_trait]
impl<P, T> RemotePersistence<P> for Arc<T>
where
    P: Sync,
    T: RemotePersistence<P> + ?Sized,
{
    async fn persist(&self, document_id: &str, payload: &P) -> Result<(), RemoteSaveError> {
        (**self).persist(document_id, payload).await
    }
}

/// Result delivered to save callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub document_id: String,
    pub success: bool,
    pub message: String,
}

pub type SaveCallback = Box<dyn FnOnce(&SaveOutcome) + Send>;

/// Per-call scheduling options.
#[derive(Default)]
pub struct SaveOptions {
    /// Debounce delay; `None` uses the scheduler default.
    pub delay: Option<Duration>,
    /// Skip the debounce and start the remote write right away.
    pub immediate: bool,
    /// Notified once, by the write that carries this call's payload.
    pub on_save: Option<SaveCallback>,
}

impl SaveOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn on_save(mut self, callback: impl FnOnce(&SaveOutcome) + Send + 'static) -> Self {
        self.on_save = Some(Box::new(callback));
        self
    }
}

struct SaveState<P> {
    payload: P,
    dirty: bool,
    /// Bumped by every `schedule_save`.
    revision: u64,
    /// Distinguishes a state recreated after `cancel_save` from the old one.
    epoch: u64,
    last_saved_at: Option<i64>,
    last_error: Option<String>,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    rerun_requested: bool,
    pending_callbacks: Vec<SaveCallback>,
}

impl<P> SaveState<P> {
    fn new(payload: P, epoch: u64) -> Self {
        Self {
            payload,
            dirty: false,
            revision: 0,
            epoch,
            last_saved_at: None,
            last_error: None,
            timer: None,
            timer_generation: 0,
            rerun_requested: false,
            pending_callbacks: Vec::new(),
        }
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

struct Registry<P> {
    states: HashMap<String, SaveState<P>>,
    in_flight: HashSet<String>,
    next_epoch: u64,
}

struct Attempt<P> {
    payload: P,
    revision: u64,
    epoch: u64,
    callbacks: Vec<SaveCallback>,
}

enum Trigger {
    Idle,
    Deferred,
    Settled(Option<SaveOutcome>),
}

struct Shared<P, R, S> {
    runtime: Handle,
    remote: R,
    buffer: LocalBuffer<S>,
    default_delay: Duration,
    registry: Mutex<Registry<P>>,
    settled: Notify,
}

/// Debounced save scheduler for many documents.
///
/// Cloning yields another handle to the same scheduler.
pub struct SaveScheduler<P, R, S> {
    shared: Arc<Shared<P, R, S>>,
}

impl<P, R, S> Clone for SaveScheduler<P, R, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P, R, S> SaveScheduler<P, R, S>
where
    P: DocumentPayload,
    R: RemotePersistence<P> + 'static,
    S: KeyValueStore + 'static,
{
    /// Creates a scheduler whose timers and writes run on `runtime`.
    pub fn new(runtime: Handle, remote: R, buffer: LocalBuffer<S>, default_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                remote,
                buffer,
                default_delay,
                registry: Mutex::new(Registry {
                    states: HashMap::new(),
                    in_flight: HashSet::new(),
                    next_epoch: 0,
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Records an edit of `document_id` and (re)arms its save.
    ///
    /// The payload reaches the local buffer before this returns, whatever
    /// happens to the remote write.
    pub fn schedule_save(&self, document_id: &str, payload: P, options: SaveOptions) {
        let SaveOptions {
            delay,
            immediate,
            on_save,
        } = options;
        let delay = delay.unwrap_or(self.shared.default_delay);

        let mut guard = self.shared.registry();
        let registry = &mut *guard;

        self.shared.buffer.save(document_id, &payload);

        let state = match registry.states.entry(document_id.to_string()) {
            Entry::Occupied(entry) => {
                let state = entry.into_mut();
                state.payload = payload;
                state
            }
            Entry::Vacant(entry) => {
                registry.next_epoch += 1;
                entry.insert(SaveState::new(payload, registry.next_epoch))
            }
        };
        state.abort_timer();
        state.dirty = true;
        state.revision += 1;
        if let Some(callback) = on_save {
            state.pending_callbacks.push(callback);
        }
        debug!(
            "event=save_scheduled module=save_scheduler doc_id={} revision={} immediate={} delay_ms={}",
            document_id,
            state.revision,
            immediate,
            delay.as_millis()
        );

        let shared = Arc::clone(&self.shared);
        let id = document_id.to_string();
        if immediate {
            drop(guard);
            self.shared.runtime.spawn(async move {
                shared.trigger(&id).await;
            });
        } else {
            let generation = state.timer_generation;
            state.timer = Some(self.shared.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                shared.fire_timer(&id, generation).await;
            }));
        }
    }

    /// Runs one remote write for `document_id` now, if it is dirty.
    ///
    /// Returns `None` when there was nothing to do, when a write is already in
    /// flight (the trigger is then deferred), or when the result was discarded
    /// by a cancellation.
    pub async fn execute_save(&self, document_id: &str) -> Option<SaveOutcome> {
        match self.shared.trigger(document_id).await {
            Trigger::Settled(outcome) => outcome,
            Trigger::Idle | Trigger::Deferred => None,
        }
    }

    /// Drops the pending timer and in-memory state without a remote write.
    ///
    /// The local buffer keeps its snapshot.
    pub fn cancel_save(&self, document_id: &str) {
        let removed = self.shared.registry().states.remove(document_id);
        if let Some(mut state) = removed {
            state.abort_timer();
            info!(
                "event=save_cancelled module=save_scheduler doc_id={} was_dirty={}",
                document_id, state.dirty
            );
        }
    }

    /// Writes every dirty document and waits for all of them to settle.
    pub async fn flush_all(&self) {
        let dirty_ids: Vec<String> = self
            .shared
            .registry()
            .states
            .iter()
            .filter(|(_, state)| state.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        if dirty_ids.is_empty() {
            return;
        }

        info!(
            "event=flush_all module=save_scheduler status=start documents={}",
            dirty_ids.len()
        );
        futures_util::future::join_all(dirty_ids.iter().map(|id| self.shared.drain(id))).await;
        info!("event=flush_all module=save_scheduler status=ok");
    }

    /// Aborts every timer and forgets every document. Buffered snapshots stay.
    pub fn destroy(&self) {
        let mut registry = self.shared.registry();
        for state in registry.states.values_mut() {
            state.abort_timer();
        }
        let dropped = registry.states.len();
        registry.states.clear();
        info!("event=scheduler_destroyed module=save_scheduler documents={dropped}");
    }

    pub fn is_dirty(&self, document_id: &str) -> bool {
        self.shared
            .registry()
            .states
            .get(document_id)
            .is_some_and(|state| state.dirty)
    }

    /// Whether a remote write for `document_id` is in flight.
    pub fn is_saving_presentation(&self, document_id: &str) -> bool {
        self.shared.is_in_flight(document_id)
    }

    /// Epoch milliseconds of the last confirmed remote write.
    pub fn last_saved_at(&self, document_id: &str) -> Option<i64> {
        self.shared
            .registry()
            .states
            .get(document_id)
            .and_then(|state| state.last_saved_at)
    }

    /// Status shown by the save indicator. `online` is the caller's view of connectivity.
    pub fn save_status(&self, document_id: &str, online: bool) -> SaveStatus {
        let registry = self.shared.registry();
        let saving = registry.in_flight.contains(document_id);
        let (dirty, last_failed) = registry
            .states
            .get(document_id)
            .map_or((false, false), |state| {
                (state.dirty, state.last_error.is_some())
            });
        SaveStatus::derive(online, saving, dirty, last_failed)
    }

    /// Ids with live scheduler state, sorted.
    pub fn tracked_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.registry().states.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reads the buffered snapshot, e.g. to offer recovery when the editor opens.
    pub fn restore_local(&self, document_id: &str) -> Option<LocalSnapshot<P>> {
        self.shared.buffer.restore(document_id)
    }

    pub fn clear_local(&self, document_id: &str) {
        self.shared.buffer.clear(document_id);
    }
}

impl<P, R, S> Shared<P, R, S>
where
    P: DocumentPayload,
    R: RemotePersistence<P> + 'static,
    S: KeyValueStore + 'static,
{
    fn registry(&self) -> MutexGuard<'_, Registry<P>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_in_flight(&self, document_id: &str) -> bool {
        self.registry().in_flight.contains(document_id)
    }

    async fn fire_timer(&self, document_id: &str, generation: u64) {
        {
            let mut registry = self.registry();
            match registry.states.get_mut(document_id) {
                Some(state) if state.timer_generation == generation => state.timer = None,
                _ => return,
            }
        }
        self.trigger(document_id).await;
    }

    /// Runs writes until no deferred trigger remains for `document_id`.
    async fn trigger(&self, document_id: &str) -> Trigger {
        let mut last = Trigger::Idle;
        loop {
            let attempt = match self.begin_attempt(document_id) {
                Ok(Some(attempt)) => attempt,
                Ok(None) => return last,
                Err(()) => {
                    return match last {
                        Trigger::Idle => Trigger::Deferred,
                        settled => settled,
                    }
                }
            };

            let Attempt {
                payload,
                revision,
                epoch,
                callbacks,
            } = attempt;

            let mut flight = FlightGuard {
                registry: &self.registry,
                settled: &self.settled,
                document_id,
                armed: true,
            };
            info!(
                "event=remote_save module=save_scheduler status=start doc_id={} revision={}",
                document_id, revision
            );
            let result = self.remote.persist(document_id, &payload).await;
            let (outcome, rerun) = self.finish_attempt(document_id, revision, epoch, result);
            flight.armed = false;
            drop(flight);
            self.settled.notify_waiters();

            if let Some(outcome) = &outcome {
                for callback in callbacks {
                    callback(outcome);
                }
            }
            last = Trigger::Settled(outcome);
            if !rerun {
                return last;
            }
            debug!(
                "event=remote_save module=save_scheduler status=rerun doc_id={}",
                document_id
            );
        }
    }

    /// `Err(())` means a write is already in flight and the trigger was deferred.
    fn begin_attempt(&self, document_id: &str) -> Result<Option<Attempt<P>>, ()> {
        let mut guard = self.registry();
        let registry = &mut *guard;

        if registry.in_flight.contains(document_id) {
            if let Some(state) = registry.states.get_mut(document_id) {
                state.rerun_requested = true;
            }
            debug!(
                "event=remote_save module=save_scheduler status=deferred doc_id={}",
                document_id
            );
            return Err(());
        }

        let Some(state) = registry.states.get_mut(document_id) else {
            return Ok(None);
        };
        if !state.dirty {
            return Ok(None);
        }
        state.rerun_requested = false;
        let attempt = Attempt {
            payload: state.payload.clone(),
            revision: state.revision,
            epoch: state.epoch,
            callbacks: std::mem::take(&mut state.pending_callbacks),
        };
        registry.in_flight.insert(document_id.to_string());
        Ok(Some(attempt))
    }

    /// Applies a settled write. Returns the outcome to report (if the state
    /// still exists) and whether a deferred trigger needs another run.
    fn finish_attempt(
        &self,
        document_id: &str,
        revision: u64,
        epoch: u64,
        result: Result<(), RemoteSaveError>,
    ) -> (Option<SaveOutcome>, bool) {
        let mut guard = self.registry();
        let registry = &mut *guard;
        registry.in_flight.remove(document_id);

        let Some(state) = registry.states.get_mut(document_id) else {
            debug!(
                "event=remote_save module=save_scheduler status=discarded doc_id={}",
                document_id
            );
            return (None, false);
        };
        let rerun = state.rerun_requested && state.dirty;
        if state.epoch != epoch {
            debug!(
                "event=remote_save module=save_scheduler status=discarded doc_id={}",
                document_id
            );
            return (None, rerun);
        }

        let outcome = match result {
            Ok(()) => {
                state.last_saved_at = Some(now_epoch_ms());
                state.last_error = None;
                if state.revision == revision {
                    state.dirty = false;
                }
                info!(
                    "event=remote_save module=save_scheduler status=ok doc_id={} revision={} still_dirty={}",
                    document_id, revision, state.dirty
                );
                SaveOutcome {
                    document_id: document_id.to_string(),
                    success: true,
                    message: "saved".to_string(),
                }
            }
            Err(err) => {
                let message = sanitize_message(&err.to_string(), MAX_ERROR_MESSAGE_CHARS);
                warn!(
                    "event=remote_save module=save_scheduler status=error doc_id={} revision={} error={}",
                    document_id, revision, message
                );
                state.last_error = Some(message.clone());
                SaveOutcome {
                    document_id: document_id.to_string(),
                    success: false,
                    message: format!("save failed: {message}"),
                }
            }
        };
        let rerun = state.rerun_requested && state.dirty;
        (Some(outcome), rerun)
    }

    /// Waits out any in-flight write, then writes once.
    async fn drain(&self, document_id: &str) {
        loop {
            self.wait_until_settled(document_id).await;
            match self.trigger(document_id).await {
                Trigger::Deferred => continue,
                Trigger::Idle | Trigger::Settled(_) => return,
            }
        }
    }

    async fn wait_until_settled(&self, document_id: &str) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_in_flight(document_id) {
                return;
            }
            notified.await;
        }
    }
}

/// Releases the in-flight slot if a write future is dropped before settling.
struct FlightGuard<'a, P> {
    registry: &'a Mutex<Registry<P>>,
    settled: &'a Notify,
    document_id: &'a str,
    armed: bool,
}

impl<P> Drop for FlightGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(self.document_id);
        self.settled.notify_waiters();
    }
}
