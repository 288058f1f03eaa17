//! Per-slide recovery state machine.
//!
//! # Responsibility
//! - Track error/retry/fallback state for each slide independently.
//! - Run caller-supplied recovery actions with bounded, linearly backed-off
//!   retries and resolve exhausted slides through a fallback strategy.
//!
//! # Invariants
//! - `recover_slide` always resolves to a `RecoveryResult`; action errors and
//!   panics are converted, never propagated.
//! - At most one recovery runs per slide id at a time.
//! - The machine never loops on its own: one `recover_slide` call makes at
//!   most one attempt.
//! - A result settling after `reset` or re-`initialize_slide` is not applied.

use crate::config::RecoveryConfig;
use crate::logging::{panic_payload_text, sanitize_message, MAX_ERROR_MESSAGE_CHARS};
use crate::model::recovery::{
    FallbackStrategy, RecoveredData, RecoveryResult, SlideRecoveryState, SlideStatus,
};
use crate::model::snapshot::now_epoch_ms;
use crate::service::fallback::resolve_fallback;
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const MESSAGE_ALREADY_HEALTHY: &str = "already healthy";
pub const MESSAGE_RECOVERED: &str = "slide recovered";
pub const MESSAGE_IN_PROGRESS: &str = "recovery already in progress";
pub const MESSAGE_DISCARDED: &str = "recovery discarded";

/// Observer told about every status change made by `recover_slide`.
pub type ProgressObserver = Arc<dyn Fn(&str, SlideStatus) + Send + Sync>;

/// Options for one `recover_slide` call.
#[derive(Clone)]
pub struct RecoveryOptions {
    pub max_retries: u32,
    /// Attempt `k` (zero-based) waits `retry_delay * k` before running.
    pub retry_delay: Duration,
    pub fallback_strategy: FallbackStrategy,
    pub on_progress: Option<ProgressObserver>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl Debug for RecoveryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("fallback_strategy", &self.fallback_strategy)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl RecoveryOptions {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            fallback_strategy: config.fallback_strategy,
            on_progress: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_fallback(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback_strategy = strategy;
        self
    }

    pub fn on_progress(mut self, observer: impl Fn(&str, SlideStatus) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(observer));
        self
    }

    fn notify(&self, slide_id: &str, status: SlideStatus) {
        let Some(observer) = &self.on_progress else {
            return;
        };
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| observer(slide_id, status)));
        if let Err(payload) = call {
            warn!(
                "event=progress_observer module=recovery status=error slide_id={} payload={}",
                slide_id,
                panic_payload_text(payload.as_ref())
            );
        }
    }
}

struct SlideEntry {
    state: SlideRecoveryState,
    /// Changes on `initialize_slide`, so stale attempts can be recognized.
    epoch: u64,
    recovering: bool,
}

struct Slides<D> {
    entries: HashMap<String, SlideEntry>,
    previous_versions: HashMap<String, D>,
    next_epoch: u64,
}

impl<D> Slides<D> {
    fn fresh_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

enum Start<D> {
    Resolved(RecoveryResult<D>, Option<SlideStatus>),
    Attempt { retry_count: u32, epoch: u64 },
}

/// Recovery state for every slide of a deck.
///
/// Cloning yields another handle to the same state.
pub struct RecoveryService<D> {
    slides: Arc<Mutex<Slides<D>>>,
}

impl<D> Clone for RecoveryService<D> {
    fn clone(&self) -> Self {
        Self {
            slides: Arc::clone(&self.slides),
        }
    }
}

impl<D: Clone> Default for RecoveryService<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Clone> RecoveryService<D> {
    pub fn new() -> Self {
        Self {
            slides: Arc::new(Mutex::new(Slides {
                entries: HashMap::new(),
                previous_versions: HashMap::new(),
                next_epoch: 0,
            })),
        }
    }

    /// Marks `slide_id` healthy with a fresh retry budget.
    ///
    /// `previous_data`, when given, becomes the snapshot served by the
    /// `previous` fallback. Any recovery still running for the slide is
    /// discarded when it settles.
    pub fn initialize_slide(&self, slide_id: &str, previous_data: Option<D>) {
        let mut slides = self.slides();
        let epoch = slides.fresh_epoch();
        slides.entries.insert(
            slide_id.to_string(),
            SlideEntry {
                state: SlideRecoveryState::healthy(slide_id),
                epoch,
                recovering: false,
            },
        );
        if let Some(data) = previous_data {
            slides.previous_versions.insert(slide_id.to_string(), data);
        }
        debug!("event=slide_initialized module=recovery slide_id={slide_id}");
    }

    /// Moves `slide_id` to `error`, creating its state if needed. Does not retry.
    pub fn report_error(
        &self,
        slide_id: &str,
        error_type: &str,
        error_message: &str,
    ) -> SlideRecoveryState {
        let mut guard = self.slides();
        let slides = &mut *guard;
        let entry = match slides.entries.entry(slide_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                slides.next_epoch += 1;
                entry.insert(SlideEntry {
                    state: SlideRecoveryState::healthy(slide_id),
                    epoch: slides.next_epoch,
                    recovering: false,
                })
            }
        };

        entry.state.status = SlideStatus::Error;
        entry.state.error_type = Some(error_type.to_string());
        entry.state.error_message = Some(sanitize_message(error_message, MAX_ERROR_MESSAGE_CHARS));
        entry.state.last_attempt = Some(now_epoch_ms());
        info!(
            "event=slide_error module=recovery slide_id={} error_type={} retry_count={}",
            slide_id, error_type, entry.state.retry_count
        );
        entry.state.clone()
    }

    /// Makes at most one recovery attempt for `slide_id`.
    ///
    /// Healthy or unknown slides resolve at once. Slides whose retry budget is
    /// spent resolve through the fallback strategy without running `action`.
    pub async fn recover_slide<F, Fut, E>(
        &self,
        slide_id: &str,
        action: F,
        options: &RecoveryOptions,
    ) -> RecoveryResult<D>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<D, E>>,
        E: Display,
    {
        let (retry_count, epoch) = match self.begin(slide_id, options) {
            Start::Resolved(result, transition) => {
                if let Some(status) = transition {
                    options.notify(slide_id, status);
                }
                return result;
            }
            Start::Attempt { retry_count, epoch } => (retry_count, epoch),
        };
        options.notify(slide_id, SlideStatus::Recovering);

        let mut guard = AttemptGuard {
            slides: &self.slides,
            slide_id,
            epoch,
            armed: true,
        };

        let delay = options.retry_delay.saturating_mul(retry_count);
        if !delay.is_zero() {
            debug!(
                "event=recovery_backoff module=recovery slide_id={} delay_ms={}",
                slide_id,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }

        info!(
            "event=recovery_attempt module=recovery status=start slide_id={} attempt={}/{}",
            slide_id,
            retry_count + 1,
            options.max_retries
        );
        let outcome = match AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(sanitize_message(&err.to_string(), MAX_ERROR_MESSAGE_CHARS)),
            Err(payload) => Err(format!(
                "recovery action panicked: {}",
                panic_payload_text(payload.as_ref())
            )),
        };

        let (result, status) = self.finish(slide_id, epoch, outcome, options);
        guard.armed = false;
        if let Some(status) = status {
            options.notify(slide_id, status);
        }
        result
    }

    /// Recovers `slide_ids` one after another, in order.
    ///
    /// `action_factory` is only called for slides that get an attempt.
    pub async fn recover_multiple_slides<I, F, Fut, E>(
        &self,
        slide_ids: I,
        mut action_factory: F,
        options: &RecoveryOptions,
    ) -> Vec<RecoveryResult<D>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = Result<D, E>>,
        E: Display,
    {
        let mut results = Vec::new();
        for slide_id in slide_ids {
            let slide_id = slide_id.as_ref();
            let result = self
                .recover_slide(slide_id, || action_factory(slide_id), options)
                .await;
            results.push(result);
        }
        results
    }

    pub fn slide_state(&self, slide_id: &str) -> Option<SlideRecoveryState> {
        self.slides()
            .entries
            .get(slide_id)
            .map(|entry| entry.state.clone())
    }

    pub fn all_states(&self) -> HashMap<String, SlideRecoveryState> {
        self.slides()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    /// Ids in `error` or `failed`, sorted.
    pub fn error_slides(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slides()
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.status.is_broken())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stores an owned copy of `data` as the slide's last known-good version.
    pub fn save_previous_version(&self, slide_id: &str, data: &D) {
        self.slides()
            .previous_versions
            .insert(slide_id.to_string(), data.clone());
    }

    pub fn previous_version(&self, slide_id: &str) -> Option<D> {
        self.slides().previous_versions.get(slide_id).cloned()
    }

    /// Forgets every slide state and snapshot.
    pub fn reset(&self) {
        let mut slides = self.slides();
        let dropped = slides.entries.len();
        slides.entries.clear();
        slides.previous_versions.clear();
        info!("event=recovery_reset module=recovery slides={dropped}");
    }

    fn slides(&self) -> MutexGuard<'_, Slides<D>> {
        self.slides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, slide_id: &str, options: &RecoveryOptions) -> Start<D> {
        let mut guard = self.slides();
        let slides = &mut *guard;

        let Some(entry) = slides.entries.get_mut(slide_id) else {
            return Start::Resolved(
                RecoveryResult::succeeded(slide_id, MESSAGE_ALREADY_HEALTHY, None),
                None,
            );
        };
        if entry.state.status == SlideStatus::Healthy {
            return Start::Resolved(
                RecoveryResult::succeeded(slide_id, MESSAGE_ALREADY_HEALTHY, None),
                None,
            );
        }
        if entry.recovering {
            debug!("event=recovery_attempt module=recovery status=busy slide_id={slide_id}");
            return Start::Resolved(RecoveryResult::failed(slide_id, MESSAGE_IN_PROGRESS), None);
        }
        if entry.state.retry_count >= options.max_retries {
            // A recovered slide keeps its status; only an erroring one becomes failed.
            let transition = (entry.state.status == SlideStatus::Error).then(|| {
                entry.state.status = SlideStatus::Failed;
                SlideStatus::Failed
            });
            let result = resolve_fallback(
                slide_id,
                options.fallback_strategy,
                slides.previous_versions.get(slide_id),
            );
            return Start::Resolved(result, transition);
        }

        entry.recovering = true;
        entry.state.status = SlideStatus::Recovering;
        Start::Attempt {
            retry_count: entry.state.retry_count,
            epoch: entry.epoch,
        }
    }

    fn finish(
        &self,
        slide_id: &str,
        epoch: u64,
        outcome: Result<D, String>,
        options: &RecoveryOptions,
    ) -> (RecoveryResult<D>, Option<SlideStatus>) {
        let mut guard = self.slides();
        let slides = &mut *guard;

        let entry = match slides.entries.get_mut(slide_id) {
            Some(entry) if entry.epoch == epoch => entry,
            _ => {
                debug!("event=recovery_attempt module=recovery status=discarded slide_id={slide_id}");
                return (RecoveryResult::failed(slide_id, MESSAGE_DISCARDED), None);
            }
        };

        entry.recovering = false;
        entry.state.retry_count = entry.state.retry_count.saturating_add(1);
        entry.state.last_attempt = Some(now_epoch_ms());
        let attempt = entry.state.retry_count;

        match outcome {
            Ok(data) => {
                entry.state.status = SlideStatus::Recovered;
                info!(
                    "event=recovery_attempt module=recovery status=ok slide_id={} attempt={}",
                    slide_id, attempt
                );
                (
                    RecoveryResult::succeeded(
                        slide_id,
                        MESSAGE_RECOVERED,
                        Some(RecoveredData::Recovered(data)),
                    ),
                    Some(SlideStatus::Recovered),
                )
            }
            Err(message) => {
                warn!(
                    "event=recovery_attempt module=recovery status=error slide_id={} attempt={}/{} error={}",
                    slide_id, attempt, options.max_retries, message
                );
                entry.state.error_message = Some(message);
                if attempt >= options.max_retries {
                    entry.state.status = SlideStatus::Failed;
                    let result = resolve_fallback(
                        slide_id,
                        options.fallback_strategy,
                        slides.previous_versions.get(slide_id),
                    );
                    (result, Some(SlideStatus::Failed))
                } else {
                    entry.state.status = SlideStatus::Error;
                    (
                        RecoveryResult::failed(
                            slide_id,
                            format!("attempt {attempt}/{} failed", options.max_retries),
                        ),
                        Some(SlideStatus::Error),
                    )
                }
            }
        }
    }
}

/// Returns a slide to `error` if its recovery future is dropped mid-attempt.
struct AttemptGuard<'a, D> {
    slides: &'a Mutex<Slides<D>>,
    slide_id: &'a str,
    epoch: u64,
    armed: bool,
}

impl<D> Drop for AttemptGuard<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slides = self.slides.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = slides.entries.get_mut(self.slide_id) {
            if entry.epoch == self.epoch && entry.recovering {
                entry.recovering = false;
                entry.state.status = SlideStatus::Error;
            }
        }
    }
}
