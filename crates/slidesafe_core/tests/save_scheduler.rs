use async_trait::async_trait;
use serde_json::{json, Value};
use slidesafe_core::{
    LocalBuffer, MemoryKeyValueStore, RemotePersistence, RemoteSaveError, SaveOptions,
    SaveOutcome, SaveScheduler, SaveStatus,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};

const DELAY: Duration = Duration::from_millis(5_000);

#[derive(Default)]
struct RecordingRemote {
    calls: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingRemote {
    fn with_latency(latency_ms: u64) -> Arc<Self> {
        let remote = Self::default();
        remote.latency_ms.store(latency_ms, Ordering::SeqCst);
        Arc::new(remote)
    }

    fn failing() -> Arc<Self> {
        let remote = Self::default();
        remote.failing.store(true, Ordering::SeqCst);
        Arc::new(remote)
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn payloads(&self) -> Vec<Value> {
        self.calls().into_iter().map(|(_, payload)| payload).collect()
    }
}

#[async_trait]
impl RemotePersistence<Value> for RecordingRemote {
    async fn persist(&self, document_id: &str, payload: &Value) -> Result<(), RemoteSaveError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((document_id.to_string(), payload.clone()));

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            Err(RemoteSaveError::Status {
                code: 503,
                reason: "Service Unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

type TestScheduler = SaveScheduler<Value, Arc<RecordingRemote>, Arc<MemoryKeyValueStore>>;

fn scheduler_with(remote: &Arc<RecordingRemote>, store: &Arc<MemoryKeyValueStore>) -> TestScheduler {
    SaveScheduler::new(
        Handle::current(),
        Arc::clone(remote),
        LocalBuffer::new(Arc::clone(store)),
        DELAY,
    )
}

fn scheduler(remote: &Arc<RecordingRemote>) -> TestScheduler {
    scheduler_with(remote, &Arc::new(MemoryKeyValueStore::new()))
}

fn recorder() -> (Arc<Mutex<Vec<SaveOutcome>>>, impl Fn() -> SaveOptions) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let make = move || {
        let sink = Arc::clone(&sink);
        SaveOptions::default().on_save(move |outcome| sink.lock().unwrap().push(outcome.clone()))
    };
    (outcomes, make)
}

#[tokio::test(start_paused = true)]
async fn burst_of_edits_produces_one_save_with_last_payload() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);

    for revision in 1..=5 {
        scheduler.schedule_save("doc1", json!({ "rev": revision }), SaveOptions::default());
        sleep(Duration::from_millis(100)).await;
    }
    // Last edit landed at t=400ms, so its timer fires at t=5400ms.
    sleep(Duration::from_millis(4_899)).await;
    assert!(remote.calls().is_empty());
    assert!(scheduler.is_dirty("doc1"));

    sleep(Duration::from_millis(2)).await;
    assert_eq!(remote.payloads(), vec![json!({ "rev": 5 })]);
    assert!(!scheduler.is_dirty("doc1"));
}

#[tokio::test(start_paused = true)]
async fn scenario_a_debounced_save_clears_dirty() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);

    scheduler.schedule_save("doc1", json!({ "title": "A" }), SaveOptions::default());
    assert!(scheduler.is_dirty("doc1"));
    assert_eq!(scheduler.save_status("doc1", true), SaveStatus::Pending);

    sleep(DELAY + Duration::from_millis(1)).await;

    assert!(!scheduler.is_dirty("doc1"));
    assert!(scheduler.last_saved_at("doc1").is_some());
    assert_eq!(scheduler.save_status("doc1", true), SaveStatus::Saved);
    assert_eq!(remote.calls(), vec![("doc1".to_string(), json!({ "title": "A" }))]);
}

#[tokio::test(start_paused = true)]
async fn immediate_save_skips_the_debounce_window() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);
    let started = Instant::now();

    scheduler.schedule_save("doc1", json!({ "title": "now" }), SaveOptions::immediate());
    sleep(Duration::from_millis(1)).await;

    assert_eq!(remote.calls().len(), 1);
    assert!(started.elapsed() < DELAY);
    assert!(!scheduler.is_dirty("doc1"));
}

#[tokio::test(start_paused = true)]
async fn rapid_triggers_never_overlap_for_one_document() {
    let remote = RecordingRemote::with_latency(1_000);
    let scheduler = scheduler(&remote);

    scheduler.schedule_save("doc1", json!(1), SaveOptions::immediate());
    sleep(Duration::from_millis(10)).await;
    assert!(scheduler.is_saving_presentation("doc1"));
    assert_eq!(scheduler.save_status("doc1", true), SaveStatus::Saving);

    scheduler.schedule_save("doc1", json!(2), SaveOptions::immediate());
    scheduler.schedule_save("doc1", json!(3), SaveOptions::immediate());
    assert_eq!(scheduler.execute_save("doc1").await, None);

    sleep(Duration::from_millis(3_000)).await;

    assert_eq!(remote.max_active.load(Ordering::SeqCst), 1);
    // The deferred triggers collapse into one follow-up write of the newest payload.
    assert_eq!(remote.payloads(), vec![json!(1), json!(3)]);
    assert!(!scheduler.is_dirty("doc1"));
    assert!(!scheduler.is_saving_presentation("doc1"));
}

#[tokio::test(start_paused = true)]
async fn edit_during_flight_is_saved_after_the_flight_settles() {
    let remote = RecordingRemote::with_latency(1_000);
    let scheduler = scheduler(&remote);
    let short = || SaveOptions::with_delay(Duration::from_millis(100));

    scheduler.schedule_save("doc1", json!("first"), short());
    sleep(Duration::from_millis(500)).await;
    assert!(scheduler.is_saving_presentation("doc1"));

    scheduler.schedule_save("doc1", json!("second"), short());
    // First flight settles at t=1100ms but carried an older revision.
    sleep(Duration::from_millis(650)).await;
    assert!(scheduler.is_dirty("doc1"));

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(remote.payloads(), vec![json!("first"), json!("second")]);
    assert!(!scheduler.is_dirty("doc1"));
}

#[tokio::test(start_paused = true)]
async fn cancel_prevents_remote_write_but_keeps_buffer() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);

    scheduler.schedule_save("doc1", json!({ "title": "draft" }), SaveOptions::default());
    scheduler.cancel_save("doc1");
    sleep(DELAY * 2).await;

    assert!(remote.calls().is_empty());
    assert!(!scheduler.is_dirty("doc1"));
    assert!(scheduler.tracked_documents().is_empty());
    let snapshot = scheduler.restore_local("doc1").expect("buffer keeps the draft");
    assert_eq!(snapshot.data, json!({ "title": "draft" }));
}

#[tokio::test(start_paused = true)]
async fn result_settling_after_cancel_is_discarded() {
    let remote = RecordingRemote::with_latency(1_000);
    let scheduler = scheduler(&remote);
    let (outcomes, options) = recorder();

    scheduler.schedule_save("doc1", json!(1), SaveOptions { immediate: true, ..options() });
    sleep(Duration::from_millis(10)).await;
    scheduler.cancel_save("doc1");
    sleep(Duration::from_millis(2_000)).await;

    assert_eq!(remote.calls().len(), 1);
    assert!(outcomes.lock().unwrap().is_empty());
    assert!(!scheduler.is_dirty("doc1"));
    assert!(!scheduler.is_saving_presentation("doc1"));
}

#[tokio::test(start_paused = true)]
async fn failed_save_stays_dirty_until_explicitly_retried() {
    let remote = RecordingRemote::failing();
    let scheduler = scheduler(&remote);
    let (outcomes, options) = recorder();

    scheduler.schedule_save("doc1", json!({ "title": "A" }), options());
    sleep(DELAY + Duration::from_millis(1)).await;

    assert_eq!(remote.calls().len(), 1);
    assert!(scheduler.is_dirty("doc1"));
    assert_eq!(scheduler.save_status("doc1", true), SaveStatus::Error);
    assert_eq!(scheduler.save_status("doc1", false), SaveStatus::Offline);
    {
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(outcomes[0].message.contains("503"));
    }

    sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.calls().len(), 1, "no automatic retry after failure");

    remote.failing.store(false, Ordering::SeqCst);
    scheduler.flush_all().await;
    assert_eq!(remote.calls().len(), 2);
    assert!(!scheduler.is_dirty("doc1"));
    assert_eq!(scheduler.save_status("doc1", true), SaveStatus::Saved);
    // The callback belonged to the failed attempt and is not called again.
    assert_eq!(outcomes.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn buffer_failure_does_not_block_remote_save() {
    let remote = RecordingRemote::with_latency(0);
    let store = Arc::new(MemoryKeyValueStore::with_quota(8));
    let scheduler = scheduler_with(&remote, &store);

    scheduler.schedule_save("doc1", json!({ "title": "too big" }), SaveOptions::immediate());
    sleep(Duration::from_millis(1)).await;

    assert!(store.is_empty());
    assert!(scheduler.restore_local("doc1").is_none());
    assert_eq!(remote.calls().len(), 1);
    assert!(!scheduler.is_dirty("doc1"));
}

#[tokio::test(start_paused = true)]
async fn schedule_writes_buffer_synchronously() {
    let remote = RecordingRemote::with_latency(0);
    let store = Arc::new(MemoryKeyValueStore::new());
    let scheduler = scheduler_with(&remote, &store);

    scheduler.schedule_save("doc1", json!({ "slides": 3 }), SaveOptions::default());

    let snapshot = scheduler.restore_local("doc1").expect("buffered before any await");
    assert_eq!(snapshot.data, json!({ "slides": 3 }));
    scheduler.clear_local("doc1");
    assert!(scheduler.restore_local("doc1").is_none());
    assert!(scheduler.is_dirty("doc1"));
}

#[tokio::test(start_paused = true)]
async fn flush_all_drains_in_flight_and_pending_documents() {
    let remote = RecordingRemote::with_latency(1_000);
    let scheduler = scheduler(&remote);
    let started = Instant::now();

    scheduler.schedule_save("doc1", json!("a1"), SaveOptions::immediate());
    sleep(Duration::from_millis(10)).await;
    scheduler.schedule_save("doc1", json!("a2"), SaveOptions::default());
    scheduler.schedule_save("doc2", json!("b1"), SaveOptions::default());

    scheduler.flush_all().await;

    assert!(started.elapsed() < DELAY);
    assert!(!scheduler.is_dirty("doc1"));
    assert!(!scheduler.is_dirty("doc2"));
    let mut calls = remote.calls();
    calls.sort_by(|left, right| left.0.cmp(&right.0));
    assert_eq!(
        calls,
        vec![
            ("doc1".to_string(), json!("a1")),
            ("doc1".to_string(), json!("a2")),
            ("doc2".to_string(), json!("b1")),
        ]
    );

    // Timers armed before the flush find nothing left to write.
    sleep(DELAY * 2).await;
    assert_eq!(remote.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn callbacks_fire_once_for_the_write_carrying_their_payload() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);
    let (outcomes, options) = recorder();

    scheduler.schedule_save("doc1", json!(1), options());
    scheduler.schedule_save("doc1", json!(2), options());
    sleep(DELAY + Duration::from_millis(1)).await;

    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| outcome.success));
    assert!(outcomes.iter().all(|outcome| outcome.document_id == "doc1"));
}

#[tokio::test(start_paused = true)]
async fn destroy_forgets_state_and_timers() {
    let remote = RecordingRemote::with_latency(0);
    let scheduler = scheduler(&remote);

    scheduler.schedule_save("doc1", json!(1), SaveOptions::default());
    scheduler.schedule_save("doc2", json!(2), SaveOptions::default());
    assert_eq!(scheduler.tracked_documents(), vec!["doc1", "doc2"]);

    scheduler.destroy();
    sleep(DELAY * 2).await;

    assert!(remote.calls().is_empty());
    assert!(scheduler.tracked_documents().is_empty());
    assert!(scheduler.restore_local("doc2").is_some());
}
