//! Run controller lifecycle: scheduling, cancellation surface, terminal
//! states, and final-report guarantees, driven through mock collaborators.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tg_fanout::cancel::CancelFlag;
use tg_fanout::controller::{RunController, RunStatus, SubmitError};
use tg_fanout::dispatcher::DispatchTiming;
use tg_fanout::job::{Recipient, RunSpec};
use tg_fanout::report::{ChatReportSink, ReportError};
use tg_fanout::source::{RecipientSource, SourceError};
use tg_fanout::state::MemoryStateStore;
use tg_fanout::transport::{SendError, SendOptions, Transport};

fn base_spec() -> RunSpec {
    RunSpec {
        message_text: "promo".to_string(),
        image_url: None,
        buttons: Vec::new(),
        estimated_user_count: None,
        report_chat_id: None,
        webhook_url: None,
        report_interval_minutes: 1,
        test_recipients: None,
    }
}

fn recipients(range: std::ops::RangeInclusive<i64>) -> Vec<Recipient> {
    range.map(|k| Recipient { key: k, chat_id: k }).collect()
}

/// Transport whose sends block until the test opens the gate
struct GatedTransport {
    attempts: Mutex<Vec<i64>>,
    gate: tokio::sync::watch::Receiver<bool>,
}

impl GatedTransport {
    fn new() -> (Arc<Self>, tokio::sync::watch::Sender<bool>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                gate: rx,
            }),
            tx,
        )
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("attempts lock").len()
    }

    async fn record(&self, chat_id: i64) -> Result<(), SendError> {
        self.attempts.lock().expect("attempts lock").push(chat_id);
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        _text: &str,
        _opts: &SendOptions,
    ) -> Result<(), SendError> {
        self.record(chat_id).await
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        _image_url: &str,
        _caption: &str,
        _opts: &SendOptions,
    ) -> Result<(), SendError> {
        self.record(chat_id).await
    }
}

/// Transport that always succeeds instantly
struct OkTransport {
    attempts: Mutex<Vec<i64>>,
}

impl OkTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("attempts lock").len()
    }
}

#[async_trait]
impl Transport for OkTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        _text: &str,
        _opts: &SendOptions,
    ) -> Result<(), SendError> {
        self.attempts.lock().expect("attempts lock").push(chat_id);
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        _image_url: &str,
        _caption: &str,
        _opts: &SendOptions,
    ) -> Result<(), SendError> {
        self.attempts.lock().expect("attempts lock").push(chat_id);
        Ok(())
    }
}

/// Chat sink recording sends and in-place edits
struct RecordingChatSink {
    sends: Mutex<Vec<String>>,
    edits: Mutex<Vec<(i32, String)>>,
}

impl RecordingChatSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChatReportSink for RecordingChatSink {
    async fn send_report(&self, _chat_id: i64, text: &str) -> Result<i32, ReportError> {
        self.sends.lock().expect("sends lock").push(text.to_string());
        Ok(555)
    }

    async fn edit_report(
        &self,
        _chat_id: i64,
        message_id: i32,
        text: &str,
    ) -> Result<(), ReportError> {
        self.edits
            .lock()
            .expect("edits lock")
            .push((message_id, text.to_string()));
        Ok(())
    }
}

/// Keyset source over recipients `1..=total`
struct KeyedSource {
    total: i64,
    fail_after: Option<i64>,
}

#[async_trait]
impl RecipientSource for KeyedSource {
    async fn fetch_page(
        &self,
        after_key: i64,
        limit: usize,
    ) -> Result<Vec<Recipient>, SourceError> {
        if let Some(boundary) = self.fail_after {
            if after_key >= boundary {
                return Err(SourceError::Malformed("scripted failure".to_string()));
            }
        }
        Ok(((after_key + 1)..=self.total)
            .take(limit)
            .map(|k| Recipient { key: k, chat_id: k })
            .collect())
    }
}

fn controller(
    store: Arc<MemoryStateStore>,
    transport: Arc<dyn Transport>,
    chat_sink: Arc<dyn ChatReportSink>,
    source: Arc<dyn RecipientSource>,
) -> RunController {
    RunController::new(store, transport, chat_sink, source, DispatchTiming::default())
}

#[tokio::test(start_paused = true)]
async fn immediate_run_completes_with_one_final_report() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.test_recipients = Some(recipients(1..=3));
    spec.report_chat_id = Some(7);

    let ctrl = controller(
        store,
        transport.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );
    let receipt = ctrl.submit(spec, None).await.expect("submit");
    ctrl.wait(&receipt.run_id).await;

    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Completed));
    assert_eq!(transport.attempt_count(), 3);

    // one sub-batch, well under the report interval: exactly the final report
    let sends = sink.sends.lock().expect("sends lock");
    assert_eq!(sends.len(), 1);
    assert!(sends[0].contains("- Messages sent: 3"));
    assert!(sink.edits.lock().expect("edits lock").is_empty());
}

#[tokio::test(start_paused = true)]
async fn long_run_reports_periodically_and_edits_in_place() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.report_chat_id = Some(7);
    spec.estimated_user_count = Some(2000);

    // 4 pages of pacing adds up to more than one report interval
    let ctrl = controller(
        store,
        transport.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 2000,
            fail_after: None,
        }),
    );
    let receipt = ctrl.submit(spec, None).await.expect("submit");
    ctrl.wait(&receipt.run_id).await;

    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Completed));
    assert_eq!(sink.sends.lock().expect("sends lock").len(), 1);
    let edits = sink.edits.lock().expect("edits lock");
    // the periodic tick created the message; everything after edits it
    assert!(!edits.is_empty(), "expected in-place edits after the first send");
    assert!(edits.iter().all(|(id, _)| *id == 555));
    let last = &edits[edits.len() - 1].1;
    assert!(last.contains("- Messages sent: 2000"));
    assert!(last.contains("- Progress: 100.00%"));
}

#[tokio::test]
async fn scheduled_run_is_removed_by_cancel_before_start() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.test_recipients = Some(recipients(1..=3));

    let ctrl = controller(
        store,
        transport.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );
    let receipt = ctrl
        .submit(spec, Some(Duration::from_secs(60)))
        .await
        .expect("submit");
    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Scheduled));

    ctrl.cancel(&receipt.run_id).await.expect("cancel");
    ctrl.wait(&receipt.run_id).await;

    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Cancelled));
    assert_eq!(transport.attempt_count(), 0);
    // the run never entered the loop, so no report was produced
    assert!(sink.sends.lock().expect("sends lock").is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_scheduled_run_also_writes_the_durable_flag() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.test_recipients = Some(recipients(1..=3));

    let ctrl = controller(
        Arc::clone(&store),
        transport.clone(),
        sink,
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );
    let receipt = ctrl
        .submit(spec, Some(Duration::from_secs(60)))
        .await
        .expect("submit");
    ctrl.cancel(&receipt.run_id).await.expect("cancel");

    // the flag backs up the abort token, so a cancel survives even when
    // the token fires too late to matter
    let flag = CancelFlag::new(store);
    assert!(flag.is_cancelled(&receipt.run_id).await.expect("flag read"));

    ctrl.wait(&receipt.run_id).await;
    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Cancelled));
    assert_eq!(transport.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn flag_only_cancel_at_the_start_boundary_stops_the_run() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.test_recipients = Some(recipients(1..=3));
    spec.report_chat_id = Some(7);

    let ctrl = controller(
        Arc::clone(&store),
        transport.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );
    let receipt = ctrl
        .submit(spec, Some(Duration::from_secs(60)))
        .await
        .expect("submit");

    // only the durable flag is set, as if the abort token had fired just
    // after the start delay elapsed
    CancelFlag::new(store.clone())
        .cancel(&receipt.run_id)
        .await
        .expect("flag write");

    ctrl.wait(&receipt.run_id).await;
    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Cancelled));
    assert_eq!(transport.attempt_count(), 0);
    // the run never entered the dispatch loop, so no report was produced
    assert!(sink.sends.lock().expect("sends lock").is_empty());
}

#[tokio::test]
async fn cancel_all_removes_scheduled_runs_but_not_running_ones() {
    let store = Arc::new(MemoryStateStore::new());
    let (gated, gate) = GatedTransport::new();
    let sink = RecordingChatSink::new();

    let mut running_spec = base_spec();
    running_spec.test_recipients = Some(recipients(1..=1));
    let mut scheduled_spec = base_spec();
    scheduled_spec.test_recipients = Some(recipients(1..=1));

    let ctrl = controller(
        store,
        gated.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );

    let running = ctrl.submit(running_spec, None).await.expect("submit");
    let first = ctrl
        .submit(scheduled_spec.clone(), Some(Duration::from_secs(60)))
        .await
        .expect("submit");
    let second = ctrl
        .submit(scheduled_spec, Some(Duration::from_secs(120)))
        .await
        .expect("submit");

    // let the running run block inside its first send
    while gated.attempt_count() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ctrl.cancel("all").await.expect("cancel all");
    ctrl.wait(&first.run_id).await;
    ctrl.wait(&second.run_id).await;

    assert_eq!(ctrl.status(&first.run_id).await, Some(RunStatus::Cancelled));
    assert_eq!(ctrl.status(&second.run_id).await, Some(RunStatus::Cancelled));
    assert_eq!(ctrl.status(&running.run_id).await, Some(RunStatus::Running));

    // released, the running run finishes normally
    gate.send(true).expect("open gate");
    ctrl.wait(&running.run_id).await;
    assert_eq!(ctrl.status(&running.run_id).await, Some(RunStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn source_failure_ends_as_failed_with_partial_progress_reported() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.report_chat_id = Some(7);

    // first page succeeds, the second fetch blows up
    let ctrl = controller(
        store,
        transport.clone(),
        sink.clone(),
        Arc::new(KeyedSource {
            total: 2000,
            fail_after: Some(500),
        }),
    );
    let receipt = ctrl.submit(spec, None).await.expect("submit");
    ctrl.wait(&receipt.run_id).await;

    assert_eq!(ctrl.status(&receipt.run_id).await, Some(RunStatus::Failed));
    assert_eq!(transport.attempt_count(), 500);
    let sends = sink.sends.lock().expect("sends lock");
    assert_eq!(sends.len(), 1);
    assert!(sends[0].contains("- Messages sent: 500"));
}

#[tokio::test]
async fn invalid_spec_is_rejected_at_submission() {
    let store = Arc::new(MemoryStateStore::new());
    let transport = OkTransport::new();
    let sink = RecordingChatSink::new();
    let mut spec = base_spec();
    spec.message_text = "  ".to_string();

    let ctrl = controller(
        store,
        transport,
        sink,
        Arc::new(KeyedSource {
            total: 0,
            fail_after: None,
        }),
    );
    let result = ctrl.submit(spec, None).await;
    assert!(matches!(result, Err(SubmitError::Validation(_))));
}
