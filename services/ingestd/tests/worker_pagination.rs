//! Worker loop scenarios against a scripted source and recording sink:
//!
//! 1. Pagination terminates on the last page
//! 2. External stop leaves the worker RUNNING and skips the next page
//! 3. Boundary filter keeps in-range events only
//! 4. Already-completed partitions never touch the source
//! 5. Cursor expiry (400) recovers by re-forging from last_ts

use ingest_core::cursor::{TimeChunk, decode_cursor_ts, forge_cursor};
use ingest_core::page::{IngestEvent, Page};
use ingestd::ShutdownFlag;
use ingestd::http::HttpError;
use ingestd::repo::checkpoints::{CheckpointStatus, WorkerCheckpoint};
use ingestd::source::{FetchParams, SourceError};
use ingestd::worker::{BatchSink, PageSource, WorkerContext, run_worker};
use ingestd::write_queue::{WriteBatch, WriteError};
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

const CHUNK_START: i64 = 1_768_000_000_000;
const CHUNK_END: i64 = 1_769_000_000_000;

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

enum Step {
    Page(Page),
    Fail(u16),
}

struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<FetchParams>>,
    /// Trigger this flag right after serving call index `.0`.
    stop_after_call: Option<(usize, ShutdownFlag)>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedSource {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            stop_after_call: None,
        })
    }

    fn with_stop(steps: Vec<Step>, after_call: usize, stop: ShutdownFlag) -> Arc<Self> {
        Arc::new(ScriptedSource {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            stop_after_call: Some((after_call, stop)),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    fn call_cursor(&self, index: usize) -> Option<String> {
        self.calls.lock().expect("calls lock")[index].cursor.clone()
    }
}

impl PageSource for ScriptedSource {
    fn fetch_page(
        &self,
        params: FetchParams,
    ) -> impl Future<Output = Result<Page, SourceError>> + Send {
        let step = self.steps.lock().expect("steps lock").pop_front();
        let call_index = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(params);
            calls.len() - 1
        };
        if let Some((after, stop)) = &self.stop_after_call {
            if call_index == *after {
                stop.trigger();
            }
        }
        async move {
            match step {
                Some(Step::Page(page)) => Ok(page),
                Some(Step::Fail(status)) => Err(SourceError::Http(HttpError {
                    status,
                    method: "GET",
                    url: "http://mock/events".to_owned(),
                    retry_after: None,
                    detail: String::new(),
                })),
                None => Ok(Page::empty()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<WriteBatch>>,
}

impl RecordingSink {
    fn batches(&self) -> Vec<WriteBatch> {
        self.batches.lock().expect("batches lock").clone()
    }

    /// Batches that carried events (the final checkpoint-only commit is
    /// excluded).
    fn event_batches(&self) -> Vec<WriteBatch> {
        self.batches()
            .into_iter()
            .filter(|b| !b.events.is_empty())
            .collect()
    }
}

impl BatchSink for RecordingSink {
    fn submit(&self, batch: WriteBatch) -> impl Future<Output = Result<i64, WriteError>> + Send {
        let inserted = batch.events.len() as i64;
        self.batches.lock().expect("batches lock").push(batch);
        async move { Ok(inserted) }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn event(id: &str, ts: i64) -> IngestEvent {
    IngestEvent {
        event_id: id.to_owned(),
        timestamp_ms: ts,
        payload: json!({"id": id, "timestamp": ts}),
    }
}

fn page(events: Vec<IngestEvent>, has_more: bool, next_cursor: Option<i64>) -> Page {
    Page {
        events,
        has_more,
        next_cursor: next_cursor.map(forge_cursor),
        total: None,
    }
}

fn fresh_checkpoint() -> WorkerCheckpoint {
    WorkerCheckpoint::new(
        0,
        TimeChunk {
            start_ts: CHUNK_START,
            end_ts: CHUNK_END,
        },
    )
}

fn context(
    source: &Arc<ScriptedSource>,
    sink: &Arc<RecordingSink>,
    stop: ShutdownFlag,
) -> WorkerContext<ScriptedSource, RecordingSink> {
    let progress: Arc<dyn Fn(&WorkerCheckpoint) + Send + Sync> = Arc::new(|_| {});
    WorkerContext {
        source: Arc::clone(source),
        sink: Arc::clone(sink),
        page_limit: 100,
        stop,
        progress,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pagination_terminates_on_last_page() {
    let source = ScriptedSource::new(vec![
        Step::Page(page(
            vec![
                event("e1", 1_768_500_000_000),
                event("e2", 1_768_400_000_000),
            ],
            true,
            Some(1_768_400_000_000),
        )),
        Step::Page(page(vec![event("e3", 1_768_300_000_000)], false, None)),
    ]);
    let sink = Arc::new(RecordingSink::default());

    let cp = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    assert_eq!(cp.status, CheckpointStatus::Completed);
    assert_eq!(cp.fetched_count, 3);
    assert_eq!(cp.inserted_count, 3);
    assert_eq!(source.call_count(), 2);

    // Both event batches landed, then the terminal checkpoint-only commit.
    let batches = sink.batches();
    assert_eq!(batches.len(), 3);
    assert!(batches[2].events.is_empty());
    assert_eq!(batches[2].checkpoint.status, CheckpointStatus::Completed);
}

#[tokio::test]
async fn external_stop_leaves_worker_running() {
    let stop = ShutdownFlag::new();
    let source = ScriptedSource::with_stop(
        vec![
            Step::Page(page(
                vec![event("e1", 1_768_500_000_000)],
                true,
                Some(1_768_500_000_000),
            )),
            Step::Page(page(vec![event("e2", 1_768_400_000_000)], false, None)),
        ],
        0,
        stop.clone(),
    );
    let sink = Arc::new(RecordingSink::default());

    let cp = run_worker(fresh_checkpoint(), context(&source, &sink, stop))
        .await
        .expect("worker succeeds");

    assert_eq!(cp.status, CheckpointStatus::Running);
    assert_eq!(cp.fetched_count, 1);
    // The second page was never fetched.
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn boundary_filter_excludes_out_of_range_events() {
    let source = ScriptedSource::new(vec![Step::Page(page(
        vec![
            event("in-range", 1_768_500_000_000),
            event("below-range", 1_767_000_000_000),
        ],
        true,
        Some(1_767_000_000_000),
    ))]);
    let sink = Arc::new(RecordingSink::default());

    let cp = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    // Dipping below the chunk means the partition is finished.
    assert_eq!(cp.status, CheckpointStatus::Completed);
    assert_eq!(source.call_count(), 1);

    let event_batches = sink.event_batches();
    assert_eq!(event_batches.len(), 1);
    let ids: Vec<&str> = event_batches[0]
        .events
        .iter()
        .map(|e| e.event_id.as_str())
        .collect();
    assert_eq!(ids, vec!["in-range"]);
}

#[tokio::test]
async fn boundary_event_at_chunk_end_belongs_to_neighbor() {
    let source = ScriptedSource::new(vec![Step::Page(page(
        vec![
            event("at-end", CHUNK_END),
            event("at-start", CHUNK_START),
        ],
        false,
        None,
    ))]);
    let sink = Arc::new(RecordingSink::default());

    let cp = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    assert_eq!(cp.status, CheckpointStatus::Completed);
    let event_batches = sink.event_batches();
    assert_eq!(event_batches.len(), 1);
    let ids: Vec<&str> = event_batches[0]
        .events
        .iter()
        .map(|e| e.event_id.as_str())
        .collect();
    // Exclusive upper bound, inclusive lower bound.
    assert_eq!(ids, vec!["at-start"]);
}

#[tokio::test]
async fn completed_partition_never_calls_the_source() {
    let source = ScriptedSource::new(vec![]);
    let sink = Arc::new(RecordingSink::default());
    let mut cp = fresh_checkpoint();
    cp.status = CheckpointStatus::Completed;
    cp.fetched_count = 5_000;

    let result = run_worker(cp, context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    assert_eq!(result.status, CheckpointStatus::Completed);
    assert_eq!(result.fetched_count, 5_000);
    assert_eq!(source.call_count(), 0);
    assert!(sink.batches().is_empty());
}

#[tokio::test]
async fn cursor_expiry_reforges_from_last_ts() {
    let last_ts = 1_768_400_000_000;
    let source = ScriptedSource::new(vec![
        Step::Fail(400),
        Step::Page(page(vec![event("e4", 1_768_350_000_000)], false, None)),
    ]);
    let sink = Arc::new(RecordingSink::default());

    let mut cp = fresh_checkpoint();
    cp.cursor = Some(forge_cursor(1_768_390_000_000));
    cp.last_ts = Some(last_ts);
    cp.fetched_count = 10;

    let result = run_worker(cp, context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    assert_eq!(result.status, CheckpointStatus::Completed);
    assert_eq!(result.fetched_count, 11);
    assert_eq!(source.call_count(), 2);
    // The retry entered through a cursor forged at last_ts.
    let retry_cursor = source.call_cursor(1).expect("retry cursor present");
    assert_eq!(decode_cursor_ts(&retry_cursor), Some(last_ts));
}

#[tokio::test]
async fn cursor_expiry_without_last_ts_is_fatal() {
    let source = ScriptedSource::new(vec![Step::Fail(400)]);
    let sink = Arc::new(RecordingSink::default());

    let result = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new())).await;

    assert!(result.is_err(), "no recovery point, the error propagates");
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn fresh_worker_enters_at_chunk_end() {
    let source = ScriptedSource::new(vec![Step::Page(page(vec![], false, None))]);
    let sink = Arc::new(RecordingSink::default());

    let cp = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new()))
        .await
        .expect("worker succeeds");

    assert_eq!(cp.status, CheckpointStatus::Completed);
    let first_cursor = source.call_cursor(0).expect("initial cursor forged");
    assert_eq!(decode_cursor_ts(&first_cursor), Some(CHUNK_END));
}

#[tokio::test]
async fn server_error_propagates_to_caller() {
    let source = ScriptedSource::new(vec![Step::Fail(503)]);
    let sink = Arc::new(RecordingSink::default());

    let result = run_worker(fresh_checkpoint(), context(&source, &sink, ShutdownFlag::new())).await;
    assert!(result.is_err());
    assert!(sink.batches().is_empty());
}
