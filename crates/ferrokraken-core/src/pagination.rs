//! Window-scoped pagination state machine.
//!
//! A window starts at the committed cursor and pages forward with continuation tokens.
//! Descriptors that support it fall back to `before`-anchored paging when full pages
//! arrive without a token, bounded by a fixed page cap.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::CursorState;
use crate::descriptor::ResourceDescriptor;
use crate::domain::Timestamp;
use crate::normalize::{normalize, RawRecord};
use crate::retry::FetchOutcome;
use crate::sink::{run_blocking, RecordSink};
use crate::SyncError;

pub const FALLBACK_PAGE_CAP: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PagingState {
    WindowStart,
    Paging,
    FallbackPaging,
    WindowDone,
}

/// Parameters for a single page request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub since: Option<Timestamp>,
    pub before: Option<Timestamp>,
    pub continuation_token: Option<String>,
    pub page_size: Option<usize>,
    pub filters: BTreeMap<String, String>,
}

/// Source of pages; the Kraken client in production, scripted fakes in tests.
pub trait PageFetcher: Send + Sync {
    fn fetch_page<'a>(
        &'a self,
        descriptor: &'a ResourceDescriptor,
        request: &'a PageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SyncError>> + Send + 'a>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub since: Option<Timestamp>,
    pub before: Option<Timestamp>,
    pub token: Option<String>,
    pub page_index: u32,
}

impl FetchWindow {
    pub fn start(cursor: &CursorState) -> Self {
        Self {
            since: cursor.last_timestamp,
            before: None,
            token: None,
            page_index: 0,
        }
    }

    fn page_request(&self, page_size: usize, filters: &BTreeMap<String, String>) -> PageRequest {
        PageRequest {
            since: self.since,
            before: self.before,
            continuation_token: self.token.clone(),
            page_size: Some(page_size),
            filters: filters.clone(),
        }
    }
}

/// Non-fatal conditions raised while paging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowWarning {
    PermissionDenied { message: String },
    PaginationLoopLimitExceeded { cap: u32, before: Option<Timestamp> },
    UnresolvableFallbackBoundary { page_index: u32 },
    RepeatedContinuationToken { page_index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowReport {
    pub final_state: PagingState,
    pub pages: u32,
    pub fallback_pages: u32,
    pub records_written: usize,
    pub skipped_records: usize,
    pub malformed_records: usize,
    pub max_timestamp: Option<Timestamp>,
    pub warnings: Vec<WindowWarning>,
    /// Cursor to commit when the window is accepted.
    pub next_cursor: CursorState,
}

impl WindowReport {
    fn new() -> Self {
        Self {
            final_state: PagingState::WindowStart,
            pages: 0,
            fallback_pages: 0,
            records_written: 0,
            skipped_records: 0,
            malformed_records: 0,
            max_timestamp: None,
            warnings: Vec::new(),
            next_cursor: CursorState::default(),
        }
    }
}

struct PageSummary {
    item_count: usize,
    token: Option<String>,
    min_timestamp: Option<Timestamp>,
}

pub struct PaginationEngine {
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn RecordSink>,
    page_size: Option<usize>,
    fallback_cap: u32,
}

impl PaginationEngine {
    pub fn new(fetcher: Arc<dyn PageFetcher>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            fetcher,
            sink,
            page_size: None,
            fallback_cap: FALLBACK_PAGE_CAP,
        }
    }

    /// Overrides every descriptor's default page size.
    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_fallback_cap(mut self, fallback_cap: u32) -> Self {
        self.fallback_cap = fallback_cap;
        self
    }

    fn page_size_for(&self, descriptor: &ResourceDescriptor) -> usize {
        self.page_size.unwrap_or(descriptor.default_page_size).max(1)
    }

    /// Pages through one incremental window. Records reach the sink page by page; the
    /// returned cursor is only meaningful when the whole window succeeded.
    pub async fn run_window(
        &self,
        descriptor: &ResourceDescriptor,
        cursor: &CursorState,
        filters: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<WindowReport, SyncError> {
        let page_size = self.page_size_for(descriptor);
        let mut window = FetchWindow::start(cursor);
        let mut report = WindowReport::new();
        let mut state = PagingState::WindowStart;
        debug!(resource = descriptor.name, since = ?window.since, "window start");
        transition(descriptor, &mut state, PagingState::Paging);

        loop {
            let request = window.page_request(page_size, filters);
            let outcome = self.fetch(descriptor, &request, cancel).await?;
            window.page_index += 1;
            report.pages += 1;

            let payload = match outcome {
                FetchOutcome::Payload(payload) => payload,
                FetchOutcome::PermissionDenied { message } => {
                    warn!(resource = descriptor.name, %message, "permission denied, closing window");
                    report
                        .warnings
                        .push(WindowWarning::PermissionDenied { message });
                    break;
                }
            };

            let page = self.ingest_page(descriptor, &payload, &mut report).await?;
            debug!(
                resource = descriptor.name,
                page = window.page_index,
                records = page.item_count,
                "page ingested"
            );

            if let Some(token) = page.token {
                if window.token.as_deref() == Some(token.as_str()) {
                    warn!(
                        resource = descriptor.name,
                        page = window.page_index,
                        "server repeated the continuation token, closing window"
                    );
                    report.warnings.push(WindowWarning::RepeatedContinuationToken {
                        page_index: window.page_index,
                    });
                    break;
                }
                window.token = Some(token);
                transition(descriptor, &mut state, PagingState::Paging);
                continue;
            }
            window.token = None;

            if !descriptor.supports_fallback_paging || page.item_count < page_size {
                break;
            }
            let Some(earliest) = page.min_timestamp else {
                warn!(
                    resource = descriptor.name,
                    page = window.page_index,
                    "full page without resolvable timestamps, cannot continue backfill"
                );
                report.warnings.push(WindowWarning::UnresolvableFallbackBoundary {
                    page_index: window.page_index,
                });
                break;
            };
            if window.since.is_some_and(|since| earliest <= since) {
                info!(resource = descriptor.name, %earliest, "backfill reached window start");
                break;
            }
            if report.fallback_pages >= self.fallback_cap {
                warn!(
                    resource = descriptor.name,
                    cap = self.fallback_cap,
                    "fallback page cap reached, closing window"
                );
                report
                    .warnings
                    .push(WindowWarning::PaginationLoopLimitExceeded {
                        cap: self.fallback_cap,
                        before: window.before,
                    });
                break;
            }

            window.before = Some(earliest);
            report.fallback_pages += 1;
            transition(descriptor, &mut state, PagingState::FallbackPaging);
        }

        transition(descriptor, &mut state, PagingState::WindowDone);
        report.final_state = state;
        report.next_cursor =
            CursorState::committed(report.max_timestamp.max(cursor.last_timestamp));
        info!(
            resource = descriptor.name,
            pages = report.pages,
            records = report.records_written,
            skipped = report.skipped_records,
            malformed = report.malformed_records,
            "window done"
        );
        Ok(report)
    }

    /// Fetches a snapshot resource once and replaces the stored copy.
    ///
    /// A permission denial leaves the stored snapshot untouched.
    pub async fn fetch_snapshot(
        &self,
        descriptor: &ResourceDescriptor,
        filters: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<WindowReport, SyncError> {
        let mut report = WindowReport::new();
        let request = PageRequest {
            filters: filters.clone(),
            ..PageRequest::default()
        };
        let outcome = self.fetch(descriptor, &request, cancel).await?;
        report.pages = 1;

        match outcome {
            FetchOutcome::Payload(payload) => {
                let records = self.normalize_page(descriptor, &payload, &mut report);
                let sink = Arc::clone(&self.sink);
                let target = descriptor.clone();
                let written = run_blocking(move || sink.replace(&target, &records))
                    .await
                    .map_err(|error| sink_error(descriptor, error.message()))?;
                report.records_written = written;
                info!(resource = descriptor.name, records = written, "snapshot replaced");
            }
            FetchOutcome::PermissionDenied { message } => {
                warn!(resource = descriptor.name, %message, "permission denied, snapshot kept");
                report
                    .warnings
                    .push(WindowWarning::PermissionDenied { message });
            }
        }

        report.final_state = PagingState::WindowDone;
        Ok(report)
    }

    async fn fetch(
        &self,
        descriptor: &ResourceDescriptor,
        request: &PageRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, SyncError> {
        let cancelled = || SyncError::Cancelled {
            resource: descriptor.name.to_owned(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            outcome = self.fetcher.fetch_page(descriptor, request) => outcome,
        }
    }

    async fn ingest_page(
        &self,
        descriptor: &ResourceDescriptor,
        payload: &Value,
        report: &mut WindowReport,
    ) -> Result<PageSummary, SyncError> {
        let item_count = descriptor.envelope(payload).map_or(0, <[Value]>::len);
        let records = self.normalize_page(descriptor, payload, report);
        let min_timestamp = records.iter().filter_map(|record| record.timestamp).min();

        if !records.is_empty() {
            let sink = Arc::clone(&self.sink);
            let target = descriptor.clone();
            let written = run_blocking(move || sink.append(&target, &records))
                .await
                .map_err(|error| sink_error(descriptor, error.message()))?;
            report.records_written += written;
        }

        Ok(PageSummary {
            item_count,
            token: descriptor.continuation_token(payload),
            min_timestamp,
        })
    }

    fn normalize_page(
        &self,
        descriptor: &ResourceDescriptor,
        payload: &Value,
        report: &mut WindowReport,
    ) -> Vec<RawRecord> {
        let items = descriptor.envelope(payload).unwrap_or_default();
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match normalize(item, descriptor) {
                Ok(record) => {
                    if record.timestamp > report.max_timestamp && descriptor.is_incremental() {
                        report.max_timestamp = record.timestamp;
                    }
                    records.push(record);
                }
                Err(defect) if defect.is_malformed() => {
                    debug!(resource = descriptor.name, %defect, "dropping malformed record");
                    report.malformed_records += 1;
                }
                Err(defect) => {
                    debug!(resource = descriptor.name, %defect, "skipping record");
                    report.skipped_records += 1;
                }
            }
        }
        records
    }
}

impl std::fmt::Debug for PaginationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationEngine")
            .field("page_size", &self.page_size)
            .field("fallback_cap", &self.fallback_cap)
            .finish_non_exhaustive()
    }
}

fn transition(descriptor: &ResourceDescriptor, state: &mut PagingState, next: PagingState) {
    if *state != next {
        debug!(resource = descriptor.name, from = ?*state, to = ?next, "paging state");
    }
    *state = next;
}

fn sink_error(descriptor: &ResourceDescriptor, message: &str) -> SyncError {
    SyncError::Sink {
        resource: descriptor.name.to_owned(),
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::descriptor::{ACCOUNT_LOG, EXECUTIONS, TICKERS};
    use crate::sink::MemorySink;

    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<FetchOutcome, SyncError>>>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<FetchOutcome, SyncError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<PageRequest> {
            self.requests.lock().expect("mutex poisoned").clone()
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch_page<'a>(
            &'a self,
            _descriptor: &'a ResourceDescriptor,
            request: &'a PageRequest,
        ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SyncError>> + Send + 'a>> {
            self.requests.lock().expect("mutex poisoned").push(request.clone());
            let next = self
                .pages
                .lock()
                .expect("mutex poisoned")
                .pop_front()
                .unwrap_or_else(|| Ok(FetchOutcome::Payload(json!({}))));
            Box::pin(async move { next })
        }
    }

    /// Accepts the request and never answers.
    #[derive(Default)]
    struct HangingFetcher {
        calls: Mutex<u32>,
    }

    impl PageFetcher for HangingFetcher {
        fn fetch_page<'a>(
            &'a self,
            _descriptor: &'a ResourceDescriptor,
            _request: &'a PageRequest,
        ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SyncError>> + Send + 'a>> {
            *self.calls.lock().expect("mutex poisoned") += 1;
            Box::pin(std::future::pending())
        }
    }

    fn engine(fetcher: Arc<ScriptedFetcher>, sink: Arc<MemorySink>) -> PaginationEngine {
        PaginationEngine::new(fetcher, sink)
    }

    #[tokio::test]
    async fn when_token_is_present_engine_keeps_paging_with_same_since() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(FetchOutcome::Payload(json!({
                "elements": [{"uid": "a", "timestamp": 2_000}],
                "continuationToken": "t1"
            }))),
            Ok(FetchOutcome::Payload(json!({
                "elements": [{"uid": "b", "timestamp": 3_000}]
            }))),
        ]));
        let sink = Arc::new(MemorySink::new());
        let cursor = CursorState::committed(Some(Timestamp::from_millis(1_000_000)));

        let report = engine(fetcher.clone(), sink.clone())
            .run_window(&EXECUTIONS, &cursor, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].continuation_token.as_deref(), Some("t1"));
        assert_eq!(requests[1].since, requests[0].since);
        assert_eq!(report.final_state, PagingState::WindowDone);
        assert_eq!(report.records_written, 2);
        assert_eq!(report.next_cursor.continuation_token, None);
        assert_eq!(report.next_cursor.last_timestamp, Some(Timestamp::from_millis(3_000_000)));
    }

    #[tokio::test]
    async fn empty_first_page_keeps_prior_timestamp() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::Payload(
            json!({"elements": []}),
        ))]));
        let cursor = CursorState::committed(Some(Timestamp::from_millis(5)));

        let report = engine(fetcher, Arc::new(MemorySink::new()))
            .run_window(&EXECUTIONS, &cursor, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        assert_eq!(report.pages, 1);
        assert_eq!(report.next_cursor, CursorState::committed(Some(Timestamp::from_millis(5))));
    }

    #[tokio::test]
    async fn short_fallback_page_ends_the_window() {
        let full_page: Vec<_> = (0..3)
            .map(|i| json!({"booking_uid": format!("b{i}"), "timestamp": 1_700_000_000_000_i64 + i}))
            .collect();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(FetchOutcome::Payload(json!({"logs": full_page}))),
            Ok(FetchOutcome::Payload(json!({"logs": [
                {"booking_uid": "old", "timestamp": 1_600_000_000_000_i64}
            ]}))),
        ]));

        let report = engine(fetcher.clone(), Arc::new(MemorySink::new()))
            .with_page_size(Some(3))
            .run_window(&ACCOUNT_LOG, &CursorState::default(), &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].before, Some(Timestamp::from_millis(1_700_000_000_000)));
        assert_eq!(report.fallback_pages, 1);
        assert_eq!(report.records_written, 4);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn fallback_stops_once_page_reaches_since() {
        let page: Vec<_> = (0..2)
            .map(|i| json!({"booking_uid": format!("b{i}"), "timestamp": 1_000 + i}))
            .collect();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::Payload(
            json!({"logs": page}),
        ))]));
        let cursor = CursorState::committed(Some(Timestamp::from_millis(1_000_000)));

        let report = engine(fetcher.clone(), Arc::new(MemorySink::new()))
            .with_page_size(Some(2))
            .run_window(&ACCOUNT_LOG, &cursor, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(report.fallback_pages, 0);
    }

    #[tokio::test]
    async fn permission_denial_closes_window_with_warning() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::PermissionDenied {
            message: String::from("no permission"),
        })]));
        let cursor = CursorState::committed(Some(Timestamp::from_millis(9)));

        let report = engine(fetcher, Arc::new(MemorySink::new()))
            .run_window(&EXECUTIONS, &cursor, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("non-fatal");

        assert_eq!(
            report.warnings,
            vec![WindowWarning::PermissionDenied {
                message: String::from("no permission")
            }]
        );
        assert_eq!(report.next_cursor.last_timestamp, Some(Timestamp::from_millis(9)));
    }

    #[tokio::test]
    async fn defects_are_counted_and_do_not_move_the_cursor() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(FetchOutcome::Payload(json!({
            "elements": [
                {"uid": "ok", "timestamp": 1_700_000_000_000_i64},
                {"uid": "no-time"},
                {"timestamp": 1_800_000_000_000_i64},
                "not an object"
            ]
        })))]));

        let report = engine(fetcher, Arc::new(MemorySink::new()))
            .run_window(&EXECUTIONS, &CursorState::default(), &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        assert_eq!(report.records_written, 1);
        assert_eq!(report.skipped_records, 1);
        assert_eq!(report.malformed_records, 2);
        assert_eq!(
            report.next_cursor.last_timestamp,
            Some(Timestamp::from_millis(1_700_000_000_000))
        );
    }

    #[tokio::test]
    async fn repeated_token_closes_the_window() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(FetchOutcome::Payload(json!({
                "elements": [{"uid": "a", "timestamp": 2_000}],
                "continuationToken": "stuck"
            }))),
            Ok(FetchOutcome::Payload(json!({
                "elements": [],
                "continuationToken": "stuck"
            }))),
            Ok(FetchOutcome::Payload(json!({
                "elements": [],
                "continuationToken": "stuck"
            }))),
        ]));

        let report = engine(fetcher.clone(), Arc::new(MemorySink::new()))
            .run_window(&EXECUTIONS, &CursorState::default(), &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("window");

        assert_eq!(fetcher.requests().len(), 2);
        assert_eq!(
            report.warnings,
            vec![WindowWarning::RepeatedContinuationToken { page_index: 2 }]
        );
        assert_eq!(report.records_written, 1);
        assert_eq!(report.final_state, PagingState::WindowDone);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_request() {
        let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(fetcher.clone(), Arc::new(MemorySink::new()))
            .run_window(&EXECUTIONS, &CursorState::default(), &BTreeMap::new(), &cancel)
            .await
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_request_in_flight() {
        let fetcher = Arc::new(HangingFetcher::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            PaginationEngine::new(fetcher.clone(), Arc::new(MemorySink::new())).run_window(
                &EXECUTIONS,
                &CursorState::default(),
                &BTreeMap::new(),
                &cancel,
            ),
        )
        .await
        .expect("cancellation should end the window");

        assert!(result.expect_err("cancelled").is_cancelled());
        assert_eq!(*fetcher.calls.lock().expect("mutex poisoned"), 1);
    }

    #[tokio::test]
    async fn snapshot_replaces_and_keeps_data_on_permission_denial() {
        let sink = Arc::new(MemorySink::new());
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(FetchOutcome::Payload(json!({"tickers": [{"symbol": "A"}, {"symbol": "B"}]}))),
            Ok(FetchOutcome::PermissionDenied {
                message: String::from("permission"),
            }),
        ]));
        let engine = engine(fetcher, sink.clone());

        let first = engine
            .fetch_snapshot(&TICKERS, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("snapshot");
        let second = engine
            .fetch_snapshot(&TICKERS, &BTreeMap::new(), &CancellationToken::new())
            .await
            .expect("snapshot");

        assert_eq!(first.records_written, 2);
        assert_eq!(second.warnings.len(), 1);
        assert_eq!(sink.len("tickers"), 2);
    }
}
