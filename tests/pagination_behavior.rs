//! Behavior-driven tests for window pagination
//!
//! These tests drive the pagination engine with scripted pages and check what ends up in
//! the sink and in the cursor that would be committed.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ferrokraken_core::{
    CursorState, FetchOutcome, MemorySink, PageFetcher, PageRequest, PaginationEngine,
    PagingState, ResourceDescriptor, SyncError, Timestamp, WindowWarning, ACCOUNT_LOG,
    EXECUTIONS,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const BASE_MS: i64 = 1_700_000_000_000;

struct ScriptedFetcher {
    pages: Mutex<VecDeque<Value>>,
    requests: Mutex<Vec<PageRequest>>,
    endless: Option<Box<dyn Fn(usize) -> Value + Send + Sync>>,
}

impl ScriptedFetcher {
    fn pages(pages: Vec<Value>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            requests: Mutex::new(Vec::new()),
            endless: None,
        }
    }

    fn endless(page: impl Fn(usize) -> Value + Send + Sync + 'static) -> Self {
        Self {
            pages: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            endless: Some(Box::new(page)),
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
        let index = {
            let mut requests = self.requests.lock().expect("mutex poisoned");
            requests.push(request.clone());
            requests.len() - 1
        };
        let page = match &self.endless {
            Some(page) => page(index),
            None => self
                .pages
                .lock()
                .expect("mutex poisoned")
                .pop_front()
                .unwrap_or_else(|| json!({})),
        };
        Box::pin(async move { Ok(FetchOutcome::Payload(page)) })
    }
}

fn executions_page(start: usize, len: usize, token: Option<&str>) -> Value {
    let elements: Vec<Value> = (start..start + len)
        .map(|i| json!({"uid": format!("exec-{i}"), "timestamp": BASE_MS + i as i64}))
        .collect();
    match token {
        Some(token) => json!({"elements": elements, "continuationToken": token}),
        None => json!({"elements": elements}),
    }
}

// =============================================================================
// Token pagination
// =============================================================================

#[tokio::test]
async fn token_pages_are_followed_until_the_token_disappears() {
    // Given: three pages of 500, 500 and 100 executions, the first two carrying tokens
    let fetcher = Arc::new(ScriptedFetcher::pages(vec![
        executions_page(0, 500, Some("page-2")),
        executions_page(500, 500, Some("page-3")),
        executions_page(1_000, 100, None),
    ]));
    let sink = Arc::new(MemorySink::new());
    let engine = PaginationEngine::new(fetcher.clone(), sink.clone());

    // When: the window runs from an empty cursor
    let report = engine
        .run_window(
            &EXECUTIONS,
            &CursorState::default(),
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("window should complete");

    // Then: every record is written and the window closes cleanly
    assert_eq!(report.records_written, 1_100);
    assert_eq!(sink.len("executions"), 1_100);
    assert_eq!(report.final_state, PagingState::WindowDone);
    assert_eq!(report.pages, 3);

    // And: the cursor carries no token and the newest timestamp seen
    assert_eq!(report.next_cursor.continuation_token, None);
    assert_eq!(report.next_cursor.fallback_page_count, 0);
    assert_eq!(
        report.next_cursor.last_timestamp,
        Some(Timestamp::from_millis(BASE_MS + 1_099))
    );

    // And: tokens were passed back verbatim with the default page size
    let requests = fetcher.requests();
    assert_eq!(requests[0].continuation_token, None);
    assert_eq!(requests[1].continuation_token.as_deref(), Some("page-2"));
    assert_eq!(requests[2].continuation_token.as_deref(), Some("page-3"));
    assert!(requests.iter().all(|request| request.page_size == Some(500)));
}

#[tokio::test]
async fn refetching_the_same_window_does_not_duplicate_records() {
    // Given: a sink that already holds one fetch of a window
    let sink = Arc::new(MemorySink::new());
    for _ in 0..2 {
        let fetcher = Arc::new(ScriptedFetcher::pages(vec![
            executions_page(0, 300, Some("next")),
            executions_page(300, 200, None),
        ]));
        let engine = PaginationEngine::new(fetcher, sink.clone());

        // When: the same window is fetched again
        engine
            .run_window(
                &EXECUTIONS,
                &CursorState::default(),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await
            .expect("window should complete");
    }

    // Then: the merged cardinality equals a single fetch
    assert_eq!(sink.len("executions"), 500);
}

// =============================================================================
// Fallback pagination
// =============================================================================

#[tokio::test]
async fn endless_full_pages_stop_at_the_fallback_cap_with_a_warning() {
    // Given: an account log that keeps returning full pages without a token
    let page_size = 10;
    let fetcher = Arc::new(ScriptedFetcher::endless(move |index| {
        let newest = BASE_MS - (index as i64) * 1_000;
        let logs: Vec<Value> = (0..page_size)
            .map(|i| {
                json!({
                    "booking_uid": format!("booking-{index}-{i}"),
                    "date": newest - i as i64,
                })
            })
            .collect();
        json!({"logs": logs})
    }));
    let engine = PaginationEngine::new(fetcher.clone(), Arc::new(MemorySink::new()))
        .with_page_size(Some(page_size));

    // When: the window runs
    let report = engine
        .run_window(
            &ACCOUNT_LOG,
            &CursorState::default(),
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("cap is a warning, not a failure");

    // Then: exactly fifty fallback pages follow the first request
    assert_eq!(report.fallback_pages, 50);
    assert_eq!(fetcher.requests().len(), 51);
    assert_eq!(report.final_state, PagingState::WindowDone);

    // And: the loop limit is reported as a warning
    assert!(matches!(
        report.warnings.as_slice(),
        [WindowWarning::PaginationLoopLimitExceeded { cap: 50, .. }]
    ));

    // And: each fallback request is anchored on the previous page's earliest timestamp
    let requests = fetcher.requests();
    assert_eq!(requests[0].before, None);
    assert_eq!(
        requests[1].before,
        Some(Timestamp::from_millis(BASE_MS - (page_size as i64 - 1)))
    );
    assert!(requests.iter().all(|request| request.continuation_token.is_none()));
}

#[tokio::test]
async fn token_is_preferred_over_fallback_paging() {
    // Given: a full account log page that also carries a continuation token
    let logs: Vec<Value> = (0..2)
        .map(|i| json!({"booking_uid": format!("b{i}"), "timestamp": BASE_MS + i}))
        .collect();
    let fetcher = Arc::new(ScriptedFetcher::pages(vec![
        json!({"logs": logs, "continuation_token": "more"}),
        json!({"logs": []}),
    ]));
    let engine = PaginationEngine::new(fetcher.clone(), Arc::new(MemorySink::new()))
        .with_page_size(Some(2));

    // When: the window runs
    let report = engine
        .run_window(
            &ACCOUNT_LOG,
            &CursorState::default(),
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("window should complete");

    // Then: the token drives the next request and no fallback page is used
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].continuation_token.as_deref(), Some("more"));
    assert_eq!(requests[1].before, None);
    assert_eq!(report.fallback_pages, 0);
}
