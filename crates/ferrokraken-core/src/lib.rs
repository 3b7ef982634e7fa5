//! Core sync engine for ferrokraken.
//!
//! This crate contains:
//! - Request signing and the Kraken Futures REST client
//! - Retry classification, backoff, and the aggregate rate gate
//! - Resource descriptors, record normalization, and the pagination state machine
//! - Cursor/sink contracts with in-memory implementations
//! - The orchestrator that runs resources concurrently and commits cursors

pub mod auth;
pub mod client;
pub mod config;
pub mod cursor;
pub mod descriptor;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod normalize;
pub mod orchestrator;
pub mod pagination;
pub mod retry;
pub mod sink;
pub mod throttling;

pub use auth::{signing_path, AuthHeaders, Credentials, NonceGenerator, Signer};
pub use client::{canonical_query, query_params, KrakenFuturesClient, DEFAULT_BASE_URL};
pub use config::{credentials_from_env, parse_filter, SyncConfig, DEFAULT_MAX_CONCURRENT_RESOURCES};
pub use cursor::{CursorState, CursorStore, MemoryCursorStore};
pub use descriptor::{
    QueryParamNames, RecordShape, ResourceCatalog, ResourceDescriptor, WriteDisposition,
    ACCOUNT_LOG, DEFAULT_PAGE_SIZE, EXECUTIONS, OPEN_POSITIONS, POSITION_HISTORY, TICKERS,
};
pub use domain::Timestamp;
pub use error::{StoreError, SyncError, ValidationError};
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use normalize::{canonical_json, normalize, NaturalKey, RawRecord, RecordDefect};
pub use orchestrator::{Orchestrator, ResourceReport, ResourceStatus, SyncReport};
pub use pagination::{
    FetchWindow, PageFetcher, PageRequest, PagingState, PaginationEngine, WindowReport,
    WindowWarning, FALLBACK_PAGE_CAP,
};
pub use retry::{Backoff, FetchOutcome, RetryConfig, RetryPolicy, Sleeper, TokioSleeper};
pub use sink::{MemorySink, RecordSink};
pub use throttling::RateGate;
