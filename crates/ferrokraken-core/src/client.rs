use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::auth::Signer;
use crate::config::SyncConfig;
use crate::descriptor::ResourceDescriptor;
use crate::http_client::{HttpClient, HttpRequest, DEFAULT_TIMEOUT_MS};
use crate::pagination::{PageFetcher, PageRequest};
use crate::retry::{FetchOutcome, RetryPolicy};
use crate::throttling::RateGate;
use crate::SyncError;

pub const DEFAULT_BASE_URL: &str = "https://futures.kraken.com";

/// Kraken Futures REST client: query building, signing, throttling, and retries.
pub struct KrakenFuturesClient {
    base_url: String,
    http: Arc<dyn HttpClient>,
    signer: Option<Arc<Signer>>,
    retry: RetryPolicy,
    rate_gate: RateGate,
    timeout_ms: u64,
}

impl KrakenFuturesClient {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            http,
            signer: None,
            retry: RetryPolicy::default(),
            rate_gate: RateGate::unlimited(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Client wired with the run's base URL, timeout, retry policy, and rate gate.
    pub fn from_config(
        config: &SyncConfig,
        http: Arc<dyn HttpClient>,
        signer: Option<Arc<Signer>>,
    ) -> Self {
        let client = Self::new(http)
            .with_base_url(config.base_url.clone())
            .with_timeout_ms(config.request_timeout_ms)
            .with_retry_policy(RetryPolicy::new(config.retry))
            .with_rate_gate(RateGate::per_second(config.requests_per_second));
        match signer {
            Some(signer) => client.with_signer(signer),
            None => client,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_signer(mut self, signer: Arc<Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_gate(mut self, rate_gate: RateGate) -> Self {
        self.rate_gate = rate_gate;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Fetches one page. Private endpoints are signed freshly for every attempt.
    pub async fn get(
        &self,
        descriptor: &ResourceDescriptor,
        request: &PageRequest,
    ) -> Result<FetchOutcome, SyncError> {
        let signer = match (descriptor.private, &self.signer) {
            (true, None) => {
                return Err(SyncError::MissingCredentials {
                    resource: descriptor.name.to_owned(),
                })
            }
            (true, Some(signer)) => Some(Arc::clone(signer)),
            (false, _) => None,
        };

        let query = canonical_query(&query_params(descriptor, request));
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, descriptor.path)
        } else {
            format!("{}{}?{}", self.base_url, descriptor.path, query)
        };
        debug!(resource = descriptor.name, path = descriptor.path, "fetching page");

        self.retry
            .execute(descriptor.path, || {
                let mut http_request = HttpRequest::get(url.clone()).with_timeout_ms(self.timeout_ms);
                if let Some(signer) = &signer {
                    http_request = http_request.with_auth(&signer.sign(&query, descriptor.path));
                }
                let http = Arc::clone(&self.http);
                let rate_gate = self.rate_gate.clone();
                async move {
                    rate_gate.acquire().await;
                    http.execute(http_request).await
                }
            })
            .await
    }
}

impl PageFetcher for KrakenFuturesClient {
    fn fetch_page<'a>(
        &'a self,
        descriptor: &'a ResourceDescriptor,
        request: &'a PageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SyncError>> + Send + 'a>> {
        Box::pin(self.get(descriptor, request))
    }
}

impl std::fmt::Debug for KrakenFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenFuturesClient")
            .field("base_url", &self.base_url)
            .field("signed", &self.signer.is_some())
            .field("rate_gate", &self.rate_gate)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Query parameters for a page request, sorted by name. Filters the descriptor does not
/// accept are dropped.
pub fn query_params(descriptor: &ResourceDescriptor, request: &PageRequest) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (name, value) in &request.filters {
        if descriptor.accepts_filter(name) {
            params.insert(name.clone(), value.clone());
        }
    }

    let names = descriptor.params;
    if let (Some(name), Some(since)) = (names.since, request.since) {
        params.insert(name.to_owned(), since.as_millis().to_string());
    }
    if let (Some(name), Some(before)) = (names.before, request.before) {
        params.insert(name.to_owned(), before.as_millis().to_string());
    }
    if let (Some(name), Some(token)) = (names.continuation_token, &request.continuation_token) {
        params.insert(name.to_owned(), token.clone());
    }
    if let (Some(name), Some(page_size)) = (names.page_size, request.page_size) {
        params.insert(name.to_owned(), page_size.to_string());
    }
    params
}

/// `k=v` pairs, URL-encoded and joined with `&`, in map order. Also the signed post data.
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::auth::{Credentials, NonceGenerator};
    use crate::descriptor::{EXECUTIONS, OPEN_POSITIONS, TICKERS};
    use crate::domain::Timestamp;
    use crate::http_client::{HttpError, HttpResponse};
    use crate::retry::RetryConfig;

    #[derive(Default)]
    struct RecordingHttpClient {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<HttpResponse>>,
    }

    impl RecordingHttpClient {
        fn with_responses(responses: Vec<HttpResponse>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
            }
        }

        fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().expect("mutex poisoned").clone()
        }
    }

    impl HttpClient for RecordingHttpClient {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            self.requests.lock().expect("mutex poisoned").push(request);
            let response = self
                .responses
                .lock()
                .expect("mutex poisoned")
                .pop_front()
                .unwrap_or_else(|| HttpResponse::ok_json("{}"));
            Box::pin(async move { Ok(response) })
        }
    }

    fn signer() -> Arc<Signer> {
        Arc::new(
            Signer::with_nonce_generator(
                &Credentials::new("public", "c2VjcmV0LWtleS1mb3ItdGVzdHM="),
                NonceGenerator::with_clock(|| 1_700_000_000_000),
            )
            .expect("valid credentials"),
        )
    }

    #[test]
    fn query_is_sorted_encoded_and_filtered() {
        let mut filters = BTreeMap::new();
        filters.insert(String::from("tradeable"), String::from("PF_XBTUSD"));
        filters.insert(String::from("type"), String::from("ignored"));
        let request = PageRequest {
            since: Some(Timestamp::from_millis(1_000)),
            continuation_token: Some(String::from("a+b/c=")),
            page_size: Some(500),
            filters,
            ..PageRequest::default()
        };

        assert_eq!(
            canonical_query(&query_params(&EXECUTIONS, &request)),
            "continuation_token=a%2Bb%2Fc%3D&count=500&since=1000&tradeable=PF_XBTUSD"
        );
        assert_eq!(canonical_query(&query_params(&TICKERS, &request)), "");
    }

    #[tokio::test]
    async fn private_requests_carry_signature_over_query_and_stripped_path() {
        let http = Arc::new(RecordingHttpClient::with_responses(vec![HttpResponse::ok_json(
            r#"{"openPositions":[]}"#,
        )]));
        let signer = signer();
        let client = KrakenFuturesClient::new(http.clone())
            .with_base_url("https://futures.test/")
            .with_signer(Arc::clone(&signer));

        let outcome = client
            .get(&OPEN_POSITIONS, &PageRequest::default())
            .await
            .expect("fetch");

        assert_eq!(outcome, FetchOutcome::Payload(json!({"openPositions": []})));
        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].url,
            "https://futures.test/derivatives/api/v3/openpositions"
        );
        let nonce = requests[0].headers.get("nonce").expect("nonce header");
        assert_eq!(
            requests[0].headers.get("authent"),
            Some(&signer.signature("", nonce, "/api/v3/openpositions"))
        );
        assert_eq!(requests[0].headers.get("apikey").map(String::as_str), Some("public"));
    }

    #[tokio::test]
    async fn public_requests_are_not_signed() {
        let http = Arc::new(RecordingHttpClient::default());
        let client = KrakenFuturesClient::new(http.clone());

        client
            .get(&TICKERS, &PageRequest::default())
            .await
            .expect("fetch");

        let requests = http.requests();
        assert_eq!(requests[0].url, "https://futures.kraken.com/derivatives/api/v3/tickers");
        assert!(requests[0].headers.is_empty());
    }

    #[tokio::test]
    async fn private_resource_without_signer_fails_before_any_request() {
        let http = Arc::new(RecordingHttpClient::default());
        let client = KrakenFuturesClient::new(http.clone());

        let err = client
            .get(&EXECUTIONS, &PageRequest::default())
            .await
            .expect_err("must fail");

        assert!(matches!(err, SyncError::MissingCredentials { .. }));
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn every_retry_attempt_uses_a_fresh_nonce() {
        let http = Arc::new(RecordingHttpClient::with_responses(vec![
            HttpResponse::with_status(503, ""),
            HttpResponse::ok_json(r#"{"elements":[]}"#),
        ]));
        let client = KrakenFuturesClient::new(http.clone())
            .with_signer(signer())
            .with_retry_policy(RetryPolicy::new(RetryConfig::fixed(
                std::time::Duration::ZERO,
                3,
            )));

        client
            .get(&EXECUTIONS, &PageRequest::default())
            .await
            .expect("recovers");

        let nonces: Vec<_> = http
            .requests()
            .iter()
            .map(|request| request.headers.get("nonce").cloned().expect("nonce"))
            .collect();
        assert_eq!(nonces.len(), 2);
        assert_ne!(nonces[0], nonces[1]);
    }
}
