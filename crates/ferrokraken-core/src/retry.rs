//! Retry logic with exponential backoff and jitter, plus response classification.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::http_client::{HttpError, HttpResponse};
use crate::SyncError;

/// Longest body excerpt carried into error messages.
const BODY_EXCERPT_CHARS: usize = 200;

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, then scaled by a uniform
    /// factor in `[1 - jitter_ratio, 1 + jitter_ratio]`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter_ratio: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(2),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter_ratio: 0.1,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter_ratio,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let ratio = jitter_ratio.clamp(0.0, 1.0);
                let offset = (fastrand::f64() * 2.0 - 1.0) * ratio;
                Duration::from_secs_f64((seconds * (1.0 + offset)).max(0.0))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Async sleep seam so tests can observe delays without waiting.
pub trait Sleeper: Send + Sync {
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Successful end state of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Payload(Value),
    /// The endpoint answered with an error payload mentioning permissions.
    PermissionDenied { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransientFailure {
    RateLimited,
    ServerStatus(u16),
    Transport(String),
    InvalidJson(String),
}

impl Display for TransientFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => f.write_str("HTTP 429 rate limited"),
            Self::ServerStatus(status) => write!(f, "HTTP {status}"),
            Self::Transport(message) => f.write_str(message),
            Self::InvalidJson(message) => write!(f, "invalid JSON payload: {message}"),
        }
    }
}

#[derive(Debug)]
enum Classified {
    Done(FetchOutcome),
    Transient(TransientFailure),
    Fatal(SyncError),
}

/// Runs a request closure under the retry policy, re-invoking it for each attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Each attempt calls `request` again, so signatures and nonces are fresh per attempt.
    pub async fn execute<F, Fut>(&self, path: &str, mut request: F) -> Result<FetchOutcome, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, HttpError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match classify(path, request().await) {
                Classified::Done(outcome) => {
                    if attempt > 0 {
                        info!(path, attempts = attempt + 1, "request recovered after retry");
                    }
                    return Ok(outcome);
                }
                Classified::Fatal(error) => return Err(error),
                Classified::Transient(failure) => {
                    if attempt >= self.config.max_retries {
                        return Err(exhausted(path, attempt + 1, failure));
                    }
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        path,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        reason = %failure,
                        "transient failure, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn exhausted(path: &str, attempts: u32, failure: TransientFailure) -> SyncError {
    match failure {
        TransientFailure::RateLimited => SyncError::RateLimitExceeded {
            path: path.to_owned(),
            attempts,
        },
        other => SyncError::TransientFetch {
            path: path.to_owned(),
            attempts,
            message: other.to_string(),
        },
    }
}

fn classify(path: &str, result: Result<HttpResponse, HttpError>) -> Classified {
    let response = match result {
        Ok(response) => response,
        Err(error) if error.retryable() => {
            return Classified::Transient(TransientFailure::Transport(error.message().to_owned()))
        }
        Err(error) => {
            return Classified::Fatal(SyncError::Transport {
                path: path.to_owned(),
                message: error.message().to_owned(),
            })
        }
    };

    match response.status {
        429 => return Classified::Transient(TransientFailure::RateLimited),
        403 => {
            return Classified::Done(FetchOutcome::PermissionDenied {
                message: excerpt(&response.body),
            })
        }
        status if status >= 500 => {
            return Classified::Transient(TransientFailure::ServerStatus(status))
        }
        _ if !response.is_success() => {
            return Classified::Fatal(SyncError::Http {
                path: path.to_owned(),
                status: response.status,
                body: excerpt(&response.body),
            })
        }
        _ => {}
    }

    let payload = match serde_json::from_str::<Value>(&response.body) {
        Ok(Value::Null) => {
            return Classified::Transient(TransientFailure::InvalidJson(String::from(
                "empty payload",
            )))
        }
        Ok(payload) => payload,
        Err(error) => {
            return Classified::Transient(TransientFailure::InvalidJson(error.to_string()))
        }
    };

    match error_payload_message(&payload) {
        Some(message) if message.to_ascii_lowercase().contains("permission") => {
            Classified::Done(FetchOutcome::PermissionDenied { message })
        }
        Some(message) => Classified::Fatal(SyncError::Api {
            path: path.to_owned(),
            message,
        }),
        None => Classified::Done(FetchOutcome::Payload(payload)),
    }
}

/// Message of an error-shaped payload (`result == "error"` or `success == false`).
fn error_payload_message(payload: &Value) -> Option<String> {
    let is_error = payload
        .get("result")
        .and_then(Value::as_str)
        .is_some_and(|result| result.eq_ignore_ascii_case("error"))
        || payload.get("success") == Some(&Value::Bool(false));
    if !is_error {
        return None;
    }

    let message = payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| excerpt(&payload.to_string()));
    Some(message)
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}
