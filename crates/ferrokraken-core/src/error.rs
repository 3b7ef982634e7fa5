use thiserror::Error;

/// Validation errors for operator-supplied inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("timestamp must be epoch seconds, epoch milliseconds, or ISO-8601: '{value}'")]
    InvalidTimestamp { value: String },

    #[error(
        "unknown resource '{name}', expected one of executions, account_log, position_history, tickers, open_positions"
    )]
    UnknownResource { name: String },

    #[error("filter must look like resource.param=value: '{value}'")]
    MalformedFilter { value: String },
    #[error("resource '{resource}' does not accept filter '{param}'")]
    UnsupportedFilter { resource: String, param: String },

    #[error("page size must be greater than zero")]
    ZeroPageSize,
    #[error("max concurrent resources must be greater than zero")]
    ZeroConcurrency,
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("base url must start with http:// or https://: '{value}'")]
    InvalidBaseUrl { value: String },
}

/// Failure reported by a cursor store or record sink implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Fatal errors that end the sync of a single resource.
///
/// Non-fatal conditions (permission denials, malformed records, the fallback page cap)
/// are reported as warnings on the window report instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("auth configuration error: {0}")]
    AuthConfiguration(String),

    #[error("resource '{resource}' requires API credentials")]
    MissingCredentials { resource: String },

    #[error("rate limit still exceeded for {path} after {attempts} attempts")]
    RateLimitExceeded { path: String, attempts: u32 },

    #[error("transient failure for {path} persisted after {attempts} attempts: {message}")]
    TransientFetch {
        path: String,
        attempts: u32,
        message: String,
    },

    #[error("{path} returned HTTP {status}: {body}")]
    Http {
        path: String,
        status: u16,
        body: String,
    },

    #[error("{path} returned an error payload: {message}")]
    Api { path: String, message: String },

    #[error("request to {path} could not be sent: {message}")]
    Transport { path: String, message: String },

    #[error("cursor persistence failed for '{resource}': {message}")]
    CursorPersistence { resource: String, message: String },

    #[error("sink write failed for '{resource}': {message}")]
    Sink { resource: String, message: String },

    #[error("sync of '{resource}' was cancelled")]
    Cancelled { resource: String },

    #[error("resource '{resource}' is already being synced")]
    ResourceBusy { resource: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl SyncError {
    /// Stable machine-readable code, used in reports and logs.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AuthConfiguration(_) => "auth_configuration",
            Self::MissingCredentials { .. } => "missing_credentials",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::TransientFetch { .. } => "transient_fetch",
            Self::Http { .. } => "http_status",
            Self::Api { .. } => "api_error",
            Self::Transport { .. } => "transport",
            Self::CursorPersistence { .. } => "cursor_persistence",
            Self::Sink { .. } => "sink",
            Self::Cancelled { .. } => "cancelled",
            Self::ResourceBusy { .. } => "resource_busy",
            Self::Validation(_) => "validation",
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn when_error_is_cancelled_system_reports_cancelled_code() {
        let error = SyncError::Cancelled {
            resource: String::from("executions"),
        };

        assert!(error.is_cancelled());
        assert_eq!(error.code(), "cancelled");
        assert_eq!(error.to_string(), "sync of 'executions' was cancelled");
    }

    #[test]
    fn when_validation_error_is_wrapped_system_keeps_message() {
        let error = SyncError::from(ValidationError::ZeroPageSize);

        assert_eq!(error.code(), "validation");
        assert_eq!(error.to_string(), "page size must be greater than zero");
    }
}
