use std::collections::BTreeMap;
use std::env;

use crate::auth::Credentials;
use crate::client::DEFAULT_BASE_URL;
use crate::descriptor::ResourceCatalog;
use crate::domain::Timestamp;
use crate::http_client::DEFAULT_TIMEOUT_MS;
use crate::pagination::FALLBACK_PAGE_CAP;
use crate::retry::RetryConfig;
use crate::throttling::DEFAULT_REQUESTS_PER_SECOND;
use crate::ValidationError;

pub const DEFAULT_MAX_CONCURRENT_RESOURCES: usize = 2;

const API_KEY_VARS: [&str; 2] = ["KRAKEN_FUTURES_API_KEY", "KRAKEN_FUTURES__API_KEY"];
const API_SECRET_VARS: [&str; 2] = ["KRAKEN_FUTURES_API_SECRET", "KRAKEN_FUTURES__API_SECRET"];
const BASE_URL_VAR: &str = "KRAKEN_FUTURES_BASE_URL";

/// Run-wide sync settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub base_url: String,
    /// Overrides each resource's default page size.
    pub page_size: Option<usize>,
    /// Initial `since` for resources without a committed timestamp.
    pub start_timestamp: Option<Timestamp>,
    pub request_timeout_ms: u64,
    pub max_concurrent_resources: usize,
    /// Aggregate across all resources; `0` disables throttling.
    pub requests_per_second: u32,
    pub retry: RetryConfig,
    pub fallback_page_cap: u32,
    /// resource name → (param → value)
    pub filters: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            page_size: None,
            start_timestamp: None,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_concurrent_resources: DEFAULT_MAX_CONCURRENT_RESOURCES,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            retry: RetryConfig::default(),
            fallback_page_cap: FALLBACK_PAGE_CAP,
            filters: BTreeMap::new(),
        }
    }
}

impl SyncConfig {
    /// Defaults plus `KRAKEN_FUTURES_BASE_URL` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base_url) = non_empty_var(BASE_URL_VAR) {
            config.base_url = base_url;
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_start_timestamp(mut self, start_timestamp: Option<Timestamp>) -> Self {
        self.start_timestamp = start_timestamp;
        self
    }

    pub fn with_request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    pub fn with_max_concurrent_resources(mut self, max_concurrent_resources: usize) -> Self {
        self.max_concurrent_resources = max_concurrent_resources;
        self
    }

    pub fn with_requests_per_second(mut self, requests_per_second: u32) -> Self {
        self.requests_per_second = requests_per_second;
        self
    }

    pub fn with_fallback_page_cap(mut self, fallback_page_cap: u32) -> Self {
        self.fallback_page_cap = fallback_page_cap;
        self
    }

    pub fn with_filter(
        mut self,
        resource: impl Into<String>,
        param: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.filters
            .entry(resource.into())
            .or_default()
            .insert(param.into(), value.into());
        self
    }

    pub fn filters_for(&self, resource: &str) -> BTreeMap<String, String> {
        self.filters.get(resource).cloned().unwrap_or_default()
    }

    pub fn validate(&self, catalog: &ResourceCatalog) -> Result<(), ValidationError> {
        if self.page_size == Some(0) {
            return Err(ValidationError::ZeroPageSize);
        }
        if self.max_concurrent_resources == 0 {
            return Err(ValidationError::ZeroConcurrency);
        }
        if self.request_timeout_ms == 0 {
            return Err(ValidationError::ZeroTimeout);
        }
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(ValidationError::InvalidBaseUrl {
                value: self.base_url.clone(),
            });
        }

        for (resource, params) in &self.filters {
            let descriptor = catalog
                .get(resource)
                .ok_or_else(|| ValidationError::UnknownResource {
                    name: resource.clone(),
                })?;
            if let Some(param) = params.keys().find(|param| !descriptor.accepts_filter(param)) {
                return Err(ValidationError::UnsupportedFilter {
                    resource: resource.clone(),
                    param: param.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Splits `resource.param=value`.
pub fn parse_filter(input: &str) -> Result<(String, String, String), ValidationError> {
    let malformed = || ValidationError::MalformedFilter {
        value: input.to_owned(),
    };
    let (target, value) = input.split_once('=').ok_or_else(malformed)?;
    let (resource, param) = target.split_once('.').ok_or_else(malformed)?;
    let (resource, param) = (resource.trim(), param.trim());
    if resource.is_empty() || param.is_empty() || value.is_empty() {
        return Err(malformed());
    }
    Ok((resource.to_owned(), param.to_owned(), value.to_owned()))
}

/// Credentials from the environment, single-underscore names first.
pub fn credentials_from_env() -> Option<Credentials> {
    let api_key = API_KEY_VARS.iter().find_map(|name| non_empty_var(name))?;
    let api_secret = API_SECRET_VARS.iter().find_map(|name| non_empty_var(name))?;
    Some(Credentials::new(api_key, api_secret))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
