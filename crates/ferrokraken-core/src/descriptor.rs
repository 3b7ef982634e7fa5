//! Static resource descriptors for the supported Kraken Futures endpoints.

use serde::Serialize;
use serde_json::Value;

use crate::ValidationError;

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// How fetched records land in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Incremental: merged by natural key, cursor advances.
    Append,
    /// Snapshot: the previous contents are discarded.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordShape {
    Flat,
    /// `event.PositionUpdate` is lifted to the top level.
    PositionUpdate,
}

/// Query parameter names; `None` means the endpoint has no such parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryParamNames {
    pub since: Option<&'static str>,
    pub before: Option<&'static str>,
    pub continuation_token: Option<&'static str>,
    pub page_size: Option<&'static str>,
}

impl QueryParamNames {
    const HISTORY: Self = Self {
        since: Some("since"),
        before: Some("before"),
        continuation_token: Some("continuation_token"),
        page_size: Some("count"),
    };

    const NONE: Self = Self {
        since: None,
        before: None,
        continuation_token: None,
        page_size: None,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub name: &'static str,
    pub path: &'static str,
    pub private: bool,
    pub disposition: WriteDisposition,
    pub params: QueryParamNames,
    pub filter_params: &'static [&'static str],
    pub envelope_keys: &'static [&'static str],
    pub token_keys: &'static [&'static str],
    pub timestamp_paths: &'static [&'static str],
    pub natural_key: &'static [&'static str],
    pub supports_fallback_paging: bool,
    pub default_page_size: usize,
    pub shape: RecordShape,
}

impl ResourceDescriptor {
    pub fn is_incremental(&self) -> bool {
        self.disposition == WriteDisposition::Append
    }

    /// Item list under the first envelope key holding an array.
    pub fn envelope<'a>(&self, payload: &'a Value) -> Option<&'a [Value]> {
        self.envelope_keys
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
    }

    /// First non-blank continuation token among the declared variants.
    pub fn continuation_token(&self, payload: &Value) -> Option<String> {
        self.token_keys.iter().find_map(|key| {
            payload
                .get(*key)
                .and_then(Value::as_str)
                .filter(|token| !token.trim().is_empty())
                .map(str::to_owned)
        })
    }

    pub fn accepts_filter(&self, param: &str) -> bool {
        self.filter_params.contains(&param)
    }
}

pub const EXECUTIONS: ResourceDescriptor = ResourceDescriptor {
    name: "executions",
    path: "/api/history/v2/executions",
    private: true,
    disposition: WriteDisposition::Append,
    params: QueryParamNames::HISTORY,
    filter_params: &["tradeable"],
    envelope_keys: &["elements", "executionEvents"],
    token_keys: &["continuationToken", "continuation_token"],
    timestamp_paths: &[
        "timestamp",
        "info.timestamp",
        "takerOrder.timestamp",
        "trade.timestamp",
    ],
    natural_key: &["uid"],
    supports_fallback_paging: false,
    default_page_size: DEFAULT_PAGE_SIZE,
    shape: RecordShape::Flat,
};

pub const ACCOUNT_LOG: ResourceDescriptor = ResourceDescriptor {
    name: "account_log",
    path: "/api/history/v2/account-log",
    private: true,
    disposition: WriteDisposition::Append,
    params: QueryParamNames::HISTORY,
    filter_params: &["type"],
    envelope_keys: &["logs", "accountLog"],
    token_keys: &["continuation_token", "continuationToken"],
    timestamp_paths: &["timestamp", "date"],
    natural_key: &["booking_uid"],
    supports_fallback_paging: true,
    default_page_size: DEFAULT_PAGE_SIZE,
    shape: RecordShape::Flat,
};

pub const POSITION_HISTORY: ResourceDescriptor = ResourceDescriptor {
    name: "position_history",
    path: "/api/history/v3/positions",
    private: true,
    disposition: WriteDisposition::Append,
    params: QueryParamNames::HISTORY,
    filter_params: &["sort", "tradeable"],
    envelope_keys: &["elements"],
    token_keys: &["continuationToken", "continuation_token"],
    timestamp_paths: &["timestamp", "event.timestamp"],
    natural_key: &["executionUid", "uid"],
    supports_fallback_paging: false,
    default_page_size: DEFAULT_PAGE_SIZE,
    shape: RecordShape::PositionUpdate,
};

pub const TICKERS: ResourceDescriptor = ResourceDescriptor {
    name: "tickers",
    path: "/derivatives/api/v3/tickers",
    private: false,
    disposition: WriteDisposition::Replace,
    params: QueryParamNames::NONE,
    filter_params: &[],
    envelope_keys: &["tickers"],
    token_keys: &[],
    timestamp_paths: &["lastTime"],
    natural_key: &[],
    supports_fallback_paging: false,
    default_page_size: DEFAULT_PAGE_SIZE,
    shape: RecordShape::Flat,
};

pub const OPEN_POSITIONS: ResourceDescriptor = ResourceDescriptor {
    name: "open_positions",
    path: "/derivatives/api/v3/openpositions",
    private: true,
    disposition: WriteDisposition::Replace,
    params: QueryParamNames::NONE,
    filter_params: &[],
    envelope_keys: &["openPositions", "openpositions"],
    token_keys: &[],
    timestamp_paths: &["fillTime"],
    natural_key: &[],
    supports_fallback_paging: false,
    default_page_size: DEFAULT_PAGE_SIZE,
    shape: RecordShape::Flat,
};

/// Ordered descriptor table handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCatalog {
    descriptors: Vec<ResourceDescriptor>,
}

impl ResourceCatalog {
    pub fn new(descriptors: Vec<ResourceDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            EXECUTIONS,
            ACCOUNT_LOG,
            POSITION_HISTORY,
            TICKERS,
            OPEN_POSITIONS,
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(|descriptor| descriptor.name).collect()
    }

    /// Resolves names in request order, dropping repeats. Empty selection means all.
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<ResourceDescriptor>, ValidationError> {
        if names.is_empty() {
            return Ok(self.descriptors.clone());
        }

        let mut selected: Vec<ResourceDescriptor> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().trim();
            let descriptor = self
                .get(name)
                .ok_or_else(|| ValidationError::UnknownResource {
                    name: name.to_owned(),
                })?;
            if !selected.iter().any(|existing| existing.name == descriptor.name) {
                selected.push(descriptor.clone());
            }
        }
        Ok(selected)
    }
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
