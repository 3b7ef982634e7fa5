//! Runs resource syncs concurrently and owns cursor commits.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::cursor::{CursorState, CursorStore};
use crate::descriptor::{ResourceCatalog, ResourceDescriptor};
use crate::pagination::{PageFetcher, PaginationEngine, WindowReport, WindowWarning};
use crate::sink::{run_blocking, RecordSink};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    pub resource: String,
    pub status: ResourceStatus,
    /// Committed cursor on success, the untouched prior cursor otherwise.
    pub cursor: Option<CursorState>,
    pub records_written: usize,
    pub skipped_records: usize,
    pub malformed_records: usize,
    pub pages: u32,
    pub fallback_pages: u32,
    pub warnings: Vec<WindowWarning>,
    pub error_code: Option<&'static str>,
    pub error: Option<String>,
}

impl ResourceReport {
    fn succeeded(descriptor: &ResourceDescriptor, cursor: Option<CursorState>, window: WindowReport) -> Self {
        Self {
            resource: descriptor.name.to_owned(),
            status: ResourceStatus::Succeeded,
            cursor,
            records_written: window.records_written,
            skipped_records: window.skipped_records,
            malformed_records: window.malformed_records,
            pages: window.pages,
            fallback_pages: window.fallback_pages,
            warnings: window.warnings,
            error_code: None,
            error: None,
        }
    }

    fn failed(name: &str, cursor: Option<CursorState>, error: &SyncError) -> Self {
        let status = if error.is_cancelled() {
            ResourceStatus::Cancelled
        } else {
            ResourceStatus::Failed
        };
        Self {
            resource: name.to_owned(),
            status,
            cursor,
            records_written: 0,
            skipped_records: 0,
            malformed_records: 0,
            pages: 0,
            fallback_pages: 0,
            warnings: Vec::new(),
            error_code: Some(error.code()),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResourceStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub cancelled: bool,
    pub records_written: usize,
    pub skipped_records: usize,
    pub malformed_records: usize,
    pub resources: Vec<ResourceReport>,
}

impl SyncReport {
    pub fn from_resources(resources: Vec<ResourceReport>) -> Self {
        Self {
            success: resources.iter().all(ResourceReport::is_success),
            cancelled: resources
                .iter()
                .any(|report| report.status == ResourceStatus::Cancelled),
            records_written: resources.iter().map(|report| report.records_written).sum(),
            skipped_records: resources.iter().map(|report| report.skipped_records).sum(),
            malformed_records: resources.iter().map(|report| report.malformed_records).sum(),
            resources,
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceReport> {
        self.resources.iter().find(|report| report.resource == name)
    }
}

/// Names of resources currently being synced in this process.
#[derive(Debug, Default)]
struct InFlight {
    names: Mutex<HashSet<&'static str>>,
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    name: &'static str,
}

impl InFlight {
    fn claim(&self, name: &'static str) -> Option<InFlightGuard<'_>> {
        let mut names = self.names.lock().expect("in-flight set should not be poisoned");
        names
            .insert(name)
            .then(|| InFlightGuard { owner: self, name })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .names
            .lock()
            .expect("in-flight set should not be poisoned")
            .remove(self.name);
    }
}

struct OrchestratorInner {
    catalog: ResourceCatalog,
    engine: PaginationEngine,
    cursors: Arc<dyn CursorStore>,
    config: SyncConfig,
    in_flight: InFlight,
}

/// Cheap to clone; clones share the in-flight guard and collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        catalog: ResourceCatalog,
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn RecordSink>,
        cursors: Arc<dyn CursorStore>,
        config: SyncConfig,
    ) -> Self {
        let engine = PaginationEngine::new(fetcher, sink)
            .with_page_size(config.page_size)
            .with_fallback_cap(config.fallback_page_cap);
        Self {
            inner: Arc::new(OrchestratorInner {
                catalog,
                engine,
                cursors,
                config,
                in_flight: InFlight::default(),
            }),
        }
    }

    /// Syncs the selected resources (all when empty), at most
    /// `max_concurrent_resources` at a time. Reports keep selection order.
    pub async fn run<S: AsRef<str>>(
        &self,
        selection: &[S],
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        self.inner.config.validate(&self.inner.catalog)?;
        let descriptors = self.inner.catalog.select(selection)?;
        let semaphore = Arc::new(Semaphore::new(
            self.inner.config.max_concurrent_resources.max(1),
        ));
        info!(
            resources = descriptors.len(),
            concurrency = self.inner.config.max_concurrent_resources,
            "starting sync run"
        );

        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let name = descriptor.name;
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                this.sync_resource(&descriptor, &cancel).await
            });
            handles.push((name, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(join_error) => {
                    error!(resource = name, error = %join_error, "resource task aborted");
                    ResourceReport::failed(
                        name,
                        None,
                        &SyncError::Sink {
                            resource: name.to_owned(),
                            message: format!("task aborted: {join_error}"),
                        },
                    )
                }
            };
            reports.push(report);
        }

        let report = SyncReport::from_resources(reports);
        info!(
            success = report.success,
            records = report.records_written,
            skipped = report.skipped_records,
            malformed = report.malformed_records,
            "sync run finished"
        );
        Ok(report)
    }

    /// Syncs one resource. Fails fast with `ResourceBusy` when it is already running.
    pub async fn sync_resource(
        &self,
        descriptor: &ResourceDescriptor,
        cancel: &CancellationToken,
    ) -> ResourceReport {
        let Some(_guard) = self.inner.in_flight.claim(descriptor.name) else {
            let busy = SyncError::ResourceBusy {
                resource: descriptor.name.to_owned(),
            };
            warn!(resource = descriptor.name, "resource already syncing");
            return ResourceReport::failed(descriptor.name, None, &busy);
        };

        let cursors = Arc::clone(&self.inner.cursors);
        let name = descriptor.name;
        let prior = match run_blocking(move || cursors.load(name)).await {
            Ok(prior) => prior,
            Err(store_error) => {
                let error = SyncError::CursorPersistence {
                    resource: descriptor.name.to_owned(),
                    message: store_error.message().to_owned(),
                };
                error!(resource = descriptor.name, %error, "cursor load failed");
                return ResourceReport::failed(descriptor.name, None, &error);
            }
        };

        let filters = self.inner.config.filters_for(descriptor.name);
        let outcome = if descriptor.is_incremental() {
            self.sync_incremental(descriptor, prior.as_ref(), &filters, cancel)
                .await
        } else {
            self.inner
                .engine
                .fetch_snapshot(descriptor, &filters, cancel)
                .await
                .map(|window| (None, window))
        };

        match outcome {
            Ok((cursor, window)) => {
                info!(
                    resource = descriptor.name,
                    records = window.records_written,
                    warnings = window.warnings.len(),
                    "resource synced"
                );
                ResourceReport::succeeded(descriptor, cursor.or(prior), window)
            }
            Err(error) => {
                if error.is_cancelled() {
                    warn!(resource = descriptor.name, "resource sync cancelled");
                } else {
                    error!(resource = descriptor.name, code = error.code(), %error, "resource sync failed");
                }
                ResourceReport::failed(descriptor.name, prior, &error)
            }
        }
    }

    async fn sync_incremental(
        &self,
        descriptor: &ResourceDescriptor,
        prior: Option<&CursorState>,
        filters: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(Option<CursorState>, WindowReport), SyncError> {
        let mut start = prior.cloned().unwrap_or_default();
        start.continuation_token = None;
        start.fallback_page_count = 0;
        if start.last_timestamp.is_none() {
            start.last_timestamp = self.inner.config.start_timestamp;
        }

        let window = self
            .inner
            .engine
            .run_window(descriptor, &start, filters, cancel)
            .await?;

        let committed = window.next_cursor.clone();
        let cursors = Arc::clone(&self.inner.cursors);
        let (name, state) = (descriptor.name, committed.clone());
        run_blocking(move || cursors.commit(name, &state))
            .await
            .map_err(|store_error| SyncError::CursorPersistence {
                resource: descriptor.name.to_owned(),
                message: store_error.message().to_owned(),
            })?;
        Ok((Some(committed), window))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("resources", &self.inner.catalog.names())
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}
