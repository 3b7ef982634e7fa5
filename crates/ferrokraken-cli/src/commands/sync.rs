use std::path::Path;
use std::sync::Arc;

use ferrokraken_core::{
    credentials_from_env, parse_filter, CursorStore, KrakenFuturesClient, MemoryCursorStore,
    MemorySink, Orchestrator, RecordSink, ReqwestHttpClient, ResourceCatalog, Signer,
    SyncConfig, SyncReport, Timestamp,
};
use ferrokraken_warehouse::{Warehouse, WarehouseSink};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::SyncArgs;
use crate::error::{CliError, EXIT_CANCELLED, EXIT_SYNC_FAILED};
use crate::shutdown::ShutdownCoordinator;

use super::{open_warehouse, warehouse_config, CommandOutcome};

#[derive(Debug, Serialize)]
struct SyncResponseData {
    run_id: String,
    dry_run: bool,
    #[serde(flatten)]
    report: SyncReport,
}

pub async fn run(args: &SyncArgs, db: Option<&Path>) -> Result<CommandOutcome, CliError> {
    let catalog = ResourceCatalog::standard();
    let config = build_config(args, SyncConfig::from_env())?;
    config.validate(&catalog)?;
    catalog.select(&args.resources)?;

    let signer = match credentials_from_env() {
        Some(credentials) => Some(Arc::new(Signer::new(&credentials)?)),
        None => {
            warn!("no API credentials in the environment; private resources will fail");
            None
        }
    };
    let client = KrakenFuturesClient::from_config(
        &config,
        Arc::new(ReqwestHttpClient::new()),
        signer,
    );

    let run_id = Uuid::new_v4().to_string();
    let (sink, cursors) = destinations(args.dry_run, db, &run_id)?;
    let orchestrator = Orchestrator::new(catalog, Arc::new(client), sink, cursors, config);

    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    shutdown.register_handlers();
    info!(run_id = %run_id, dry_run = args.dry_run, "sync started");
    let report = orchestrator
        .run(&args.resources, &shutdown.cancel_token())
        .await?;
    info!(
        run_id = %run_id,
        success = report.success,
        records = report.records_written,
        "sync finished"
    );

    let exit_code = exit_code_for(&report, shutdown.is_shutdown_requested());
    let data = serde_json::to_value(SyncResponseData {
        run_id,
        dry_run: args.dry_run,
        report,
    })?;
    Ok(CommandOutcome::ok(data).with_exit_code(exit_code))
}

/// Applies command-line overrides on top of `base`.
fn build_config(args: &SyncArgs, base: SyncConfig) -> Result<SyncConfig, CliError> {
    let mut config = base;
    if let Some(since) = &args.since {
        config = config.with_start_timestamp(Some(Timestamp::parse(since)?));
    }
    if let Some(page_size) = args.page_size {
        config = config.with_page_size(Some(page_size));
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_max_concurrent_resources(concurrency);
    }
    if let Some(requests_per_second) = args.requests_per_second {
        config = config.with_requests_per_second(requests_per_second);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_request_timeout_ms(timeout_ms);
    }
    for filter in &args.filters {
        let (resource, param, value) = parse_filter(filter)?;
        config = config.with_filter(resource, param, value);
    }
    Ok(config)
}

/// Warehouse-backed sink and cursors, or in-memory ones seeded from an existing warehouse
/// for a dry run. A dry run never creates or migrates the database.
fn destinations(
    dry_run: bool,
    db: Option<&Path>,
    run_id: &str,
) -> Result<(Arc<dyn RecordSink>, Arc<dyn CursorStore>), CliError> {
    if !dry_run {
        let warehouse = open_warehouse(db)?;
        let sink = WarehouseSink::new(warehouse.clone(), run_id);
        return Ok((Arc::new(sink), Arc::new(warehouse)));
    }

    let states = match Warehouse::open_existing(warehouse_config(db))? {
        Some(warehouse) if warehouse.has_table("sync_state")? => warehouse.list_cursors()?,
        _ => Default::default(),
    };
    Ok((
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCursorStore::with_states(states)),
    ))
}

fn exit_code_for(report: &SyncReport, shutdown_requested: bool) -> u8 {
    if report.cancelled || shutdown_requested {
        EXIT_CANCELLED
    } else if !report.success {
        EXIT_SYNC_FAILED
    } else {
        0
    }
}
